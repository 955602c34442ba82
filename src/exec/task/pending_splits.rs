// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Pending split buckets for partitioned sources.
//!
//! One bucket per (plan node, lifespan) holds splits the scheduling loop has
//! not yet turned into runners. The explicit `Drained` marker stops the loop
//! from closing the downstream driver factory twice when a cursor revisits a
//! bucket.

use std::collections::{HashMap, HashSet};

use crate::exec::lifespan::Lifespan;
use crate::exec::split::ScheduledSplit;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SplitsState {
    /// Coordinator may still announce splits for this bucket.
    Adding,
    /// No more splits will arrive; the bucket may still hold undrained splits.
    NoMore,
    /// Closed and emptied; the driver factory has been told no-more for it.
    Drained,
}

/// Three-state split bucket. Transitions are one-way:
/// `Adding` -> `NoMore` -> `Drained`.
pub struct PendingSplits {
    state: SplitsState,
    splits: HashSet<ScheduledSplit>,
}

impl PendingSplits {
    pub fn new() -> Self {
        Self {
            state: SplitsState::Adding,
            splits: HashSet::new(),
        }
    }

    pub fn state(&self) -> SplitsState {
        self.state
    }

    pub fn add_split(&mut self, split: ScheduledSplit) {
        assert_eq!(
            self.state,
            SplitsState::Adding,
            "cannot add split after no-more-splits"
        );
        self.splits.insert(split);
    }

    /// Take every buffered split, leaving the bucket empty.
    pub fn drain(&mut self) -> HashSet<ScheduledSplit> {
        assert!(
            matches!(self.state, SplitsState::Adding | SplitsState::NoMore),
            "cannot drain a drained bucket"
        );
        std::mem::take(&mut self.splits)
    }

    /// Mark the input side closed. Idempotent; a no-op once drained.
    pub fn close_input(&mut self) {
        if self.state == SplitsState::Adding {
            self.state = SplitsState::NoMore;
        }
    }

    pub fn mark_drained(&mut self) {
        assert!(self.splits.is_empty(), "cannot mark a non-empty bucket drained");
        assert_eq!(
            self.state,
            SplitsState::NoMore,
            "bucket must be closed before it is drained"
        );
        self.state = SplitsState::Drained;
    }
}

/// All pending-split buckets of one partitioned source plan node, keyed by
/// lifespan. A plan-node-wide no-more-splits fans out to every bucket, current
/// and future.
pub struct PendingSplitsForPlanNode {
    by_lifespan: HashMap<Lifespan, PendingSplits>,
    no_more_splits: bool,
}

impl PendingSplitsForPlanNode {
    pub fn new() -> Self {
        Self {
            by_lifespan: HashMap::new(),
            no_more_splits: false,
        }
    }

    pub fn for_lifespan(&mut self, lifespan: Lifespan) -> &mut PendingSplits {
        let no_more = self.no_more_splits;
        self.by_lifespan.entry(lifespan).or_insert_with(|| {
            let mut bucket = PendingSplits::new();
            if no_more {
                bucket.close_input();
            }
            bucket
        })
    }

    pub fn add_split(&mut self, split: ScheduledSplit) {
        let lifespan = split.lifespan;
        self.for_lifespan(lifespan).add_split(split);
    }

    pub fn set_no_more_splits(&mut self) {
        if self.no_more_splits {
            return;
        }
        self.no_more_splits = true;
        for bucket in self.by_lifespan.values_mut() {
            bucket.close_input();
        }
    }

    pub fn set_no_more_splits_for_lifespan(&mut self, lifespan: Lifespan) {
        self.for_lifespan(lifespan).close_input();
    }
}

#[cfg(test)]
mod tests {
    use crate::common::ids::PlanNodeId;

    use super::*;

    fn split(seq: i64) -> ScheduledSplit {
        ScheduledSplit::data(seq, PlanNodeId::new(1), Lifespan::task_wide(), "s")
    }

    #[test]
    fn lifecycle_adding_no_more_drained() {
        let mut bucket = PendingSplits::new();
        bucket.add_split(split(1));
        bucket.add_split(split(2));
        assert_eq!(bucket.state(), SplitsState::Adding);

        let drained = bucket.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(bucket.state(), SplitsState::Adding);

        bucket.add_split(split(3));
        bucket.close_input();
        bucket.close_input();
        assert_eq!(bucket.state(), SplitsState::NoMore);
        assert_eq!(bucket.drain().len(), 1);

        bucket.mark_drained();
        assert_eq!(bucket.state(), SplitsState::Drained);
    }

    #[test]
    #[should_panic(expected = "cannot add split after no-more-splits")]
    fn add_after_close_panics() {
        let mut bucket = PendingSplits::new();
        bucket.close_input();
        bucket.add_split(split(1));
    }

    #[test]
    #[should_panic(expected = "cannot mark a non-empty bucket drained")]
    fn drained_requires_empty() {
        let mut bucket = PendingSplits::new();
        bucket.add_split(split(1));
        bucket.close_input();
        bucket.mark_drained();
    }

    #[test]
    fn plan_node_close_fans_out_to_future_buckets() {
        let mut node = PendingSplitsForPlanNode::new();
        node.add_split(ScheduledSplit::data(
            1,
            PlanNodeId::new(1),
            Lifespan::driver_group(0),
            "a",
        ));
        node.set_no_more_splits();
        assert_eq!(
            node.for_lifespan(Lifespan::driver_group(0)).state(),
            SplitsState::NoMore
        );
        // A bucket first touched after the close starts closed.
        assert_eq!(
            node.for_lifespan(Lifespan::driver_group(7)).state(),
            SplitsState::NoMore
        );
    }
}
