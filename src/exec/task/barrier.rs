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
//! Snapshot-marker barrier for partitioned source updates.
//!
//! Active only with recovery enabled. Source updates are buffered per plan
//! node; splits are released in sequence-id order, and a marker is held back
//! until every data split released before it has finished running. The gate
//! guarantees dispatch order only; capturing in-flight operator state is the
//! snapshot manager's concern.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::common::ids::PlanNodeId;
use crate::exec::lifespan::Lifespan;
use crate::exec::split::{MarkerPage, SplitPayload, TaskSource};

/// One released batch: markers to broadcast (in sequence order, always ahead
/// of the data) and a source update carrying the released data splits. The
/// no-more flags are present only when the buffered source was fully drained.
pub struct ReadySource {
    pub markers: Vec<(Lifespan, MarkerPage)>,
    pub data: TaskSource,
}

pub struct BarrierGate {
    pending_sources: HashMap<PlanNodeId, VecDeque<TaskSource>>,
    in_progress_splits: HashMap<PlanNodeId, HashSet<i64>>,
}

impl BarrierGate {
    pub fn new() -> Self {
        Self {
            pending_sources: HashMap::new(),
            in_progress_splits: HashMap::new(),
        }
    }

    pub fn ingest(&mut self, source: TaskSource) {
        self.pending_sources
            .entry(source.plan_node_id)
            .or_default()
            .push_back(source);
    }

    /// Release every batch that is currently unblocked, across all plan nodes.
    pub fn drain_ready(&mut self) -> Vec<ReadySource> {
        let plan_nodes: Vec<PlanNodeId> = self.pending_sources.keys().copied().collect();
        let mut ready = Vec::new();
        for plan_node_id in plan_nodes {
            while let Some(batch) = self.process_head(plan_node_id) {
                ready.push(batch);
            }
        }
        ready
    }

    /// Record that a split-lifecycle driver finished its split. Returns true
    /// when the plan node's in-progress set drained and buffered sources are
    /// waiting, i.e. the caller should drain the gate again.
    pub fn on_split_completed(&mut self, plan_node_id: PlanNodeId, sequence_id: i64) -> bool {
        let drained = match self.in_progress_splits.get_mut(&plan_node_id) {
            Some(in_progress) => {
                in_progress.remove(&sequence_id);
                in_progress.is_empty()
            }
            None => return false,
        };
        drained
            && self
                .pending_sources
                .get(&plan_node_id)
                .is_some_and(|queue| !queue.is_empty())
    }

    fn process_head(&mut self, plan_node_id: PlanNodeId) -> Option<ReadySource> {
        let queue = self.pending_sources.get_mut(&plan_node_id)?;
        let source = queue.pop_front()?;
        if source.splits.is_empty() {
            // Carries only flags; those pass the barrier unconditionally.
            return Some(ReadySource {
                markers: Vec::new(),
                data: source,
            });
        }

        // Order may have been lost upstream; restore it by sequence id.
        let mut splits = source.splits.clone();
        splits.sort_by_key(|s| s.sequence_id);

        let in_progress = self.in_progress_splits.entry(plan_node_id).or_default();
        let mut ready_len = 0;
        for split in &splits {
            if split.is_marker() {
                if !in_progress.is_empty() {
                    // Wait for previously released data splits to finish.
                    break;
                }
            } else {
                in_progress.insert(split.sequence_id);
            }
            ready_len += 1;
        }

        if ready_len == 0 {
            queue.push_front(source);
            return None;
        }

        let has_left = ready_len < splits.len();
        if has_left {
            // The suffix keeps the terminators; they apply only once the whole
            // update has passed the barrier.
            queue.push_front(TaskSource::new(
                plan_node_id,
                splits.split_off(ready_len),
                source.no_more_splits_for_lifespan.clone(),
                source.no_more_splits,
            ));
        }

        let mut markers = Vec::new();
        let mut data = Vec::new();
        for split in splits {
            match split.payload {
                SplitPayload::Marker { snapshot_id } => {
                    // Snapshot id 0 is the bootstrap marker used to trigger
                    // task creation; it is dropped without broadcast.
                    if snapshot_id != 0 {
                        markers.push((split.lifespan, MarkerPage::new(snapshot_id)));
                    }
                }
                SplitPayload::Data { .. } => data.push(split),
            }
        }

        Some(ReadySource {
            markers,
            data: TaskSource::new(
                plan_node_id,
                data,
                if has_left {
                    HashSet::new()
                } else {
                    source.no_more_splits_for_lifespan
                },
                !has_left && source.no_more_splits,
            ),
        })
    }
}
