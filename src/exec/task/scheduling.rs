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
//! Per-lifespan scheduling cursors over the partitioned source order.
//!
//! Every lifespan scans the partitioned source pipelines in one fixed order.
//! The manager's watermark is the highest cursor ordinal any lifespan has
//! reached; a lifespan that is structurally incompatible with the plan node at
//! its cursor may skip it only once the watermark shows another lifespan has
//! opened that ordinal. This keeps build-side readiness consistent for
//! co-located joins without letting incompatible lifespans stall forever.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::exec::lifespan::Lifespan;
use crate::exec::task::status::Status;
use crate::novatask_logging::debug;

struct SchedulingLifespan {
    ordinal: usize,
    driver_group_scheduled: bool,
}

/// Cursor-per-lifespan scheduler state. All methods are called under the task
/// lock.
pub struct SchedulingLifespanManager {
    source_start_order: Vec<PlanNodeId>,
    grouped_scan_nodes: HashSet<PlanNodeId>,
    status: Arc<Status>,
    max_scheduled_ordinal: usize,
    lifespans: HashMap<Lifespan, SchedulingLifespan>,
    completed: HashSet<Lifespan>,
    no_more_splits_nodes: HashSet<PlanNodeId>,
}

impl SchedulingLifespanManager {
    pub fn new(
        source_start_order: Vec<PlanNodeId>,
        grouped_scan_nodes: HashSet<PlanNodeId>,
        status: Arc<Status>,
    ) -> Self {
        Self {
            source_start_order,
            grouped_scan_nodes,
            status,
            max_scheduled_ordinal: 0,
            lifespans: HashMap::new(),
            completed: HashSet::new(),
            no_more_splits_nodes: HashSet::new(),
        }
    }

    pub fn source_start_order(&self) -> &[PlanNodeId] {
        &self.source_start_order
    }

    pub fn is_scan_grouped(&self, plan_node_id: PlanNodeId) -> bool {
        self.grouped_scan_nodes.contains(&plan_node_id)
    }

    pub fn add_lifespan_if_absent(&mut self, lifespan: Lifespan) {
        // Source updates are cumulative; a lifespan the manager already
        // tracks, or has already scheduled to completion, must not be
        // re-registered at cursor zero.
        if self.lifespans.contains_key(&lifespan) || self.completed.contains(&lifespan) {
            return;
        }
        assert!(
            !self.status.is_no_more_lifespans(),
            "cannot add lifespan {} after no-more-lifespans",
            lifespan
        );
        assert!(
            !self.source_start_order.is_empty(),
            "cannot add lifespan to a task with no partitioned sources"
        );
        debug!("Lifespan registered for scheduling: lifespan={}", lifespan);
        self.lifespans.insert(
            lifespan,
            SchedulingLifespan {
                ordinal: 0,
                driver_group_scheduled: false,
            },
        );
    }

    /// Record a coordinator-level no-more-splits for one partitioned source.
    /// When every source is closed, no new lifespan can ever be introduced.
    pub fn no_more_splits(&mut self, plan_node_id: PlanNodeId) {
        if !self.source_start_order.contains(&plan_node_id) {
            return;
        }
        self.no_more_splits_nodes.insert(plan_node_id);
        if self.no_more_splits_nodes.len() == self.source_start_order.len() {
            self.status.set_no_more_lifespans();
        }
    }

    /// Lifespans still making scheduling progress, retiring finished ones.
    /// Returned in lifespan order to keep scheduling deterministic.
    pub fn active_lifespans(&mut self) -> Vec<Lifespan> {
        let done: Vec<Lifespan> = self
            .lifespans
            .iter()
            .filter(|(_, s)| s.ordinal >= self.source_start_order.len())
            .map(|(l, _)| *l)
            .collect();
        for lifespan in done {
            self.lifespans.remove(&lifespan);
            self.completed.insert(lifespan);
        }
        let mut active: Vec<Lifespan> = self.lifespans.keys().copied().collect();
        active.sort();
        active
    }

    /// The plan node this lifespan should schedule next. `None` means either
    /// the lifespan is done, or it is blocked on an incompatible plan node no
    /// other lifespan has opened yet.
    pub fn scheduling_plan_node(&mut self, lifespan: Lifespan) -> Option<PlanNodeId> {
        loop {
            let ordinal = self.state(lifespan).ordinal;
            if ordinal >= self.source_start_order.len() {
                return None;
            }
            let plan_node_id = self.source_start_order[ordinal];
            // Compatible pairs: grouped scan with a driver group, ungrouped
            // scan with the task-wide lifespan.
            if self.is_scan_grouped(plan_node_id) != lifespan.is_task_wide() {
                return Some(plan_node_id);
            }
            if self.max_scheduled_ordinal == ordinal {
                // No lifespan has opened this ordinal; blocked until one does.
                return None;
            }
            self.next_plan_node(lifespan);
        }
    }

    pub fn next_plan_node(&mut self, lifespan: Lifespan) {
        let len = self.source_start_order.len();
        let state = self.state_mut(lifespan);
        assert!(state.ordinal < len, "cursor advanced past the source order");
        state.ordinal += 1;
        let ordinal = state.ordinal;
        if ordinal > self.max_scheduled_ordinal {
            self.max_scheduled_ordinal = ordinal;
        }
    }

    pub fn is_done(&self, lifespan: Lifespan) -> bool {
        self.state(lifespan).ordinal >= self.source_start_order.len()
    }

    pub fn is_driver_group_scheduled(&self, lifespan: Lifespan) -> bool {
        self.state(lifespan).driver_group_scheduled
    }

    pub fn set_driver_group_scheduled(&mut self, lifespan: Lifespan) {
        self.state_mut(lifespan).driver_group_scheduled = true;
    }

    pub fn completed_lifespans(&self) -> Vec<Lifespan> {
        let mut completed: Vec<Lifespan> = self.completed.iter().copied().collect();
        completed.sort();
        completed
    }

    fn state(&self, lifespan: Lifespan) -> &SchedulingLifespan {
        self.lifespans
            .get(&lifespan)
            .unwrap_or_else(|| panic!("lifespan {} not registered for scheduling", lifespan))
    }

    fn state_mut(&mut self, lifespan: Lifespan) -> &mut SchedulingLifespan {
        self.lifespans
            .get_mut(&lifespan)
            .unwrap_or_else(|| panic!("lifespan {} not registered for scheduling", lifespan))
    }
}

#[cfg(test)]
mod tests {
    use crate::common::ids::{PipelineId, TaskId};
    use crate::exec::driver::PipelineExecutionStrategy;

    use super::*;

    fn status() -> Arc<Status> {
        Arc::new(Status::new(
            TaskId::new(1),
            &[(PipelineId::new(0), PipelineExecutionStrategy::Ungrouped)],
            Box::new(|_| {}),
        ))
    }

    fn manager(grouped: &[u32], order: &[u32]) -> SchedulingLifespanManager {
        SchedulingLifespanManager::new(
            order.iter().map(|n| PlanNodeId::new(*n)).collect(),
            grouped.iter().map(|n| PlanNodeId::new(*n)).collect(),
            status(),
        )
    }

    #[test]
    fn compatible_cursor_returns_plan_node() {
        let mut manager = manager(&[], &[10, 11]);
        let tw = Lifespan::task_wide();
        manager.add_lifespan_if_absent(tw);
        assert_eq!(manager.scheduling_plan_node(tw), Some(PlanNodeId::new(10)));
        manager.next_plan_node(tw);
        assert_eq!(manager.scheduling_plan_node(tw), Some(PlanNodeId::new(11)));
        manager.next_plan_node(tw);
        assert!(manager.is_done(tw));
        assert_eq!(manager.scheduling_plan_node(tw), None);
    }

    #[test]
    fn incompatible_frontier_blocks_until_another_lifespan_opens_it() {
        // Source order: ungrouped A (10), grouped B (11).
        let mut manager = manager(&[11], &[10, 11]);
        let tw = Lifespan::task_wide();
        let g0 = Lifespan::driver_group(0);
        manager.add_lifespan_if_absent(tw);

        assert_eq!(manager.scheduling_plan_node(tw), Some(PlanNodeId::new(10)));
        manager.next_plan_node(tw);
        // Task-wide is at the frontier of an incompatible grouped scan.
        assert_eq!(manager.scheduling_plan_node(tw), None);
        assert!(!manager.is_done(tw));

        // The driver group skips the ungrouped scan the task-wide lifespan
        // already opened, and lands on the grouped one.
        manager.add_lifespan_if_absent(g0);
        assert_eq!(manager.scheduling_plan_node(g0), Some(PlanNodeId::new(11)));
        manager.next_plan_node(g0);
        assert!(manager.is_done(g0));

        // Now the watermark is past the grouped scan and task-wide can skip it.
        assert_eq!(manager.scheduling_plan_node(tw), None);
        assert!(manager.is_done(tw));
    }

    #[test]
    fn all_sources_closed_closes_the_lifespan_set() {
        let mut manager = manager(&[], &[10, 11]);
        manager.no_more_splits(PlanNodeId::new(10));
        assert!(!manager.status.is_no_more_lifespans());
        manager.no_more_splits(PlanNodeId::new(10));
        manager.no_more_splits(PlanNodeId::new(11));
        assert!(manager.status.is_no_more_lifespans());
    }

    #[test]
    #[should_panic(expected = "after no-more-lifespans")]
    fn no_new_lifespans_after_close() {
        let mut manager = manager(&[], &[10]);
        manager.no_more_splits(PlanNodeId::new(10));
        manager.add_lifespan_if_absent(Lifespan::driver_group(0));
    }

    #[test]
    fn known_and_retired_lifespans_are_not_reregistered() {
        let mut manager = manager(&[10], &[10]);
        let g0 = Lifespan::driver_group(0);
        manager.add_lifespan_if_absent(g0);
        manager.next_plan_node(g0);
        assert_eq!(manager.active_lifespans(), Vec::<Lifespan>::new());
        assert_eq!(manager.completed_lifespans(), vec![g0]);

        // A cumulative source update names the group again; its cursor must
        // not come back, even once the lifespan set is closed.
        manager.add_lifespan_if_absent(g0);
        assert_eq!(manager.active_lifespans(), Vec::<Lifespan>::new());
        manager.no_more_splits(PlanNodeId::new(10));
        assert!(manager.status.is_no_more_lifespans());
        manager.add_lifespan_if_absent(g0);
        assert_eq!(manager.completed_lifespans(), vec![g0]);
    }

    #[test]
    fn active_iteration_retires_done_lifespans() {
        let mut manager = manager(&[], &[10]);
        let tw = Lifespan::task_wide();
        manager.add_lifespan_if_absent(tw);
        assert_eq!(manager.active_lifespans(), vec![tw]);
        manager.next_plan_node(tw);
        assert_eq!(manager.active_lifespans(), Vec::<Lifespan>::new());
        assert_eq!(manager.completed_lifespans(), vec![tw]);
    }
}
