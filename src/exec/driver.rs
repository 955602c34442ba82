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
//! Driver and driver-factory boundary of the task scheduler.
//!
//! Responsibilities:
//! - Defines the contracts the local execution plan hands to the scheduler: one
//!   `DriverFactory` per pipeline, producing cooperative `Driver` instances.
//! - Defines the pipeline terminal-output variants used for marker broadcast.
//!
//! Key exported interfaces:
//! - Types: `PipelineExecutionStrategy`, `DriverContext`, `PipelineOutput`,
//!   `LocalExecutionPlan`.
//! - Traits: `Driver`, `DriverFactory`, `LocalExchangeSink`, `MarkerListener`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::common::ids::{PipelineId, PlanNodeId};
use crate::exec::lifespan::Lifespan;
use crate::exec::split::{MarkerPage, TaskSource};

/// How a pipeline's drivers map onto lifespans.
///
/// An ungrouped pipeline runs exactly one task-wide lifespan; a grouped pipeline
/// runs one driver group per bucket and never the task-wide lifespan.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PipelineExecutionStrategy {
    Ungrouped,
    Grouped,
}

/// Derived lifecycle class of a pipeline, fixed at plan construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PipelineLifecycleClass {
    /// Partitioned-source pipeline: one driver per split.
    SplitLife,
    /// Grouped non-source pipeline: drivers instantiated once per driver group.
    DriverGroupLife,
    /// Ungrouped non-source pipeline: drivers instantiated once per task.
    TaskLife,
}

/// Identity of one driver instance, created eagerly so worker-load accounting
/// reflects intent before the driver itself is materialized.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DriverContext {
    pub pipeline_id: PipelineId,
    pub lifespan: Lifespan,
    pub driver_index: usize,
}

/// One runtime instance of a pipeline. Drivers are run time-sliced by the task
/// executor; all methods may be called from worker threads.
pub trait Driver: Send + Sync {
    /// Plan node this driver reads from, if it has a source operator.
    fn source_id(&self) -> Option<PlanNodeId>;

    /// Deliver a cumulative source update. Safe to call repeatedly and out of
    /// order; the source carries the full record of its splits.
    fn update_source(&self, source: &TaskSource);

    fn process_for(&self, slice: Duration) -> Result<(), String>;

    fn is_finished(&self) -> bool;

    fn close(&self);

    /// Snapshot-manager hook fired when a non-source driver finishes in
    /// recovery mode. Source pipeline operators keep no state to report.
    fn report_finished_driver(&self) {}
}

/// Local-exchange sink terminus of an internal pipeline; markers broadcast to
/// it are observed by every consumer of the exchange.
pub trait LocalExchangeSink: Send + Sync {
    fn broadcast_marker(&self, lifespan: Lifespan, marker: MarkerPage);
}

/// Collaborator that must observe a marker before it reaches the pipeline
/// output. Used by outer-side lookup joins to freeze matching state.
pub trait MarkerListener: Send + Sync {
    fn process_marker(&self, lifespan: Lifespan, marker: MarkerPage);
}

/// Terminal operator of a pipeline, as far as marker broadcast is concerned.
/// The marker must reach the downstream as if it had flowed through the
/// pipeline itself.
#[derive(Clone)]
pub enum PipelineOutput {
    /// Pipeline ends in the task output buffer.
    TaskOutput,
    /// Pipeline ends in a partitioned output; markers go to every partition,
    /// which the buffer realizes from partition 0.
    PartitionedOutput,
    /// Pipeline ends in a local exchange sink.
    LocalExchangeSink(Arc<dyn LocalExchangeSink>),
}

/// Factory for all drivers of one pipeline. The scheduler calls the terminal
/// hooks exactly once per lifespan and once globally.
pub trait DriverFactory: Send + Sync {
    fn pipeline_id(&self) -> PipelineId;

    fn execution_strategy(&self) -> PipelineExecutionStrategy;

    /// Source plan node, present for pipelines that read external input.
    fn source_id(&self) -> Option<PlanNodeId>;

    /// Parallelism for lifecycle-driven instantiation. Defaults to 1.
    fn driver_instances(&self) -> Option<usize> {
        None
    }

    fn pipeline_output(&self) -> PipelineOutput;

    /// Marker pre-broadcast listeners (outer-join lookup sources).
    fn marker_listeners(&self) -> Vec<Arc<dyn MarkerListener>> {
        Vec::new()
    }

    fn create_driver(&self, ctx: &DriverContext) -> Result<Arc<dyn Driver>, String>;

    /// No further drivers will be created for this lifespan.
    fn no_more_drivers_for_lifespan(&self, lifespan: Lifespan);

    /// No further drivers will be created at all. Idempotence is the
    /// scheduler's responsibility; called at most once per factory.
    fn no_more_drivers(&self);
}

/// Pre-built local execution plan for one task: the pipelines, the order in
/// which partitioned sources must begin scheduling, and which scans run
/// grouped.
#[derive(Clone)]
pub struct LocalExecutionPlan {
    pub driver_factories: Vec<Arc<dyn DriverFactory>>,
    pub partitioned_source_order: Vec<PlanNodeId>,
    pub grouped_scan_nodes: HashSet<PlanNodeId>,
}

impl LocalExecutionPlan {
    pub fn new(
        driver_factories: Vec<Arc<dyn DriverFactory>>,
        partitioned_source_order: Vec<PlanNodeId>,
        grouped_scan_nodes: HashSet<PlanNodeId>,
    ) -> Self {
        Self {
            driver_factories,
            partitioned_source_order,
            grouped_scan_nodes,
        }
    }

    pub fn is_scan_grouped(&self, plan_node_id: PlanNodeId) -> bool {
        self.grouped_scan_nodes.contains(&plan_node_id)
    }
}
