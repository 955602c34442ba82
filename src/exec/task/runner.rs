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
//! Driver runner envelopes and their per-pipeline factory.
//!
//! Responsibilities:
//! - Wraps one pipeline's driver factory; creates runner envelopes whose real
//!   driver is materialized lazily on the first worker time slice.
//! - Tells the driver factory about closed lifespans and fires its global
//!   terminal hook exactly once.
//! - Broadcasts snapshot markers past the source stages to the pipeline's
//!   terminal operator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::common::ids::PipelineId;
use crate::exec::buffer::{OutputBuffer, Page};
use crate::exec::driver::{
    Driver, DriverContext, DriverFactory, PipelineExecutionStrategy, PipelineLifecycleClass,
    PipelineOutput,
};
use crate::exec::executor::SplitRunner;
use crate::exec::lifespan::Lifespan;
use crate::exec::split::{MarkerPage, ScheduledSplit, TaskSource};
use crate::exec::task::PipelineContext;
use crate::exec::task::execution::TaskExecution;
use crate::exec::task::status::Status;
use crate::novatask_logging::debug;

/// A driver's lifespan must match its pipeline's execution strategy; a
/// violation is a programming error in the scheduler or the plan.
pub(crate) fn check_lifespan(strategy: PipelineExecutionStrategy, lifespan: Lifespan) {
    match strategy {
        PipelineExecutionStrategy::Grouped => assert!(
            !lifespan.is_task_wide(),
            "a grouped pipeline cannot run the task-wide lifespan"
        ),
        PipelineExecutionStrategy::Ungrouped => assert!(
            lifespan.is_task_wide(),
            "an ungrouped pipeline can only run the task-wide lifespan"
        ),
    }
}

/// Wraps one pipeline's driver factory for the scheduler.
pub struct DriverRunnerFactory {
    factory: Arc<dyn DriverFactory>,
    pipeline_context: Arc<PipelineContext>,
    lifecycle: PipelineLifecycleClass,
    status: Arc<Status>,
    output_buffer: Arc<dyn OutputBuffer>,
    execution: OnceLock<Weak<TaskExecution>>,
    closed: AtomicBool,
}

impl DriverRunnerFactory {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        is_partitioned_source: bool,
        pipeline_context: Arc<PipelineContext>,
        status: Arc<Status>,
        output_buffer: Arc<dyn OutputBuffer>,
    ) -> Self {
        let lifecycle = if is_partitioned_source {
            PipelineLifecycleClass::SplitLife
        } else {
            match factory.execution_strategy() {
                PipelineExecutionStrategy::Grouped => PipelineLifecycleClass::DriverGroupLife,
                PipelineExecutionStrategy::Ungrouped => PipelineLifecycleClass::TaskLife,
            }
        };
        Self {
            factory,
            pipeline_context,
            lifecycle,
            status,
            output_buffer,
            execution: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wire the back-reference to the owning task execution. Called once,
    /// right after the execution is constructed.
    pub(crate) fn attach(&self, execution: Weak<TaskExecution>) {
        self.execution
            .set(execution)
            .unwrap_or_else(|_| panic!("runner factory already attached"));
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.factory.pipeline_id()
    }

    pub fn execution_strategy(&self) -> PipelineExecutionStrategy {
        self.factory.execution_strategy()
    }

    pub fn lifecycle(&self) -> PipelineLifecycleClass {
        self.lifecycle
    }

    pub fn driver_instances(&self) -> usize {
        self.factory.driver_instances().unwrap_or(1)
    }

    pub fn splits_added(&self, count: usize) {
        self.pipeline_context.record_splits_added(count);
    }

    /// Create a not-yet-started runner. The driver context is built eagerly so
    /// worker-load accounting reflects intent before the driver exists.
    pub fn create_runner(
        self: &Arc<Self>,
        partitioned_split: Option<ScheduledSplit>,
        lifespan: Lifespan,
        driver_index: usize,
    ) -> DriverRunner {
        check_lifespan(self.execution_strategy(), lifespan);
        self.status
            .increment_pending_creation(self.pipeline_id(), lifespan);
        let driver_context = DriverContext {
            pipeline_id: self.pipeline_id(),
            lifespan,
            driver_index,
        };
        DriverRunner::new(Arc::clone(self), driver_context, partitioned_split)
    }

    /// Build the real driver for a runner. Runs on a worker thread; takes the
    /// task lock only briefly to read the known unpartitioned sources.
    fn materialize(
        &self,
        driver_context: &DriverContext,
        partitioned_split: Option<&ScheduledSplit>,
    ) -> Result<Arc<dyn Driver>, String> {
        let execution = self
            .execution
            .get()
            .expect("runner factory never attached")
            .upgrade()
            .ok_or_else(|| "task execution released".to_string())?;

        let driver = self.factory.create_driver(driver_context)?;
        execution.register_driver(&driver);

        if let Some(split) = partitioned_split {
            // A split-lifecycle driver consumes exactly this one split.
            driver.update_source(&TaskSource::new(
                split.plan_node_id,
                vec![split.clone()],
                Default::default(),
                true,
            ));
        }
        if let Some(source_id) = driver.source_id() {
            if let Some(source) = execution.unpartitioned_source(source_id) {
                driver.update_source(&source);
            }
        }

        self.pipeline_context.record_driver_created();
        self.status
            .decrement_pending_creation(self.pipeline_id(), driver_context.lifespan);
        self.close_if_fully_created();
        Ok(driver)
    }

    pub fn no_more_driver_runners(&self, lifespans: &[Lifespan]) {
        for lifespan in lifespans {
            self.status
                .set_no_more_driver_runners(self.pipeline_id(), *lifespan);
        }
    }

    pub fn is_no_more_driver_runners(&self) -> bool {
        self.status
            .is_no_more_driver_runners_for_pipeline(self.pipeline_id())
    }

    /// Pass closed lifespans on to the driver factory, and fire its global
    /// terminal hook once the pipeline can never create another driver.
    pub fn close_if_fully_created(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for lifespan in self
            .status
            .get_and_acknowledge_closed_lifespans(self.pipeline_id())
        {
            self.factory.no_more_drivers_for_lifespan(lifespan);
        }
        if !self.is_no_more_driver_runners() {
            return;
        }
        if self.status.pending_creation(self.pipeline_id()) != 0 {
            return;
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Pipeline fully created: pipeline={}", self.pipeline_id());
            self.factory.no_more_drivers();
        }
    }

    /// Terminal-state path: fire the factory's global hook regardless of
    /// whether the pipeline finished creating drivers.
    pub fn force_close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.factory.no_more_drivers();
        }
    }

    /// Route a snapshot marker past the source stages to the pipeline's
    /// terminal operator. Outer-join lookup sources are notified first so
    /// their matching state is frozen before the marker is emitted.
    pub fn broadcast_marker(&self, lifespan: Lifespan, marker: MarkerPage) {
        for listener in self.factory.marker_listeners() {
            listener.process_marker(lifespan, marker);
        }
        match self.factory.pipeline_output() {
            PipelineOutput::TaskOutput => {
                self.output_buffer.enqueue(vec![Page::Marker(marker)]);
            }
            PipelineOutput::PartitionedOutput => {
                // Partition 0 realizes the marker for every partition.
                self.output_buffer
                    .enqueue_partitioned(0, vec![Page::Marker(marker)]);
            }
            PipelineOutput::LocalExchangeSink(sink) => {
                sink.broadcast_marker(lifespan, marker);
            }
        }
    }
}

struct RunnerState {
    driver: Option<Arc<dyn Driver>>,
    closed: bool,
}

/// Shared core of one runner envelope, also captured by the completion
/// callbacks so they can reach the materialized driver.
pub(crate) struct DriverRunnerCore {
    factory: Arc<DriverRunnerFactory>,
    driver_context: DriverContext,
    partitioned_split: Option<ScheduledSplit>,
    state: Mutex<RunnerState>,
}

impl DriverRunnerCore {
    pub(crate) fn lifespan(&self) -> Lifespan {
        self.driver_context.lifespan
    }

    pub(crate) fn pipeline_id(&self) -> PipelineId {
        self.factory.pipeline_id()
    }

    pub(crate) fn partitioned_split(&self) -> Option<&ScheduledSplit> {
        self.partitioned_split.as_ref()
    }

    pub(crate) fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.state.lock().expect("runner state lock").driver.clone()
    }

    pub(crate) fn describe(&self) -> String {
        match &self.partitioned_split {
            Some(split) => format!(
                "pipeline={} lifespan={} split_sequence_id={}",
                self.pipeline_id(),
                self.lifespan(),
                split.sequence_id
            ),
            None => format!(
                "pipeline={} lifespan={} driver_index={}",
                self.pipeline_id(),
                self.lifespan(),
                self.driver_context.driver_index
            ),
        }
    }
}

/// Schedulable envelope for one driver. The driver itself is created on the
/// first time slice; the per-runner lock serializes materialization against
/// close.
pub struct DriverRunner {
    core: Arc<DriverRunnerCore>,
}

impl DriverRunner {
    fn new(
        factory: Arc<DriverRunnerFactory>,
        driver_context: DriverContext,
        partitioned_split: Option<ScheduledSplit>,
    ) -> Self {
        Self {
            core: Arc::new(DriverRunnerCore {
                factory,
                driver_context,
                partitioned_split,
                state: Mutex::new(RunnerState {
                    driver: None,
                    closed: false,
                }),
            }),
        }
    }

    pub(crate) fn core(&self) -> Arc<DriverRunnerCore> {
        Arc::clone(&self.core)
    }
}

impl SplitRunner for DriverRunner {
    fn is_finished(&self) -> bool {
        let state = self.core.state.lock().expect("runner state lock");
        if state.closed {
            return true;
        }
        state.driver.as_ref().is_some_and(|d| d.is_finished())
    }

    fn process_for(&mut self, slice: Duration) -> Result<(), String> {
        let driver = {
            let mut state = self.core.state.lock().expect("runner state lock");
            if state.closed {
                return Ok(());
            }
            if state.driver.is_none() {
                state.driver = Some(self.core.factory.materialize(
                    &self.core.driver_context,
                    self.core.partitioned_split.as_ref(),
                )?);
            }
            Arc::clone(state.driver.as_ref().expect("driver just materialized"))
        };
        driver.process_for(slice)
    }

    fn info(&self) -> String {
        self.core.describe()
    }

    fn close(&mut self) {
        let driver = {
            let mut state = self.core.state.lock().expect("runner state lock");
            if state.closed {
                return;
            }
            state.closed = true;
            state.driver.clone()
        };
        if let Some(driver) = driver {
            driver.close();
        }
        self.core.factory.pipeline_context.record_driver_finished();
    }
}
