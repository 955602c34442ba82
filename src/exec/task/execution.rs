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
//! Task execution façade.
//!
//! Responsibilities:
//! - Ingests coordinator source updates, filters redelivered splits, and feeds
//!   the scheduling loop that turns pending splits into driver runners.
//! - Wires runner completion callbacks back into the driver counters and the
//!   task state machine, and drives the task to a terminal state.
//!
//! Key exported interfaces:
//! - Types: `TaskExecution`, `CheckOnBufferFinish`.
//! - Functions: `create_task_execution`.
//!
//! Lock hierarchy: the task lock first, then the status lock. The task lock is
//! not reentrant; `add_sources` must never be called while holding it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::common::app_config::SchedulerConfig;
use crate::common::ids::{PlanNodeId, TaskId};
use crate::exec::buffer::{BufferState, OutputBuffer};
use crate::exec::driver::{Driver, LocalExecutionPlan, PipelineExecutionStrategy};
use crate::exec::executor::{SplitRunner, TaskExecutor, TaskHandle};
use crate::exec::lifespan::Lifespan;
use crate::exec::split::{ScheduledSplit, TaskSource};
use crate::exec::state_machine::{TaskState, TaskStateMachine};
use crate::exec::task::barrier::BarrierGate;
use crate::exec::task::pending_splits::{PendingSplitsForPlanNode, SplitsState};
use crate::exec::task::runner::{DriverRunner, DriverRunnerCore, DriverRunnerFactory, check_lifespan};
use crate::exec::task::scheduling::SchedulingLifespanManager;
use crate::exec::task::status::Status;
use crate::exec::task::{SplitMonitor, TaskContext};
use crate::novatask_logging::{debug, info, warn};

/// Scheduler state protected by the task lock.
struct SchedulerState {
    pending_splits_by_plan_node: HashMap<PlanNodeId, PendingSplitsForPlanNode>,
    scheduling_manager: SchedulingLifespanManager,
    unpartitioned_sources: HashMap<PlanNodeId, TaskSource>,
    barrier: BarrierGate,
    max_acknowledged_split: i64,
}

/// Non-reentrant mutex over the scheduler state that records its owner, so
/// `add_sources` can assert the caller does not already hold it.
struct TaskLock {
    state: Mutex<SchedulerState>,
    owner: Mutex<Option<ThreadId>>,
}

impl TaskLock {
    fn new(state: SchedulerState) -> Self {
        Self {
            state: Mutex::new(state),
            owner: Mutex::new(None),
        }
    }

    fn lock(&self) -> TaskLockGuard<'_> {
        assert!(
            !self.is_held_by_current_thread(),
            "task lock is not reentrant"
        );
        let guard = self.state.lock().expect("task lock");
        *self.owner.lock().expect("task lock owner") = Some(thread::current().id());
        TaskLockGuard {
            owner: &self.owner,
            guard,
        }
    }

    fn is_held_by_current_thread(&self) -> bool {
        *self.owner.lock().expect("task lock owner") == Some(thread::current().id())
    }
}

struct TaskLockGuard<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
    guard: MutexGuard<'a, SchedulerState>,
}

impl Drop for TaskLockGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock().expect("task lock owner") = None;
    }
}

impl Deref for TaskLockGuard<'_> {
    type Target = SchedulerState;

    fn deref(&self) -> &SchedulerState {
        &self.guard
    }
}

impl DerefMut for TaskLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut SchedulerState {
        &mut self.guard
    }
}

/// Per-task scheduler. Owns the pending splits, the lifespan cursors, the
/// barrier gate and the runner factories, and submits runner envelopes to the
/// shared task executor.
pub struct TaskExecution {
    task_id: TaskId,
    task_context: Arc<TaskContext>,
    state_machine: Arc<TaskStateMachine>,
    output_buffer: Arc<dyn OutputBuffer>,
    executor: Arc<TaskExecutor>,
    task_handle: Option<TaskHandle>,
    status: Arc<Status>,
    split_monitor: Arc<dyn SplitMonitor>,
    recovery_enabled: bool,
    partitioned_factories: HashMap<PlanNodeId, Arc<DriverRunnerFactory>>,
    task_life_factories: Vec<Arc<DriverRunnerFactory>>,
    driver_group_life_factories: Vec<Arc<DriverRunnerFactory>>,
    lock: TaskLock,
    drivers: Mutex<Vec<Weak<dyn Driver>>>,
}

/// Build a task execution and perform its initial scheduling: all task-life
/// pipelines are instantiated immediately, and the task-wide lifespan is
/// pre-registered when any scan is ungrouped so scheduling is unblocked even
/// if zero splits ever arrive.
pub fn create_task_execution(
    state_machine: Arc<TaskStateMachine>,
    task_context: Arc<TaskContext>,
    output_buffer: Arc<dyn OutputBuffer>,
    plan: &LocalExecutionPlan,
    executor: Arc<TaskExecutor>,
    split_monitor: Arc<dyn SplitMonitor>,
    config: &SchedulerConfig,
) -> Result<Arc<TaskExecution>, String> {
    let task_id = state_machine.task_id();
    assert_eq!(task_id, task_context.task_id(), "mismatched task contexts");

    let pipelines: Vec<_> = plan
        .driver_factories
        .iter()
        .map(|f| (f.pipeline_id(), f.execution_strategy()))
        .collect();
    let completion_context = Arc::clone(&task_context);
    let status = Arc::new(Status::new(
        task_id,
        &pipelines,
        Box::new(move |lifespan| {
            completion_context.add_completed_driver_group(lifespan);
        }),
    ));

    let partitioned_source_nodes: HashSet<PlanNodeId> =
        plan.partitioned_source_order.iter().copied().collect();
    let mut partitioned_factories = HashMap::new();
    let mut task_life_factories = Vec::new();
    let mut driver_group_life_factories = Vec::new();
    for factory in &plan.driver_factories {
        let partitioned_source = factory
            .source_id()
            .is_some_and(|id| partitioned_source_nodes.contains(&id));
        let wrapper = Arc::new(DriverRunnerFactory::new(
            Arc::clone(factory),
            partitioned_source,
            task_context.pipeline_context(factory.pipeline_id()),
            Arc::clone(&status),
            Arc::clone(&output_buffer),
        ));
        if partitioned_source {
            let source_id = factory.source_id().expect("partitioned source pipeline");
            let previous = partitioned_factories.insert(source_id, wrapper);
            assert!(previous.is_none(), "two pipelines share source {}", source_id);
        } else {
            match factory.execution_strategy() {
                PipelineExecutionStrategy::Ungrouped => task_life_factories.push(wrapper),
                PipelineExecutionStrategy::Grouped => driver_group_life_factories.push(wrapper),
            }
        }
    }
    for plan_node_id in &plan.partitioned_source_order {
        assert!(
            partitioned_factories.contains_key(plan_node_id),
            "no pipeline consumes partitioned source {}",
            plan_node_id
        );
    }

    // A task whose state machine is already terminal gets no executor handle;
    // source updates for it are rejected rather than scheduled.
    let task_handle = if state_machine.state().is_done() {
        None
    } else {
        let utilization_buffer = Arc::clone(&output_buffer);
        Some(executor.add_task(
            task_id,
            Box::new(move || utilization_buffer.utilization()),
            config.initial_slots_per_node,
            Duration::from_millis(config.slot_adjust_interval_millis),
            config.max_slots_per_task,
        )?)
    };
    if let Some(max_drivers) = config.max_drivers_per_task {
        debug!(
            "Task driver cap configured: task_id={} max_drivers={}",
            task_id, max_drivers
        );
    }

    let pending_splits_by_plan_node = plan
        .partitioned_source_order
        .iter()
        .map(|id| (*id, PendingSplitsForPlanNode::new()))
        .collect();
    let scheduling_manager = SchedulingLifespanManager::new(
        plan.partitioned_source_order.clone(),
        plan.grouped_scan_nodes.clone(),
        Arc::clone(&status),
    );

    let execution = Arc::new(TaskExecution {
        task_id,
        task_context,
        state_machine: Arc::clone(&state_machine),
        output_buffer: Arc::clone(&output_buffer),
        executor: Arc::clone(&executor),
        task_handle: task_handle.clone(),
        status,
        split_monitor,
        recovery_enabled: config.recovery_enabled,
        partitioned_factories,
        task_life_factories,
        driver_group_life_factories,
        lock: TaskLock::new(SchedulerState {
            pending_splits_by_plan_node,
            scheduling_manager,
            unpartitioned_sources: HashMap::new(),
            barrier: BarrierGate::new(),
            max_acknowledged_split: i64::MIN,
        }),
        drivers: Mutex::new(Vec::new()),
    });
    for factory in execution.all_factories() {
        factory.attach(Arc::downgrade(&execution));
    }

    // A terminal transition deregisters the task and fires every factory's
    // global terminal hook; the hooks are exactly-once via the factory wrapper.
    let terminal_executor = executor;
    let terminal_handle = task_handle;
    let terminal_factories: Vec<Arc<DriverRunnerFactory>> = execution.all_factories().collect();
    state_machine.add_state_listener(Box::new(move |state| {
        if state.is_done() {
            if let Some(handle) = &terminal_handle {
                terminal_executor.remove_task(handle);
            }
            for factory in &terminal_factories {
                factory.force_close();
            }
        }
    }));

    let check = CheckOnBufferFinish::new(Arc::downgrade(&execution));
    execution
        .output_buffer
        .add_state_listener(Box::new(move |state| check.on_buffer_state_change(state)));

    if execution.task_handle.is_some() {
        execution.schedule_drivers_for_task_lifecycle();
        let ungrouped_scan = plan
            .partitioned_source_order
            .iter()
            .any(|id| !plan.is_scan_grouped(*id));
        if ungrouped_scan {
            execution
                .lock
                .lock()
                .scheduling_manager
                .add_lifespan_if_absent(Lifespan::task_wide());
        }
    }

    info!(
        "Task execution created: task_id={} pipelines={} partitioned_sources={} recovery={}",
        task_id,
        plan.driver_factories.len(),
        plan.partitioned_source_order.len(),
        config.recovery_enabled
    );
    Ok(execution)
}

impl TaskExecution {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state_machine.state()
    }

    pub fn task_context(&self) -> &Arc<TaskContext> {
        &self.task_context
    }

    /// Thread-safe source ingestion entry point. Must never be called while
    /// the caller holds the task lock.
    pub fn add_sources(self: &Arc<Self>, sources: Vec<TaskSource>) -> Result<(), String> {
        assert!(
            !self.lock.is_held_by_current_thread(),
            "cannot add sources while holding the task lock"
        );
        if self.task_handle.is_none() {
            return Err(format!(
                "task {} was terminal at creation; rejecting source update",
                self.task_id
            ));
        }
        if self.state_machine.state().is_done() {
            // Late updates for a finished task are absorbed.
            return Ok(());
        }

        let updated_unpartitioned = {
            let mut guard = self.lock.lock();
            self.update_sources(&mut guard, sources)
        };

        // Existing drivers learn about new unpartitioned splits outside the
        // task lock; updates are cumulative so repeats and reordering are safe.
        for source in &updated_unpartitioned {
            self.apply_to_live_drivers(source);
        }

        self.check_task_completion();
        Ok(())
    }

    /// Plan nodes for which no further splits can arrive.
    pub fn no_more_splits(&self) -> HashSet<PlanNodeId> {
        let mut result = HashSet::new();
        for (plan_node_id, factory) in &self.partitioned_factories {
            if factory.is_no_more_driver_runners() {
                result.insert(*plan_node_id);
            }
        }
        let guard = self.lock.lock();
        for source in guard.unpartitioned_sources.values() {
            if source.no_more_splits {
                result.insert(source.plan_node_id);
            }
        }
        result
    }

    pub fn suspend(&self) {
        if self.state_machine.suspend() {
            self.executor.suspend_task(self.task_id);
        } else {
            warn!(
                "Cannot suspend task: task_id={} state={:?}",
                self.task_id,
                self.state_machine.state()
            );
        }
    }

    pub fn resume(&self) {
        if self.state_machine.resume() {
            self.executor.resume_task(self.task_id);
        } else {
            warn!(
                "Cannot resume task: task_id={} state={:?}",
                self.task_id,
                self.state_machine.state()
            );
        }
    }

    fn all_factories(&self) -> impl Iterator<Item = Arc<DriverRunnerFactory>> + '_ {
        self.partitioned_factories
            .values()
            .chain(self.task_life_factories.iter())
            .chain(self.driver_group_life_factories.iter())
            .cloned()
    }

    fn update_sources(
        self: &Arc<Self>,
        guard: &mut TaskLockGuard<'_>,
        sources: Vec<TaskSource>,
    ) -> Vec<TaskSource> {
        let state: &mut SchedulerState = &mut *guard;
        if self.state_machine.state().is_done() {
            return Vec::new();
        }

        // Redelivered splits are filtered against the acknowledgement
        // watermark, then the watermark advances over everything accepted.
        let current_max = state.max_acknowledged_split;
        let mut new_max = current_max;
        let mut updated_unpartitioned = Vec::new();
        for source in sources {
            let plan_node_id = source.plan_node_id;
            let splits: Vec<ScheduledSplit> = source
                .splits
                .into_iter()
                .filter(|s| s.sequence_id > current_max)
                .inspect(|s| new_max = new_max.max(s.sequence_id))
                .collect();
            let source = TaskSource::new(
                plan_node_id,
                splits,
                source.no_more_splits_for_lifespan,
                source.no_more_splits,
            );

            if self.partitioned_factories.contains_key(&plan_node_id) {
                if self.recovery_enabled {
                    // Markers must stay ordered with data splits; buffer the
                    // update and release it through the barrier below.
                    state.barrier.ingest(source);
                } else {
                    self.schedule_partitioned_source(state, source);
                }
            } else {
                let current = state
                    .unpartitioned_sources
                    .entry(plan_node_id)
                    .or_insert_with(|| TaskSource::initial(plan_node_id));
                if let Some(merged) = current.update(&source) {
                    *current = merged.clone();
                    updated_unpartitioned.push(merged);
                }
            }
        }
        state.max_acknowledged_split = new_max;

        if self.recovery_enabled {
            for batch in state.barrier.drain_ready() {
                let factory = self
                    .partitioned_factories
                    .get(&batch.data.plan_node_id)
                    .expect("barrier batch for unknown source");
                for (lifespan, marker) in batch.markers {
                    debug!(
                        "Broadcasting marker: task_id={} snapshot_id={} lifespan={}",
                        self.task_id, marker.snapshot_id, lifespan
                    );
                    factory.broadcast_marker(lifespan, marker);
                }
                self.schedule_partitioned_source(state, batch.data);
            }
        }

        for factory in self.all_factories() {
            factory.close_if_fully_created();
        }
        updated_unpartitioned
    }

    fn schedule_partitioned_source(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        source_update: TaskSource,
    ) {
        let plan_node_id = source_update.plan_node_id;
        self.merge_into_pending_splits(state, &source_update);

        // Advance every lifespan's cursor as far as it will go. A cursor only
        // moves once its current plan node is closed, and moving it can
        // unblock other lifespans through the watermark, hence the outer
        // progress loop.
        loop {
            let mut made_progress = false;
            for lifespan in state.scheduling_manager.active_lifespans() {
                loop {
                    let Some(scheduling_node) =
                        state.scheduling_manager.scheduling_plan_node(lifespan)
                    else {
                        break;
                    };
                    if !lifespan.is_task_wide()
                        && !state.scheduling_manager.is_driver_group_scheduled(lifespan)
                    {
                        state.scheduling_manager.set_driver_group_scheduled(lifespan);
                        self.schedule_drivers_for_driver_group_lifecycle(lifespan);
                    }

                    let factory = self
                        .partitioned_factories
                        .get(&scheduling_node)
                        .expect("scheduling cursor on unknown source");
                    let bucket = state
                        .pending_splits_by_plan_node
                        .get_mut(&scheduling_node)
                        .expect("no pending splits for source")
                        .for_lifespan(lifespan);
                    let mut splits: Vec<ScheduledSplit> = bucket.drain().into_iter().collect();
                    splits.sort_by_key(|s| s.sequence_id);
                    let runners: Vec<DriverRunner> = splits
                        .into_iter()
                        .map(|split| factory.create_runner(Some(split), lifespan, 0))
                        .collect();
                    self.enqueue_driver_runners(false, runners);

                    let bucket = state
                        .pending_splits_by_plan_node
                        .get_mut(&scheduling_node)
                        .expect("no pending splits for source")
                        .for_lifespan(lifespan);
                    if bucket.state() != SplitsState::NoMore {
                        // More splits may arrive for this plan node; wait.
                        break;
                    }
                    factory.no_more_driver_runners(&[lifespan]);
                    bucket.mark_drained();
                    state.scheduling_manager.next_plan_node(lifespan);
                    made_progress = true;
                    if state.scheduling_manager.is_done(lifespan) {
                        break;
                    }
                }
            }
            if !made_progress {
                break;
            }
        }

        if source_update.no_more_splits {
            state.scheduling_manager.no_more_splits(plan_node_id);
        }
    }

    fn merge_into_pending_splits(
        &self,
        state: &mut SchedulerState,
        source_update: &TaskSource,
    ) {
        let plan_node_id = source_update.plan_node_id;
        let factory = self
            .partitioned_factories
            .get(&plan_node_id)
            .expect("source update for unknown partitioned source");
        factory.splits_added(source_update.splits.len());

        let pending = state
            .pending_splits_by_plan_node
            .get_mut(&plan_node_id)
            .expect("no pending splits for source");
        for split in &source_update.splits {
            check_lifespan(factory.execution_strategy(), split.lifespan);
            pending.add_split(split.clone());
            state.scheduling_manager.add_lifespan_if_absent(split.lifespan);
        }
        for lifespan in &source_update.no_more_splits_for_lifespan {
            check_lifespan(factory.execution_strategy(), *lifespan);
            pending.set_no_more_splits_for_lifespan(*lifespan);
            state.scheduling_manager.add_lifespan_if_absent(*lifespan);
        }
        if source_update.no_more_splits {
            pending.set_no_more_splits();
        }
    }

    /// Instantiate all task-life pipelines at their configured parallelism.
    /// Runs once, immediately after construction.
    fn schedule_drivers_for_task_lifecycle(self: &Arc<Self>) {
        let _guard = self.lock.lock();
        let mut runners = Vec::new();
        for factory in &self.task_life_factories {
            for driver_index in 0..factory.driver_instances() {
                runners.push(factory.create_runner(None, Lifespan::task_wide(), driver_index));
            }
        }
        self.enqueue_driver_runners(true, runners);
        for factory in &self.task_life_factories {
            factory.no_more_driver_runners(&[Lifespan::task_wide()]);
            assert!(factory.is_no_more_driver_runners());
        }
    }

    /// Instantiate all driver-group-life pipelines for one driver group,
    /// before any of its source splits run. Called under the task lock.
    fn schedule_drivers_for_driver_group_lifecycle(self: &Arc<Self>, lifespan: Lifespan) {
        let mut runners = Vec::new();
        for factory in &self.driver_group_life_factories {
            for driver_index in 0..factory.driver_instances() {
                runners.push(factory.create_runner(None, lifespan, driver_index));
            }
        }
        self.enqueue_driver_runners(true, runners);
        for factory in &self.driver_group_life_factories {
            factory.no_more_driver_runners(&[lifespan]);
        }
    }

    /// Submit runners to the executor and wire their completion callbacks.
    /// Called under the task lock; submission never blocks on I/O.
    fn enqueue_driver_runners(self: &Arc<Self>, force_run: bool, runners: Vec<DriverRunner>) {
        if runners.is_empty() {
            return;
        }
        let handle = self
            .task_handle
            .as_ref()
            .expect("scheduling without an executor handle");
        let cores: Vec<Arc<DriverRunnerCore>> = runners.iter().map(|r| r.core()).collect();
        let boxed: Vec<Box<dyn SplitRunner>> = runners
            .into_iter()
            .map(|r| Box::new(r) as Box<dyn SplitRunner>)
            .collect();
        let futures = self.executor.enqueue_splits(handle, force_run, boxed);
        assert_eq!(futures.len(), cores.len(), "one future per runner");
        for (future, core) in futures.into_iter().zip(cores) {
            self.status.increment_remaining_driver(core.lifespan());
            let execution = Arc::clone(self);
            future.on_complete(Box::new(move |result| {
                execution.on_runner_complete(&core, result);
            }));
        }
    }

    /// Completion callback, run on the notification pool.
    fn on_runner_complete(self: &Arc<Self>, core: &Arc<DriverRunnerCore>, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.status.decrement_remaining_driver(core.lifespan());
                self.check_task_completion();
                self.split_monitor
                    .split_completed(self.task_id, core.pipeline_id(), &core.describe());
                if self.recovery_enabled {
                    if let Some(split) = core.partitioned_split() {
                        let retry = {
                            let mut guard = self.lock.lock();
                            guard
                                .barrier
                                .on_split_completed(split.plan_node_id, split.sequence_id)
                        };
                        if retry {
                            // Buffered sources behind the barrier can move now.
                            if let Err(err) = self.add_sources(Vec::new()) {
                                warn!(
                                    "Barrier retry rejected: task_id={} error={}",
                                    self.task_id, err
                                );
                            }
                        }
                    } else if let Some(driver) = core.driver() {
                        // Only non-source drivers hold state worth snapshotting.
                        driver.report_finished_driver();
                    }
                }
            }
            Err(cause) => {
                self.state_machine.failed(cause.clone());
                self.status.decrement_remaining_driver(core.lifespan());
                self.split_monitor
                    .split_failed(self.task_id, core.pipeline_id(), &core.describe(), &cause);
            }
        }
    }

    /// Transition the task toward a terminal state once every partitioned
    /// source is closed, no drivers remain, and the output buffer has drained.
    pub(crate) fn check_task_completion(&self) {
        let _guard = self.lock.lock();
        if self.state_machine.state().is_done() {
            return;
        }
        for factory in self.partitioned_factories.values() {
            if !factory.is_no_more_driver_runners() {
                return;
            }
        }
        if self.status.overall_remaining_driver() != 0 {
            return;
        }

        self.output_buffer.set_no_more_pages();
        let buffer_state = self.output_buffer.state();
        if !buffer_state.is_terminal() {
            self.state_machine.transition_to_flushing();
            return;
        }
        match buffer_state {
            BufferState::Finished => {
                self.state_machine.finished();
            }
            BufferState::Failed => {
                let cause = self
                    .output_buffer
                    .failure_cause()
                    .unwrap_or_else(|| "output buffer failed without a cause".to_string());
                self.state_machine.failed(cause);
            }
            _ => {
                // Aborted without the task transitioning first is a bug.
                self.state_machine
                    .failed("output buffer is aborted, but task is not aborted");
            }
        }
    }

    pub(crate) fn register_driver(&self, driver: &Arc<dyn Driver>) {
        self.drivers
            .lock()
            .expect("live drivers lock")
            .push(Arc::downgrade(driver));
    }

    pub(crate) fn unpartitioned_source(&self, plan_node_id: PlanNodeId) -> Option<TaskSource> {
        self.lock.lock().unpartitioned_sources.get(&plan_node_id).cloned()
    }

    fn apply_to_live_drivers(&self, source: &TaskSource) {
        let live: Vec<Arc<dyn Driver>> = {
            let mut drivers = self.drivers.lock().expect("live drivers lock");
            // Prune references the executor has already dropped.
            drivers.retain(|weak| weak.strong_count() > 0);
            drivers.iter().filter_map(Weak::upgrade).collect()
        };
        for driver in live {
            if driver.source_id() == Some(source.plan_node_id) {
                driver.update_source(source);
            }
        }
    }
}

impl fmt::Debug for TaskExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecution")
            .field("task_id", &self.task_id)
            .field("state", &self.state_machine.state())
            .field("remaining_drivers", &self.status.overall_remaining_driver())
            .field("recovery_enabled", &self.recovery_enabled)
            .finish()
    }
}

/// Output-buffer listener holding the task weakly: the buffer outliving the
/// task must not keep the task alive. Re-runs the completion check when the
/// buffer drains.
pub struct CheckOnBufferFinish {
    execution: Weak<TaskExecution>,
}

impl CheckOnBufferFinish {
    pub(crate) fn new(execution: Weak<TaskExecution>) -> Self {
        Self { execution }
    }

    pub(crate) fn on_buffer_state_change(&self, state: BufferState) {
        if state != BufferState::Finished {
            return;
        }
        let Some(execution) = self.execution.upgrade() else {
            return;
        };
        if execution.lock.is_held_by_current_thread() {
            // The in-flight completion check triggered this transition and
            // reads the buffer state itself.
            return;
        }
        execution.check_task_completion();
    }
}
