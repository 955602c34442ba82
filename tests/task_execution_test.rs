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
//! End-to-end tests for task execution: split scheduling across pipelines and
//! lifespans, completion notifications, recovery markers, failure and
//! suspend/resume handling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use novatask::common::app_config::SchedulerConfig;
use novatask::common::ids::{PipelineId, PlanNodeId, TaskId};
use novatask::exec::buffer::{BufferState, InMemoryOutputBuffer, OutputBuffer, Page};
use novatask::exec::driver::{
    Driver, DriverContext, DriverFactory, LocalExecutionPlan, PipelineExecutionStrategy,
    PipelineOutput,
};
use novatask::exec::executor::TaskExecutor;
use novatask::exec::split::{MarkerPage, SplitPayload};
use novatask::exec::state_machine::{TaskState, TaskStateMachine};
use novatask::exec::task::execution::{TaskExecution, create_task_execution};
use novatask::exec::task::{LoggingSplitMonitor, TaskContext};
use novatask::{Lifespan, ScheduledSplit, TaskSource};

fn wait_until(label: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {label}");
}

struct TestDriver {
    source: Option<PlanNodeId>,
    fail_with: Option<String>,
    hold: Arc<AtomicBool>,
    saw_no_more: AtomicBool,
    finished: AtomicBool,
    splits_seen: Arc<Mutex<Vec<String>>>,
}

impl Driver for TestDriver {
    fn source_id(&self) -> Option<PlanNodeId> {
        self.source
    }

    fn update_source(&self, source: &TaskSource) {
        for split in &source.splits {
            if let SplitPayload::Data { info } = &split.payload {
                self.splits_seen.lock().unwrap().push(info.clone());
            }
        }
        if source.no_more_splits {
            self.saw_no_more.store(true, Ordering::SeqCst);
        }
    }

    fn process_for(&self, _slice: Duration) -> Result<(), String> {
        if let Some(cause) = &self.fail_with {
            return Err(cause.clone());
        }
        if self.hold.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A source driver drains until its input closes; anything else is a
        // one-shot operator.
        let ready = match self.source {
            Some(_) => self.saw_no_more.load(Ordering::SeqCst),
            None => true,
        };
        if ready {
            self.finished.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn close(&self) {}
}

struct TestDriverFactory {
    pipeline_id: PipelineId,
    strategy: PipelineExecutionStrategy,
    source: Option<PlanNodeId>,
    instances: Option<usize>,
    fail_with: Option<String>,
    hold: Arc<AtomicBool>,
    created: AtomicUsize,
    closed: AtomicBool,
    splits_seen: Arc<Mutex<Vec<String>>>,
}

impl TestDriverFactory {
    fn new(
        pipeline_id: u32,
        strategy: PipelineExecutionStrategy,
        source: Option<PlanNodeId>,
    ) -> Self {
        Self {
            pipeline_id: PipelineId::new(pipeline_id),
            strategy,
            source,
            instances: None,
            fail_with: None,
            hold: Arc::new(AtomicBool::new(false)),
            created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            splits_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn splits_seen(&self) -> Vec<String> {
        let mut seen = self.splits_seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

impl DriverFactory for TestDriverFactory {
    fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    fn execution_strategy(&self) -> PipelineExecutionStrategy {
        self.strategy
    }

    fn source_id(&self) -> Option<PlanNodeId> {
        self.source
    }

    fn driver_instances(&self) -> Option<usize> {
        self.instances
    }

    fn pipeline_output(&self) -> PipelineOutput {
        PipelineOutput::TaskOutput
    }

    fn create_driver(&self, _ctx: &DriverContext) -> Result<Arc<dyn Driver>, String> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestDriver {
            source: self.source,
            fail_with: self.fail_with.clone(),
            hold: Arc::clone(&self.hold),
            saw_no_more: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            splits_seen: Arc::clone(&self.splits_seen),
        }))
    }

    fn no_more_drivers_for_lifespan(&self, _lifespan: Lifespan) {}

    fn no_more_drivers(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct TestTask {
    state_machine: Arc<TaskStateMachine>,
    task_context: Arc<TaskContext>,
    buffer: Arc<InMemoryOutputBuffer>,
    execution: Arc<TaskExecution>,
    // Keeps workers alive for the duration of the test.
    _executor: Arc<TaskExecutor>,
}

fn start_task(
    task_id: u64,
    factories: Vec<Arc<TestDriverFactory>>,
    partitioned_source_order: Vec<PlanNodeId>,
    grouped_scan_nodes: HashSet<PlanNodeId>,
    config: &SchedulerConfig,
) -> TestTask {
    let state_machine = Arc::new(TaskStateMachine::new(TaskId::new(task_id)));
    let task_context = Arc::new(TaskContext::new(TaskId::new(task_id)));
    let buffer = Arc::new(InMemoryOutputBuffer::new());
    let executor = Arc::new(TaskExecutor::new(4, Duration::from_millis(5)));
    let plan = LocalExecutionPlan::new(
        factories
            .into_iter()
            .map(|f| f as Arc<dyn DriverFactory>)
            .collect(),
        partitioned_source_order,
        grouped_scan_nodes,
    );
    let execution = create_task_execution(
        Arc::clone(&state_machine),
        Arc::clone(&task_context),
        buffer.clone() as Arc<dyn OutputBuffer>,
        &plan,
        Arc::clone(&executor),
        Arc::new(LoggingSplitMonitor),
        config,
    )
    .expect("task execution");
    TestTask {
        state_machine,
        task_context,
        buffer,
        execution,
        _executor: executor,
    }
}

fn data_source(
    plan_node_id: PlanNodeId,
    splits: Vec<ScheduledSplit>,
    no_more_for_lifespan: &[Lifespan],
    no_more: bool,
) -> TaskSource {
    TaskSource::new(
        plan_node_id,
        splits,
        no_more_for_lifespan.iter().copied().collect(),
        no_more,
    )
}

#[test]
fn test_ungrouped_task_runs_splits_and_finishes() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Ungrouped,
        Some(scan_node),
    ));
    let output = Arc::new(TestDriverFactory::new(
        1,
        PipelineExecutionStrategy::Ungrouped,
        None,
    ));
    let task = start_task(
        1,
        vec![Arc::clone(&scan), Arc::clone(&output)],
        vec![scan_node],
        HashSet::new(),
        &SchedulerConfig::default(),
    );

    let lifespan = Lifespan::task_wide();
    task.execution
        .add_sources(vec![data_source(
            scan_node,
            vec![
                ScheduledSplit::data(1, scan_node, lifespan, "split-a"),
                ScheduledSplit::data(2, scan_node, lifespan, "split-b"),
            ],
            &[],
            true,
        )])
        .expect("add sources");

    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
    assert_eq!(scan.splits_seen(), vec!["split-a", "split-b"]);
    assert_eq!(scan.created(), 2);
    assert!(scan.is_closed());
    assert!(output.is_closed());
    assert_eq!(
        task.execution.no_more_splits(),
        HashSet::from([scan_node])
    );
}

#[test]
fn test_redelivered_splits_are_acknowledged_once() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Ungrouped,
        Some(scan_node),
    ));
    let task = start_task(
        2,
        vec![Arc::clone(&scan)],
        vec![scan_node],
        HashSet::new(),
        &SchedulerConfig::default(),
    );

    let lifespan = Lifespan::task_wide();
    let first = vec![ScheduledSplit::data(1, scan_node, lifespan, "split-a")];
    task.execution
        .add_sources(vec![data_source(scan_node, first.clone(), &[], false)])
        .expect("add sources");
    // Coordinator retransmits the first split together with a new one.
    task.execution
        .add_sources(vec![data_source(
            scan_node,
            vec![
                ScheduledSplit::data(1, scan_node, lifespan, "split-a"),
                ScheduledSplit::data(2, scan_node, lifespan, "split-b"),
            ],
            &[],
            true,
        )])
        .expect("add sources");

    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
    assert_eq!(scan.splits_seen(), vec!["split-a", "split-b"]);
    assert_eq!(scan.created(), 2);
}

#[test]
fn test_grouped_driver_groups_complete_independently() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Grouped,
        Some(scan_node),
    ));
    let intermediate = Arc::new(TestDriverFactory::new(
        1,
        PipelineExecutionStrategy::Grouped,
        None,
    ));
    let output = Arc::new(TestDriverFactory::new(
        2,
        PipelineExecutionStrategy::Ungrouped,
        None,
    ));
    let task = start_task(
        3,
        vec![Arc::clone(&scan), Arc::clone(&intermediate), Arc::clone(&output)],
        vec![scan_node],
        HashSet::from([scan_node]),
        &SchedulerConfig::default(),
    );

    let g0 = Lifespan::driver_group(0);
    let g1 = Lifespan::driver_group(1);
    task.execution
        .add_sources(vec![data_source(
            scan_node,
            vec![
                ScheduledSplit::data(1, scan_node, g0, "g0-a"),
                ScheduledSplit::data(2, scan_node, g1, "g1-a"),
            ],
            &[g0],
            false,
        )])
        .expect("add sources");

    wait_until("group 0 to complete", || {
        task.task_context.completed_driver_groups().contains(&g0)
    });
    assert!(!task.task_context.completed_driver_groups().contains(&g1));
    assert_eq!(task.state_machine.state(), TaskState::Running);

    task.execution
        .add_sources(vec![data_source(scan_node, vec![], &[g1], true)])
        .expect("add sources");

    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
    let completed = task.task_context.completed_driver_groups();
    assert!(completed.contains(&g0) && completed.contains(&g1));
    // One intermediate driver instantiated per driver group, none task-wide.
    assert_eq!(intermediate.created(), 2);
    assert_eq!(scan.splits_seen(), vec!["g0-a", "g1-a"]);
}

#[test]
fn test_redelivery_after_driver_group_completion_is_absorbed() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Grouped,
        Some(scan_node),
    ));
    let task = start_task(
        9,
        vec![Arc::clone(&scan)],
        vec![scan_node],
        HashSet::from([scan_node]),
        &SchedulerConfig::default(),
    );

    let g0 = Lifespan::driver_group(0);
    let update = data_source(
        scan_node,
        vec![ScheduledSplit::data(1, scan_node, g0, "g0-a")],
        &[g0],
        false,
    );
    task.execution
        .add_sources(vec![update.clone()])
        .expect("add sources");
    wait_until("group 0 to complete", || {
        task.task_context.completed_driver_groups().contains(&g0)
    });
    assert_eq!(task.state_machine.state(), TaskState::Running);

    // The coordinator retransmits the identical cumulative update after the
    // group already ran to completion.
    task.execution
        .add_sources(vec![update])
        .expect("redelivered sources");
    assert_eq!(task.state_machine.state(), TaskState::Running);
    assert_eq!(scan.created(), 1);

    task.execution
        .add_sources(vec![data_source(scan_node, vec![], &[], true)])
        .expect("final sources");
    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
    assert_eq!(scan.splits_seen(), vec!["g0-a"]);
}

#[test]
fn test_fixed_source_order_unblocks_across_lifespans() {
    // Grouped scan first in the start order, ungrouped scan second: the
    // task-wide lifespan may only pass the grouped scan once some driver
    // group has scheduled beyond it.
    let grouped_node = PlanNodeId::new(1);
    let ungrouped_node = PlanNodeId::new(2);
    let grouped_scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Grouped,
        Some(grouped_node),
    ));
    let ungrouped_scan = Arc::new(TestDriverFactory::new(
        1,
        PipelineExecutionStrategy::Ungrouped,
        Some(ungrouped_node),
    ));
    let output = Arc::new(TestDriverFactory::new(
        2,
        PipelineExecutionStrategy::Ungrouped,
        None,
    ));
    let task = start_task(
        4,
        vec![Arc::clone(&grouped_scan), Arc::clone(&ungrouped_scan), output],
        vec![grouped_node, ungrouped_node],
        HashSet::from([grouped_node]),
        &SchedulerConfig::default(),
    );

    let g0 = Lifespan::driver_group(0);
    let task_wide = Lifespan::task_wide();
    // The ungrouped source arrives first; its lifespan is blocked behind the
    // grouped scan until the g0 splits in the same update release it.
    task.execution
        .add_sources(vec![
            data_source(
                ungrouped_node,
                vec![ScheduledSplit::data(1, ungrouped_node, task_wide, "tw-a")],
                &[],
                true,
            ),
            data_source(
                grouped_node,
                vec![ScheduledSplit::data(2, grouped_node, g0, "g0-a")],
                &[g0],
                true,
            ),
        ])
        .expect("add sources");

    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
    assert_eq!(grouped_scan.splits_seen(), vec!["g0-a"]);
    assert_eq!(ungrouped_scan.splits_seen(), vec!["tw-a"]);
    assert!(task.task_context.completed_driver_groups().contains(&g0));
}

#[test]
fn test_recovery_marker_waits_for_running_splits() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Ungrouped,
        Some(scan_node),
    ));
    let hold = Arc::clone(&scan.hold);
    hold.store(true, Ordering::SeqCst);
    let config = SchedulerConfig {
        recovery_enabled: true,
        ..SchedulerConfig::default()
    };
    let task = start_task(5, vec![Arc::clone(&scan)], vec![scan_node], HashSet::new(), &config);

    let lifespan = Lifespan::task_wide();
    task.execution
        .add_sources(vec![data_source(
            scan_node,
            vec![ScheduledSplit::data(1, scan_node, lifespan, "before")],
            &[],
            false,
        )])
        .expect("add sources");
    wait_until("first split to start", || scan.created() == 1);

    // Marker plus a trailing split while the first split is still running:
    // nothing may pass the barrier yet.
    task.execution
        .add_sources(vec![TaskSource::new(
            scan_node,
            vec![
                ScheduledSplit::marker(2, scan_node, lifespan, 7),
                ScheduledSplit::data(3, scan_node, lifespan, "after"),
            ],
            HashSet::new(),
            true,
        )])
        .expect("add sources");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(scan.created(), 1);
    assert!(task.buffer.take_pages().is_empty());

    // Completing the in-flight split releases the marker, then the held-back
    // split and the terminators.
    hold.store(false, Ordering::SeqCst);
    wait_until("both splits to run", || scan.splits_seen().len() == 2);

    let mut pages = Vec::new();
    wait_until("buffer to drain", || {
        pages.extend(task.buffer.take_pages());
        task.buffer.state() == BufferState::Finished
    });
    assert_eq!(pages, vec![Page::Marker(MarkerPage::new(7))]);
    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
    assert_eq!(scan.splits_seen(), vec!["after", "before"]);
}

#[test]
fn test_driver_failure_fails_task_with_first_cause() {
    let scan_node = PlanNodeId::new(1);
    let mut scan = TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Ungrouped,
        Some(scan_node),
    );
    scan.fail_with = Some("division by zero".to_string());
    let scan = Arc::new(scan);
    let task = start_task(
        6,
        vec![Arc::clone(&scan)],
        vec![scan_node],
        HashSet::new(),
        &SchedulerConfig::default(),
    );

    let lifespan = Lifespan::task_wide();
    task.execution
        .add_sources(vec![data_source(
            scan_node,
            vec![ScheduledSplit::data(1, scan_node, lifespan, "bad")],
            &[],
            true,
        )])
        .expect("add sources");

    wait_until("task to fail", || {
        task.state_machine.state() == TaskState::Failed
    });
    assert_eq!(
        task.state_machine.failure_cause().as_deref(),
        Some("division by zero")
    );
    // Updates for a failed task are absorbed, not rejected.
    task.execution
        .add_sources(vec![data_source(
            scan_node,
            vec![ScheduledSplit::data(2, scan_node, lifespan, "late")],
            &[],
            true,
        )])
        .expect("late add sources");
}

#[test]
fn test_suspend_and_resume_round_trip() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Ungrouped,
        Some(scan_node),
    ));
    let task = start_task(
        7,
        vec![Arc::clone(&scan)],
        vec![scan_node],
        HashSet::new(),
        &SchedulerConfig::default(),
    );

    task.execution.suspend();
    assert_eq!(task.state_machine.state(), TaskState::Suspended);
    // A second suspend is refused without side effects.
    task.execution.suspend();
    assert_eq!(task.state_machine.state(), TaskState::Suspended);

    task.execution.resume();
    assert_eq!(task.state_machine.state(), TaskState::Running);
    task.execution.resume();
    assert_eq!(task.state_machine.state(), TaskState::Running);

    task.execution
        .add_sources(vec![data_source(scan_node, vec![], &[], true)])
        .expect("add sources");
    wait_until("task to finish", || {
        task.state_machine.state() == TaskState::Finished
    });
}

#[test]
fn test_sources_rejected_for_task_terminal_at_creation() {
    let scan_node = PlanNodeId::new(1);
    let scan = Arc::new(TestDriverFactory::new(
        0,
        PipelineExecutionStrategy::Ungrouped,
        Some(scan_node),
    ));
    let state_machine = Arc::new(TaskStateMachine::new(TaskId::new(8)));
    assert!(state_machine.cancel());
    let task_context = Arc::new(TaskContext::new(TaskId::new(8)));
    let buffer = Arc::new(InMemoryOutputBuffer::new());
    let executor = Arc::new(TaskExecutor::new(2, Duration::from_millis(5)));
    let plan = LocalExecutionPlan::new(
        vec![scan as Arc<dyn DriverFactory>],
        vec![scan_node],
        HashSet::new(),
    );
    let execution = create_task_execution(
        state_machine,
        task_context,
        buffer as Arc<dyn OutputBuffer>,
        &plan,
        executor,
        Arc::new(LoggingSplitMonitor),
        &SchedulerConfig::default(),
    )
    .expect("task execution");

    let result = execution.add_sources(vec![data_source(scan_node, vec![], &[], true)]);
    assert!(result.is_err());
}
