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
//! Worker-pool executor for split runners.
//!
//! Responsibilities:
//! - Runs split runners time-sliced across worker threads with panic capture.
//! - Tracks per-task registration, suspend/resume parking, and removal that
//!   cancels outstanding runners.
//! - Completes one `CompletionFuture` per runner on a notification pool so
//!   callbacks never run on worker threads.
//!
//! Key exported interfaces:
//! - Types: `CompletionFuture`, `TaskHandle`, `TaskExecutor`.
//! - Traits: `SplitRunner`.
//!
//! Current limitations:
//! - Admission control is round-robin only; the slot knobs accepted by
//!   `add_task` are recorded for observability, not enforced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::ids::TaskId;
use crate::novatask_logging::{debug, info, warn};

/// One schedulable unit of driver work. The executor calls `process_for`
/// repeatedly until `is_finished`, then closes the runner.
pub trait SplitRunner: Send {
    fn is_finished(&self) -> bool;
    fn process_for(&mut self, slice: Duration) -> Result<(), String>;
    fn info(&self) -> String;
    fn close(&mut self);
}

type CompletionCallback = Box<dyn FnOnce(Result<(), String>) + Send>;

enum CompletionState {
    Pending(Vec<CompletionCallback>),
    Done(Result<(), String>),
}

struct CompletionInner {
    state: Mutex<CompletionState>,
    notifier: ThreadPool,
}

/// Completion handle for one enqueued runner. Completes exactly once; callbacks
/// registered before or after completion all run on the notification pool.
#[derive(Clone)]
pub struct CompletionFuture {
    inner: Arc<CompletionInner>,
}

impl CompletionFuture {
    pub(crate) fn new(notifier: ThreadPool) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                state: Mutex::new(CompletionState::Pending(Vec::new())),
                notifier,
            }),
        }
    }

    pub fn on_complete(&self, callback: CompletionCallback) {
        let mut state = self.inner.state.lock().expect("completion state lock");
        match &mut *state {
            CompletionState::Pending(callbacks) => callbacks.push(callback),
            CompletionState::Done(result) => {
                let result = result.clone();
                self.inner.notifier.execute(move || callback(result));
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("completion state lock"),
            CompletionState::Done(_)
        )
    }

    pub(crate) fn complete(&self, result: Result<(), String>) {
        let callbacks = {
            let mut state = self.inner.state.lock().expect("completion state lock");
            match std::mem::replace(&mut *state, CompletionState::Done(result.clone())) {
                CompletionState::Pending(callbacks) => callbacks,
                CompletionState::Done(previous) => {
                    // already completed; keep the original result
                    *state = CompletionState::Done(previous);
                    return;
                }
            }
        };
        for callback in callbacks {
            let result = result.clone();
            self.inner.notifier.execute(move || callback(result));
        }
    }
}

/// Registration record for one task. Holds the suspend flag and the parking
/// lot for runners popped while the task is suspended.
pub struct TaskEntry {
    task_id: TaskId,
    removed: AtomicBool,
    suspended: AtomicBool,
    parked: Mutex<Vec<RunnerTask>>,
    utilization: Box<dyn Fn() -> f64 + Send + Sync>,
    initial_slots: usize,
    slot_adjust_interval: Duration,
    max_slots: Option<usize>,
}

impl TaskEntry {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Output-buffer utilization of the owning task, polled by slot adjusters.
    pub fn utilization(&self) -> f64 {
        (self.utilization)()
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

pub type TaskHandle = Arc<TaskEntry>;

struct RunnerTask {
    runner: Box<dyn SplitRunner>,
    completion: CompletionFuture,
    entry: TaskHandle,
}

struct ExecutorShared {
    queue: Mutex<VecDeque<RunnerTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl ExecutorShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }
}

/// Multi-threaded split-runner executor shared by the tasks of one worker
/// process. Submission never blocks on I/O; completion callbacks are delivered
/// on a separate notification pool.
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
    tasks: Mutex<HashMap<TaskId, TaskHandle>>,
    notifier: ThreadPool,
    time_slice: Duration,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TaskExecutor {
    pub fn new(num_threads: usize, time_slice: Duration) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(ExecutorShared::new());
        let notifier = ThreadPool::with_name("task-notification".to_string(), 1);

        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            workers.push(thread::spawn(move || worker_loop(shared_cloned, time_slice)));
        }

        Self {
            shared,
            tasks: Mutex::new(HashMap::new()),
            notifier,
            time_slice,
            workers,
        }
    }

    pub fn notification_pool(&self) -> ThreadPool {
        self.notifier.clone()
    }

    pub fn time_slice(&self) -> Duration {
        self.time_slice
    }

    pub fn add_task(
        &self,
        task_id: TaskId,
        utilization: Box<dyn Fn() -> f64 + Send + Sync>,
        initial_slots: usize,
        slot_adjust_interval: Duration,
        max_slots: Option<usize>,
    ) -> Result<TaskHandle, String> {
        let mut tasks = self.tasks.lock().expect("executor task registry lock");
        if tasks.contains_key(&task_id) {
            return Err(format!("task {} already registered with executor", task_id));
        }
        let entry = Arc::new(TaskEntry {
            task_id,
            removed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            parked: Mutex::new(Vec::new()),
            utilization,
            initial_slots,
            slot_adjust_interval,
            max_slots,
        });
        tasks.insert(task_id, Arc::clone(&entry));
        info!(
            "Task registered with executor: task_id={} initial_slots={} adjust_interval={:?} max_slots={:?}",
            task_id, entry.initial_slots, entry.slot_adjust_interval, entry.max_slots
        );
        Ok(entry)
    }

    /// Submit runners for a registered task. Returns one completion future per
    /// runner, in input order. `force_run` front-queues lifecycle runners so
    /// they are picked up ahead of split backlog.
    pub fn enqueue_splits(
        &self,
        handle: &TaskHandle,
        force_run: bool,
        runners: Vec<Box<dyn SplitRunner>>,
    ) -> Vec<CompletionFuture> {
        let mut futures = Vec::with_capacity(runners.len());
        let mut queue = self.shared.queue.lock().expect("executor queue lock");
        for runner in runners {
            let completion = CompletionFuture::new(self.notifier.clone());
            futures.push(completion.clone());
            let task = RunnerTask {
                runner,
                completion,
                entry: Arc::clone(handle),
            };
            if force_run {
                queue.push_front(task);
            } else {
                queue.push_back(task);
            }
        }
        self.shared.cv.notify_all();
        futures
    }

    /// Deregister a task, closing outstanding runners. Their completion futures
    /// fail with a cancellation error; by the time removal runs, the task state
    /// machine is terminal and the failure is absorbed there. Idempotent.
    pub fn remove_task(&self, handle: &TaskHandle) {
        if handle.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tasks
            .lock()
            .expect("executor task registry lock")
            .remove(&handle.task_id);

        let mut cancelled: Vec<RunnerTask> = {
            let mut queue = self.shared.queue.lock().expect("executor queue lock");
            let mut kept = VecDeque::with_capacity(queue.len());
            let mut removed = Vec::new();
            for task in queue.drain(..) {
                if Arc::ptr_eq(&task.entry, handle) {
                    removed.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            *queue = kept;
            removed
        };
        cancelled.extend(handle.parked.lock().expect("parked runners lock").drain(..));

        debug!(
            "Task removed from executor: task_id={} cancelled_runners={}",
            handle.task_id,
            cancelled.len()
        );
        for mut task in cancelled {
            task.runner.close();
            task.completion
                .complete(Err("task removed from executor".to_string()));
        }
    }

    pub fn suspend_task(&self, task_id: TaskId) {
        let Some(entry) = self.lookup(task_id) else {
            warn!("Suspend requested for unknown task: task_id={}", task_id);
            return;
        };
        let parked = entry.parked.lock().expect("parked runners lock");
        entry.suspended.store(true, Ordering::Release);
        drop(parked);
        info!("Task suspended in executor: task_id={}", task_id);
    }

    pub fn resume_task(&self, task_id: TaskId) {
        let Some(entry) = self.lookup(task_id) else {
            warn!("Resume requested for unknown task: task_id={}", task_id);
            return;
        };
        let resumed: Vec<RunnerTask> = {
            let mut parked = entry.parked.lock().expect("parked runners lock");
            entry.suspended.store(false, Ordering::Release);
            parked.drain(..).collect()
        };
        if !resumed.is_empty() {
            let mut queue = self.shared.queue.lock().expect("executor queue lock");
            queue.extend(resumed);
            self.shared.cv.notify_all();
        }
        info!("Task resumed in executor: task_id={}", task_id);
    }

    fn lookup(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.tasks
            .lock()
            .expect("executor task registry lock")
            .get(&task_id)
            .cloned()
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.notifier.join();
    }
}

fn worker_loop(shared: Arc<ExecutorShared>, time_slice: Duration) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("executor queue lock");
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared
                    .cv
                    .wait(queue)
                    .expect("executor queue condvar wait");
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            queue.pop_front()
        };

        let Some(mut task) = task else {
            continue;
        };

        if task.entry.is_removed() {
            task.runner.close();
            task.completion
                .complete(Err("task removed from executor".to_string()));
            continue;
        }

        if task.entry.is_suspended() {
            let entry = Arc::clone(&task.entry);
            let mut parked = entry.parked.lock().expect("parked runners lock");
            // re-check under the parking lock so a concurrent resume cannot
            // strand this runner
            if entry.is_suspended() {
                parked.push(task);
                continue;
            }
            drop(parked);
            let mut queue = shared.queue.lock().expect("executor queue lock");
            queue.push_back(task);
            shared.cv.notify_one();
            continue;
        }

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.runner.process_for(time_slice)
        }))
        .unwrap_or_else(|payload| {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            Err(format!("panic in split runner: {msg}"))
        });

        match outcome {
            Ok(()) => {
                if task.runner.is_finished() {
                    task.runner.close();
                    task.completion.complete(Ok(()));
                } else {
                    let mut queue = shared.queue.lock().expect("executor queue lock");
                    queue.push_back(task);
                    shared.cv.notify_one();
                }
            }
            Err(err) => {
                task.runner.close();
                task.completion.complete(Err(err));
            }
        }
    }
}
