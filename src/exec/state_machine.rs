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
//! Task state machine.
//!
//! Responsibilities:
//! - Tracks one task's lifecycle state with monotone transitions toward a terminal state.
//! - Retains the first failure cause and notifies registered state-change listeners.
//!
//! Key exported interfaces:
//! - Types: `TaskState`, `TaskStateMachine`.

use std::sync::Mutex;

use crate::common::ids::TaskId;
use crate::novatask_logging::{debug, info};

/// Lifecycle state of one task. `Finished`, `Canceled`, `Aborted` and `Failed`
/// are terminal; a terminal state is never left.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Running,
    Suspended,
    Flushing,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Aborted | TaskState::Failed
        )
    }
}

/// Listener invoked with the new state after every transition.
pub type StateChangeListener = Box<dyn Fn(TaskState) + Send + Sync>;

struct StateMachineInner {
    state: TaskState,
    failure_cause: Option<String>,
}

/// Thread-safe task state holder. Transitions hold the internal lock briefly and
/// fire listeners after releasing it.
pub struct TaskStateMachine {
    task_id: TaskId,
    inner: Mutex<StateMachineInner>,
    listeners: Mutex<Vec<StateChangeListener>>,
}

impl TaskStateMachine {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            inner: Mutex::new(StateMachineInner {
                state: TaskState::Running,
                failure_cause: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().expect("task state lock").state
    }

    pub fn failure_cause(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("task state lock")
            .failure_cause
            .clone()
    }

    pub fn add_state_listener(&self, listener: StateChangeListener) {
        self.listeners.lock().expect("state listeners").push(listener);
    }

    pub fn transition_to_flushing(&self) -> bool {
        self.transition(TaskState::Flushing, None, |state| {
            matches!(state, TaskState::Running | TaskState::Suspended)
        })
    }

    pub fn finished(&self) -> bool {
        self.transition(TaskState::Finished, None, |state| !state.is_done())
    }

    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Canceled, None, |state| !state.is_done())
    }

    pub fn abort(&self) -> bool {
        self.transition(TaskState::Aborted, None, |state| !state.is_done())
    }

    /// Fail the task. The first cause wins; later failures are absorbed.
    pub fn failed(&self, cause: impl Into<String>) -> bool {
        self.transition(TaskState::Failed, Some(cause.into()), |state| {
            !state.is_done()
        })
    }

    pub fn suspend(&self) -> bool {
        self.transition(TaskState::Suspended, None, |state| {
            state == TaskState::Running
        })
    }

    pub fn resume(&self) -> bool {
        self.transition(TaskState::Running, None, |state| {
            state == TaskState::Suspended
        })
    }

    fn transition(
        &self,
        target: TaskState,
        cause: Option<String>,
        permitted: impl Fn(TaskState) -> bool,
    ) -> bool {
        {
            let mut inner = self.inner.lock().expect("task state lock");
            if !permitted(inner.state) {
                debug!(
                    "Task state transition skipped: task_id={} current={:?} target={:?}",
                    self.task_id, inner.state, target
                );
                return false;
            }
            inner.state = target;
            if inner.failure_cause.is_none() {
                inner.failure_cause = cause;
            }
        }
        info!(
            "Task state changed: task_id={} state={:?}",
            self.task_id, target
        );
        let listeners = self.listeners.lock().expect("state listeners");
        for listener in listeners.iter() {
            listener(target);
        }
        true
    }
}
