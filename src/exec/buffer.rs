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
//! Task output buffer boundary.
//!
//! Responsibilities:
//! - Defines the buffer state machine and the `OutputBuffer` contract the task
//!   scheduler drives to completion.
//! - Provides an in-memory buffer for tests and single-process deployments.
//!
//! Key exported interfaces:
//! - Types: `BufferState`, `Page`, `InMemoryOutputBuffer`.
//! - Traits: `OutputBuffer`.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::exec::split::MarkerPage;
use crate::novatask_logging::debug;

/// Output buffer lifecycle. `Finished`, `Failed` and `Aborted` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferState {
    Open,
    NoMorePages,
    Flushing,
    Finished,
    Failed,
    Aborted,
}

impl BufferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BufferState::Finished | BufferState::Failed | BufferState::Aborted
        )
    }
}

/// One buffered output page. The scheduler itself only ever enqueues marker
/// pages; data pages come from pipeline sink operators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Page {
    Data(Vec<u8>),
    Marker(MarkerPage),
}

pub type BufferStateListener = Box<dyn Fn(BufferState) + Send + Sync>;

/// Downstream page buffer for one task. The scheduler drives it with
/// `set_no_more_pages` and watches its state to decide task completion; marker
/// broadcast bypasses the source pipelines and enqueues directly.
pub trait OutputBuffer: Send + Sync {
    fn add_state_listener(&self, listener: BufferStateListener);
    fn state(&self) -> BufferState;
    fn set_no_more_pages(&self);
    fn enqueue(&self, pages: Vec<Page>);
    fn enqueue_partitioned(&self, partition: usize, pages: Vec<Page>);
    fn failure_cause(&self) -> Option<String>;
    /// Fill fraction in [0, 1], sampled by the executor for concurrency tuning.
    fn utilization(&self) -> f64;
}

struct BufferControlBlock {
    queue: VecDeque<Page>,
    state: BufferState,
    failure: Option<String>,
}

/// Single-queue in-memory output buffer. Partitioned enqueue collapses into the
/// one queue; partition fan-out belongs to the transport layer, not here.
pub struct InMemoryOutputBuffer {
    block: Mutex<BufferControlBlock>,
    listeners: Mutex<Vec<BufferStateListener>>,
}

impl InMemoryOutputBuffer {
    pub fn new() -> Self {
        Self {
            block: Mutex::new(BufferControlBlock {
                queue: VecDeque::new(),
                state: BufferState::Open,
                failure: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Drain currently buffered pages, moving to `Finished` once the producer
    /// side is closed and everything has been taken.
    pub fn take_pages(&self) -> Vec<Page> {
        let (pages, new_state) = {
            let mut block = self.block.lock().expect("output buffer lock");
            let pages: Vec<Page> = block.queue.drain(..).collect();
            if matches!(block.state, BufferState::NoMorePages | BufferState::Flushing)
                && block.queue.is_empty()
            {
                block.state = BufferState::Finished;
                (pages, Some(BufferState::Finished))
            } else {
                (pages, None)
            }
        };
        if let Some(state) = new_state {
            self.notify(state);
        }
        pages
    }

    pub fn fail(&self, cause: impl Into<String>) {
        let changed = {
            let mut block = self.block.lock().expect("output buffer lock");
            if block.state.is_terminal() {
                false
            } else {
                block.state = BufferState::Failed;
                block.failure = Some(cause.into());
                true
            }
        };
        if changed {
            self.notify(BufferState::Failed);
        }
    }

    pub fn abort(&self) {
        let changed = {
            let mut block = self.block.lock().expect("output buffer lock");
            if block.state.is_terminal() {
                false
            } else {
                block.state = BufferState::Aborted;
                true
            }
        };
        if changed {
            self.notify(BufferState::Aborted);
        }
    }

    fn notify(&self, state: BufferState) {
        let listeners = self.listeners.lock().expect("buffer listeners");
        for listener in listeners.iter() {
            listener(state);
        }
    }
}

impl Default for InMemoryOutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer for InMemoryOutputBuffer {
    fn add_state_listener(&self, listener: BufferStateListener) {
        self.listeners.lock().expect("buffer listeners").push(listener);
    }

    fn state(&self) -> BufferState {
        self.block.lock().expect("output buffer lock").state
    }

    fn set_no_more_pages(&self) {
        let new_state = {
            let mut block = self.block.lock().expect("output buffer lock");
            if block.state != BufferState::Open {
                None
            } else if block.queue.is_empty() {
                block.state = BufferState::Finished;
                Some(BufferState::Finished)
            } else {
                block.state = BufferState::Flushing;
                Some(BufferState::Flushing)
            }
        };
        if let Some(state) = new_state {
            self.notify(state);
        }
    }

    fn enqueue(&self, pages: Vec<Page>) {
        let mut block = self.block.lock().expect("output buffer lock");
        if block.state.is_terminal() {
            debug!("dropping {} page(s) enqueued after buffer close", pages.len());
            return;
        }
        block.queue.extend(pages);
    }

    fn enqueue_partitioned(&self, _partition: usize, pages: Vec<Page>) {
        self.enqueue(pages);
    }

    fn failure_cause(&self) -> Option<String> {
        self.block.lock().expect("output buffer lock").failure.clone()
    }

    fn utilization(&self) -> f64 {
        let len = self.block.lock().expect("output buffer lock").queue.len();
        (len as f64 / 64.0).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn empty_buffer_finishes_on_no_more_pages() {
        let buffer = InMemoryOutputBuffer::new();
        assert_eq!(buffer.state(), BufferState::Open);
        buffer.set_no_more_pages();
        assert_eq!(buffer.state(), BufferState::Finished);
    }

    #[test]
    fn flushing_until_drained() {
        let buffer = InMemoryOutputBuffer::new();
        buffer.enqueue(vec![Page::Data(vec![1, 2, 3])]);
        buffer.set_no_more_pages();
        assert_eq!(buffer.state(), BufferState::Flushing);
        let pages = buffer.take_pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(buffer.state(), BufferState::Finished);
    }

    #[test]
    fn finish_listener_fires() {
        let buffer = InMemoryOutputBuffer::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_listener = Arc::clone(&fired);
        buffer.add_state_listener(Box::new(move |state| {
            if state == BufferState::Finished {
                fired_in_listener.store(true, Ordering::SeqCst);
            }
        }));
        buffer.set_no_more_pages();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn failure_cause_is_kept() {
        let buffer = InMemoryOutputBuffer::new();
        buffer.fail("downstream went away");
        assert_eq!(buffer.state(), BufferState::Failed);
        assert_eq!(
            buffer.failure_cause().as_deref(),
            Some("downstream went away")
        );
        // Terminal state is sticky.
        buffer.abort();
        assert_eq!(buffer.state(), BufferState::Failed);
    }
}
