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
//! Per-task split scheduler.
//!
//! Responsibilities:
//! - Decides when and with what inputs driver instances are created across the
//!   two axes of a task: pipelines and lifespans.
//! - Carries the task-level accounting contexts and split event monitor shared
//!   by the scheduler components.
//!
//! Key exported interfaces:
//! - Types: `TaskContext`, `PipelineContext`, `LoggingSplitMonitor`.
//! - Traits: `SplitMonitor`.
//! - Submodules: `pending_splits`, `status`, `scheduling`, `barrier`,
//!   `runner`, `execution`.

pub mod barrier;
pub mod execution;
pub mod pending_splits;
pub mod runner;
pub mod scheduling;
pub mod status;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::{PipelineId, TaskId};
use crate::exec::lifespan::Lifespan;
use crate::novatask_logging::{debug, info};

/// Split lifecycle observer, fired from completion callbacks on the
/// notification pool. Implementations must be cheap and non-blocking.
pub trait SplitMonitor: Send + Sync {
    fn split_completed(&self, task_id: TaskId, pipeline_id: PipelineId, info: &str);
    fn split_failed(&self, task_id: TaskId, pipeline_id: PipelineId, info: &str, cause: &str);
}

/// Default monitor that records split events in the task log.
pub struct LoggingSplitMonitor;

impl SplitMonitor for LoggingSplitMonitor {
    fn split_completed(&self, task_id: TaskId, pipeline_id: PipelineId, info: &str) {
        debug!(
            "Split completed: task_id={} pipeline={} {}",
            task_id, pipeline_id, info
        );
    }

    fn split_failed(&self, task_id: TaskId, pipeline_id: PipelineId, info: &str, cause: &str) {
        info!(
            "Split failed: task_id={} pipeline={} {} cause={}",
            task_id, pipeline_id, info, cause
        );
    }
}

/// Per-pipeline counters, updated lock-free from scheduler and worker threads.
pub struct PipelineContext {
    pipeline_id: PipelineId,
    splits_added: AtomicUsize,
    drivers_created: AtomicUsize,
    drivers_finished: AtomicUsize,
}

impl PipelineContext {
    fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            splits_added: AtomicUsize::new(0),
            drivers_created: AtomicUsize::new(0),
            drivers_finished: AtomicUsize::new(0),
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn record_splits_added(&self, count: usize) {
        self.splits_added.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_driver_created(&self) {
        self.drivers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_driver_finished(&self) {
        self.drivers_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn splits_added(&self) -> usize {
        self.splits_added.load(Ordering::Relaxed)
    }

    pub fn drivers_created(&self) -> usize {
        self.drivers_created.load(Ordering::Relaxed)
    }

    pub fn drivers_finished(&self) -> usize {
        self.drivers_finished.load(Ordering::Relaxed)
    }
}

/// Task-level accounting shared by the scheduler components. Records completed
/// driver groups; the completion signal from the status counters is
/// edge-triggered, so recording here is idempotent.
pub struct TaskContext {
    task_id: TaskId,
    pipelines: Mutex<HashMap<PipelineId, Arc<PipelineContext>>>,
    completed_driver_groups: Mutex<HashSet<Lifespan>>,
}

impl TaskContext {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            pipelines: Mutex::new(HashMap::new()),
            completed_driver_groups: Mutex::new(HashSet::new()),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn pipeline_context(&self, pipeline_id: PipelineId) -> Arc<PipelineContext> {
        let mut pipelines = self.pipelines.lock().expect("pipeline contexts lock");
        Arc::clone(
            pipelines
                .entry(pipeline_id)
                .or_insert_with(|| Arc::new(PipelineContext::new(pipeline_id))),
        )
    }

    /// Record a driver group as fully complete. Returns true only on the first
    /// recording for the lifespan.
    pub fn add_completed_driver_group(&self, lifespan: Lifespan) -> bool {
        let newly = self
            .completed_driver_groups
            .lock()
            .expect("completed driver groups lock")
            .insert(lifespan);
        if newly {
            info!(
                "Driver group complete: task_id={} lifespan={}",
                self.task_id, lifespan
            );
        }
        newly
    }

    pub fn completed_driver_groups(&self) -> Vec<Lifespan> {
        self.completed_driver_groups
            .lock()
            .expect("completed driver groups lock")
            .iter()
            .copied()
            .collect()
    }
}
