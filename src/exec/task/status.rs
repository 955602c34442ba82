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
//! Aggregate driver counters of one task.
//!
//! Responsibilities:
//! - Tracks pending driver creations and remaining drivers per pipeline, per
//!   lifespan, and per (pipeline, lifespan) under one internal lock.
//! - Detects lifespan completion on the transition edge and notifies the
//!   registered listener after the lock is released.
//!
//! Lock hierarchy: the task lock may be held when calling in here; nothing in
//! this module calls back out while holding its own lock.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::common::ids::{PipelineId, TaskId};
use crate::exec::driver::PipelineExecutionStrategy;
use crate::exec::lifespan::Lifespan;
use crate::novatask_logging::debug;

/// Listener fired when a non-task-wide lifespan has no more driver runners and
/// zero remaining drivers. Fired on the transition; idempotence is the
/// listener's responsibility.
pub type LifespanCompletionListener = Box<dyn Fn(Lifespan) + Send + Sync>;

struct PerPipeline {
    strategy: PipelineExecutionStrategy,
    pending_creation: usize,
    lifespans_with_no_more_driver_runners: usize,
    unacknowledged_closed_lifespans: Vec<Lifespan>,
}

#[derive(Default)]
struct PerLifespan {
    remaining_driver: usize,
    pipelines_with_no_more_driver_runners: usize,
}

#[derive(Default)]
struct PerPipelineLifespan {
    pending_creation: usize,
    no_more_driver_runner: bool,
}

struct StatusInner {
    per_pipeline: HashMap<PipelineId, PerPipeline>,
    per_lifespan: HashMap<Lifespan, PerLifespan>,
    per_pipeline_lifespan: HashMap<(PipelineId, Lifespan), PerPipelineLifespan>,
    overall_remaining_driver: usize,
    no_more_lifespans: bool,
}

impl StatusInner {
    fn pipeline(&mut self, pipeline_id: PipelineId) -> &mut PerPipeline {
        self.per_pipeline
            .get_mut(&pipeline_id)
            .unwrap_or_else(|| panic!("unregistered pipeline {}", pipeline_id))
    }

    fn grouped_lifespan_count(&self) -> usize {
        let task_wide = usize::from(self.per_lifespan.contains_key(&Lifespan::task_wide()));
        self.per_lifespan.len() - task_wide
    }

    fn is_no_more_driver_runners_for_lifespan(
        &self,
        lifespan: Lifespan,
        ungrouped_pipelines: usize,
        grouped_pipelines: usize,
    ) -> bool {
        let expected = if lifespan.is_task_wide() {
            ungrouped_pipelines
        } else {
            grouped_pipelines
        };
        let count = self
            .per_lifespan
            .get(&lifespan)
            .map(|s| s.pipelines_with_no_more_driver_runners)
            .unwrap_or(0);
        count == expected
    }
}

/// Thread-safe counter aggregate. All operations take the internal lock
/// briefly and never wait on anything external while holding it.
pub struct Status {
    task_id: TaskId,
    ungrouped_pipelines: usize,
    grouped_pipelines: usize,
    inner: Mutex<StatusInner>,
    completion_listener: LifespanCompletionListener,
}

impl Status {
    pub fn new(
        task_id: TaskId,
        pipelines: &[(PipelineId, PipelineExecutionStrategy)],
        completion_listener: LifespanCompletionListener,
    ) -> Self {
        let mut per_pipeline = HashMap::new();
        let mut ungrouped_pipelines = 0;
        let mut grouped_pipelines = 0;
        for (pipeline_id, strategy) in pipelines {
            match strategy {
                PipelineExecutionStrategy::Ungrouped => ungrouped_pipelines += 1,
                PipelineExecutionStrategy::Grouped => grouped_pipelines += 1,
            }
            per_pipeline.insert(
                *pipeline_id,
                PerPipeline {
                    strategy: *strategy,
                    pending_creation: 0,
                    lifespans_with_no_more_driver_runners: 0,
                    unacknowledged_closed_lifespans: Vec::new(),
                },
            );
        }
        Self {
            task_id,
            ungrouped_pipelines,
            grouped_pipelines,
            inner: Mutex::new(StatusInner {
                per_pipeline,
                per_lifespan: HashMap::new(),
                per_pipeline_lifespan: HashMap::new(),
                overall_remaining_driver: 0,
                no_more_lifespans: false,
            }),
            completion_listener,
        }
    }

    pub fn increment_pending_creation(&self, pipeline_id: PipelineId, lifespan: Lifespan) {
        let mut inner = self.lock();
        let both = inner
            .per_pipeline_lifespan
            .entry((pipeline_id, lifespan))
            .or_default();
        assert!(
            !both.no_more_driver_runner,
            "cannot create driver after no-more-driver-runners for pipeline {} lifespan {}",
            pipeline_id, lifespan
        );
        both.pending_creation += 1;
        inner.per_lifespan.entry(lifespan).or_default();
        inner.pipeline(pipeline_id).pending_creation += 1;
    }

    pub fn decrement_pending_creation(&self, pipeline_id: PipelineId, lifespan: Lifespan) {
        let mut inner = self.lock();
        let both = inner
            .per_pipeline_lifespan
            .get_mut(&(pipeline_id, lifespan))
            .expect("pending creation never incremented");
        assert!(
            both.pending_creation > 0,
            "pending creation underflow for pipeline {} lifespan {}",
            pipeline_id, lifespan
        );
        both.pending_creation -= 1;
        let closed = both.pending_creation == 0 && both.no_more_driver_runner;
        let pipeline = inner.pipeline(pipeline_id);
        assert!(pipeline.pending_creation > 0, "pipeline pending creation underflow");
        pipeline.pending_creation -= 1;
        if closed {
            pipeline.unacknowledged_closed_lifespans.push(lifespan);
        }
    }

    /// Flag that no further driver runners will be created for this
    /// (pipeline, lifespan). Idempotent.
    pub fn set_no_more_driver_runners(&self, pipeline_id: PipelineId, lifespan: Lifespan) {
        let completed = {
            let mut inner = self.lock();
            let both = inner
                .per_pipeline_lifespan
                .entry((pipeline_id, lifespan))
                .or_default();
            if both.no_more_driver_runner {
                return;
            }
            both.no_more_driver_runner = true;
            let closed = both.pending_creation == 0;
            let pipeline = inner.pipeline(pipeline_id);
            pipeline.lifespans_with_no_more_driver_runners += 1;
            if closed {
                pipeline.unacknowledged_closed_lifespans.push(lifespan);
            }
            inner
                .per_lifespan
                .entry(lifespan)
                .or_default()
                .pipelines_with_no_more_driver_runners += 1;
            self.lifespan_completed(&inner, lifespan)
        };
        self.report_completion(completed);
    }

    pub fn increment_remaining_driver(&self, lifespan: Lifespan) {
        let mut inner = self.lock();
        assert!(
            !inner.is_no_more_driver_runners_for_lifespan(
                lifespan,
                self.ungrouped_pipelines,
                self.grouped_pipelines
            ),
            "cannot add driver to lifespan {} after no-more-driver-runners",
            lifespan
        );
        inner.per_lifespan.entry(lifespan).or_default().remaining_driver += 1;
        inner.overall_remaining_driver += 1;
    }

    pub fn decrement_remaining_driver(&self, lifespan: Lifespan) {
        let completed = {
            let mut inner = self.lock();
            let per_lifespan = inner
                .per_lifespan
                .get_mut(&lifespan)
                .expect("remaining driver never incremented");
            assert!(
                per_lifespan.remaining_driver > 0,
                "remaining driver underflow for lifespan {}",
                lifespan
            );
            per_lifespan.remaining_driver -= 1;
            let reached_zero = per_lifespan.remaining_driver == 0;
            assert!(inner.overall_remaining_driver > 0, "overall remaining underflow");
            inner.overall_remaining_driver -= 1;
            if reached_zero {
                self.lifespan_completed(&inner, lifespan)
            } else {
                None
            }
        };
        self.report_completion(completed);
    }

    pub fn set_no_more_lifespans(&self) {
        let mut inner = self.lock();
        if inner.no_more_lifespans {
            return;
        }
        inner.no_more_lifespans = true;
        debug!("No more lifespans: task_id={}", self.task_id);
    }

    pub fn is_no_more_lifespans(&self) -> bool {
        self.lock().no_more_lifespans
    }

    /// Whether the pipeline will never create another driver runner in any
    /// lifespan. For a grouped pipeline the answer can only turn true after
    /// the set of lifespans is closed.
    pub fn is_no_more_driver_runners_for_pipeline(&self, pipeline_id: PipelineId) -> bool {
        let inner = self.lock();
        let pipeline = inner
            .per_pipeline
            .get(&pipeline_id)
            .unwrap_or_else(|| panic!("unregistered pipeline {}", pipeline_id));
        match pipeline.strategy {
            PipelineExecutionStrategy::Ungrouped => {
                pipeline.lifespans_with_no_more_driver_runners == 1
            }
            PipelineExecutionStrategy::Grouped => {
                inner.no_more_lifespans
                    && pipeline.lifespans_with_no_more_driver_runners
                        == inner.grouped_lifespan_count()
            }
        }
    }

    pub fn is_no_more_driver_runners_for_lifespan(&self, lifespan: Lifespan) -> bool {
        self.lock().is_no_more_driver_runners_for_lifespan(
            lifespan,
            self.ungrouped_pipelines,
            self.grouped_pipelines,
        )
    }

    /// Drain the pipeline's queue of lifespans whose last pending creation
    /// finished after no-more-driver-runners.
    pub fn get_and_acknowledge_closed_lifespans(&self, pipeline_id: PipelineId) -> Vec<Lifespan> {
        std::mem::take(
            &mut self
                .lock()
                .pipeline(pipeline_id)
                .unacknowledged_closed_lifespans,
        )
    }

    pub fn pending_creation(&self, pipeline_id: PipelineId) -> usize {
        self.lock().pipeline(pipeline_id).pending_creation
    }

    pub fn overall_remaining_driver(&self) -> usize {
        self.lock().overall_remaining_driver
    }

    pub fn remaining_driver(&self, lifespan: Lifespan) -> usize {
        self.lock()
            .per_lifespan
            .get(&lifespan)
            .map(|s| s.remaining_driver)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.inner.lock().expect("status lock")
    }

    fn lifespan_completed(&self, inner: &StatusInner, lifespan: Lifespan) -> Option<Lifespan> {
        if lifespan.is_task_wide() {
            return None;
        }
        let per_lifespan = inner.per_lifespan.get(&lifespan)?;
        if per_lifespan.remaining_driver != 0 {
            return None;
        }
        if !inner.is_no_more_driver_runners_for_lifespan(
            lifespan,
            self.ungrouped_pipelines,
            self.grouped_pipelines,
        ) {
            return None;
        }
        Some(lifespan)
    }

    fn report_completion(&self, completed: Option<Lifespan>) {
        if let Some(lifespan) = completed {
            (self.completion_listener)(lifespan);
        }
    }
}
