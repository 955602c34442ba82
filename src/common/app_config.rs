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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaTaskConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaTaskConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaTaskConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaTaskConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = NovaTaskConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static NovaTaskConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVATASK_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novatask.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVATASK_CONFIG or create ./novatask.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct NovaTaskConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novatask=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl NovaTaskConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: NovaTaskConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for NovaTaskConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn default_exec_threads() -> usize {
    0
}

fn default_initial_slots_per_node() -> usize {
    4
}

fn default_slot_adjust_interval_millis() -> u64 {
    100
}

fn default_max_slots_per_task() -> Option<usize> {
    None
}

fn default_recovery_enabled() -> bool {
    false
}

fn default_max_drivers_per_task() -> Option<usize> {
    None
}

/// Task scheduling knobs, read once when a task execution is constructed.
///
/// Concurrency admission control itself lives in the executor; the scheduler only
/// records these values and hands them to `TaskExecutor::add_task`.
#[derive(Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads for the driver executor. 0 means available parallelism.
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,

    #[serde(default = "default_initial_slots_per_node")]
    pub initial_slots_per_node: usize,

    #[serde(default = "default_slot_adjust_interval_millis")]
    pub slot_adjust_interval_millis: u64,

    #[serde(default = "default_max_slots_per_task")]
    pub max_slots_per_task: Option<usize>,

    #[serde(default = "default_recovery_enabled")]
    pub recovery_enabled: bool,

    #[serde(default = "default_max_drivers_per_task")]
    pub max_drivers_per_task: Option<usize>,
}

impl SchedulerConfig {
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            return self.exec_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            exec_threads: default_exec_threads(),
            initial_slots_per_node: default_initial_slots_per_node(),
            slot_adjust_interval_millis: default_slot_adjust_interval_millis(),
            max_slots_per_task: default_max_slots_per_task(),
            recovery_enabled: default_recovery_enabled(),
            max_drivers_per_task: default_max_drivers_per_task(),
        }
    }
}
