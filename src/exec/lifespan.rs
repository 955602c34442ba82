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
use std::fmt;

/// Identity of the data partition a driver is responsible for.
///
/// A driver either serves the whole task or one grouped bucket (e.g. all rows
/// that fall in bucket 42). Pipelines and lifespans are two perpendicular
/// organizations of a task's drivers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Lifespan {
    TaskWide,
    Group(u32),
}

impl Lifespan {
    pub const fn task_wide() -> Self {
        Lifespan::TaskWide
    }

    pub const fn driver_group(bucket: u32) -> Self {
        Lifespan::Group(bucket)
    }

    pub const fn is_task_wide(self) -> bool {
        matches!(self, Lifespan::TaskWide)
    }
}

impl fmt::Display for Lifespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifespan::TaskWide => write!(f, "TaskWide"),
            Lifespan::Group(bucket) => write!(f, "Group-{}", bucket),
        }
    }
}
