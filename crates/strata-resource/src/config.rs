// Copyright 2025 Strata Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::ResourceManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Worker threads opening data streams (I/O bound stage).
    pub data_load_workers: usize,
    /// Worker threads running content updates (CPU bound stage). Types that
    /// declare a main-thread restriction bypass these and run during
    /// [`crate::ResourceManager::update`] instead.
    pub update_content_workers: usize,
    /// How long a resource must stay unreferenced and unacquired before the
    /// automatic sweep may free it.
    pub auto_free_idle_threshold: Duration,
    /// Time budget for the automatic sweep run by each
    /// [`crate::ResourceManager::update`]. `None` disables the automatic
    /// sweep; explicit [`crate::ResourceManager::free_unused_resources`]
    /// calls still work.
    pub auto_free_sweep_budget: Option<Duration>,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            data_load_workers: 2,
            update_content_workers: 1,
            auto_free_idle_threshold: Duration::from_secs(60),
            auto_free_sweep_budget: None,
        }
    }
}
