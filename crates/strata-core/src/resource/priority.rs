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

/// The loading priority class of a resource.
///
/// Each resource type registers a default; individual resources can
/// override it. `Critical` is reserved for blocking requests that must jump
/// the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourcePriority {
    /// Load before everything else; used for blocking acquires.
    Critical,
    /// Load as soon as possible.
    VeryHigh,
    /// Load soon.
    High,
    /// The default class.
    Medium,
    /// Load late.
    Low,
    /// Load last.
    VeryLow,
}

impl ResourcePriority {
    /// The base value of the class; smaller loads sooner.
    fn base_value(self) -> f32 {
        match self {
            ResourcePriority::Critical => 0.0,
            ResourcePriority::VeryHigh => 100.0,
            ResourcePriority::High => 200.0,
            ResourcePriority::Medium => 300.0,
            ResourcePriority::Low => 400.0,
            ResourcePriority::VeryLow => 500.0,
        }
    }

    /// Computes the sortable loading-priority value for a resource of this
    /// class that was last acquired `idle` ago. Smaller values load sooner;
    /// within a class, the most recently acquired resource wins, which
    /// approximates "load what is needed soonest" without LRU bookkeeping.
    pub fn loading_priority(self, idle: Duration) -> f32 {
        self.base_value() + idle.as_secs_f32()
    }
}

impl Default for ResourcePriority {
    fn default() -> Self {
        ResourcePriority::Medium
    }
}
