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

//! # Strata Core
//!
//! Foundational crate containing traits, core types, and interface contracts
//! for the Strata resource system. This crate defines the "common language"
//! of the resource pipeline: identifiers, the [`resource::Resource`]
//! lifecycle contract, the [`loader::ResourceTypeLoader`] strategy, events
//! and the clock abstraction. It carries no loading policy of its own.
//! The orchestrator lives in `strata-resource`.

#![warn(missing_docs)]

pub mod event;
pub mod loader;
pub mod resource;
pub mod time;
