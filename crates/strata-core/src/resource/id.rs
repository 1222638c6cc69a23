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

use std::fmt;
use std::hash::{Hash, Hasher};

// Fixed seeds so id hashes are stable across processes and runs. The exact
// values are arbitrary; they must never change once resource ids are cached
// anywhere by hash.
const ID_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x4c7_2940_11ae_2261,
    0x9e37_79b9_7f4a_7c15,
    0x6a09_e667_f3bc_c908,
    0xbb67_ae85_84ca_a73b,
);

/// The unique identifier of a resource.
///
/// An id is an opaque string, usually a file path or a generated name,
/// normalized on construction (backslashes become forward slashes)
/// and hashed once to a stable 64-bit value used for fast registry lookups.
///
/// Equality and hashing are defined on the normalized string form. Two ids
/// with equal hashes but different strings are a hash collision and compare
/// unequal.
#[derive(Debug, Clone)]
pub struct ResourceId {
    id: String,
    hash: u64,
}

impl ResourceId {
    /// Creates an id from a string-like value, normalizing path separators.
    pub fn new(id: impl Into<String>) -> Self {
        let mut id = id.into();
        if id.contains('\\') {
            id = id.replace('\\', "/");
        }
        let hash = Self::hash_str(&id);
        Self { id, hash }
    }

    /// The stable 64-bit hash of the normalized id string.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The normalized id string.
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Whether the id is the empty string. Empty ids identify nothing and
    /// are rejected by the resource manager.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    fn hash_str(s: &str) -> u64 {
        let (a, b, c, d) = ID_HASH_SEEDS;
        ahash::RandomState::with_seeds(a, b, c, d).hash_one(s)
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        // hash first: cheap reject for the overwhelmingly common case
        self.hash == other.hash && self.id == other.id
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
