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

/// An opaque, process-wide unique identity for a resource type.
///
/// A token is built from a static type name ("Texture2D", "Mesh") and
/// carries a 64-bit hash of that name for cheap comparison and map keys.
/// The resource manager routes every resource id through its token to find
/// the registered constructor, loader and fallbacks for that type.
///
/// [`TypeToken::NULL`] is the distinguishable "no type" value; requesting a
/// resource with it is a programmer error.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeToken {
    hash: u64,
    name: &'static str,
}

impl TypeToken {
    /// The null token. Identifies no type.
    pub const NULL: TypeToken = TypeToken { hash: 0, name: "" };

    /// Creates a token for the given static type name.
    pub fn new(name: &'static str) -> Self {
        debug_assert!(!name.is_empty(), "a type token needs a non-empty name");
        // FNV-1a; stable across processes, never 0 for a non-empty name.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        Self { hash, name }
    }

    /// Whether this is the null token.
    pub fn is_null(&self) -> bool {
        self.hash == 0
    }

    /// The type name the token was built from. Empty for the null token.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("TypeToken(NULL)")
        } else {
            write!(f, "TypeToken({})", self.name)
        }
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_null() { "<null>" } else { self.name })
    }
}
