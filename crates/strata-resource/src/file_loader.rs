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

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use strata_core::loader::{
    write_stream_header, LoadData, LoaderError, ResourceRequest, ResourceTypeLoader, StreamHeader,
};

// Fixed seeds so content hashes are comparable across runs.
const CONTENT_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// The default loader: treats the resource id as a path, relative to a root
/// directory unless absolute, and serves the file contents behind the
/// standard stream header.
#[derive(Debug, Clone)]
pub struct FileResourceLoader {
    root: PathBuf,
}

impl FileResourceLoader {
    /// Creates a loader resolving relative ids against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, id: &str) -> PathBuf {
        let path = Path::new(id);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn modification_time(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
    }
}

impl ResourceTypeLoader for FileResourceLoader {
    fn open_data_stream(&self, request: &ResourceRequest<'_>) -> Result<LoadData, LoaderError> {
        let path = self.resolve(request.id.as_str());
        let bytes = std::fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                LoaderError::NotFound {
                    id: request.id.as_str().to_string(),
                }
            } else {
                LoaderError::Io(err)
            }
        })?;
        let modification_time = Self::modification_time(&path);

        let absolute = path.canonicalize().unwrap_or(path);
        let (a, b, c, d) = CONTENT_HASH_SEEDS;
        let content_hash =
            ahash::RandomState::with_seeds(a, b, c, d).hash_one(bytes.as_slice());

        let mut buffer = Vec::with_capacity(bytes.len() + 64);
        write_stream_header(
            &mut buffer,
            &StreamHeader {
                source_path: absolute.to_string_lossy().into_owned(),
                content_hash,
            },
        )?;
        buffer.extend_from_slice(&bytes);

        Ok(LoadData {
            stream: Box::new(Cursor::new(buffer)),
            modification_time,
        })
    }

    fn is_resource_outdated(
        &self,
        request: &ResourceRequest<'_>,
        loaded_modification_time: Option<SystemTime>,
    ) -> bool {
        let path = self.resolve(request.id.as_str());
        match (Self::modification_time(&path), loaded_modification_time) {
            (Some(on_disk), Some(loaded)) => on_disk != loaded,
            // No recorded time, or the backing file is gone: reload and let
            // the pipeline sort out what that means.
            _ => true,
        }
    }
}
