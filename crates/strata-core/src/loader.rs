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

//! The pluggable loading strategy that turns a resource id into raw bytes.
//!
//! A [`ResourceTypeLoader`] only produces byte streams; decoding them is the
//! resource's own job ([`crate::resource::Resource::update_content`]). The
//! split matters because opening the stream is I/O-bound and runs on the
//! data-load stage of the pipeline, while decoding is CPU-bound and runs on
//! the update-content stage.

use std::io::{self, Read, Write};
use std::time::SystemTime;

use thiserror::Error;

use crate::resource::{ResourceId, TypeToken};

/// What a loader gets to see about the resource it loads for.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest<'a> {
    /// The id of the resource to open data for.
    pub id: &'a ResourceId,
    /// The type of the resource the data is for.
    pub type_token: TypeToken,
}

/// An open data stream plus the side information a loader produced with it.
pub struct LoadData {
    /// The readable byte stream. The first bytes are always the standard
    /// header written with [`write_stream_header`].
    pub stream: Box<dyn Read + Send>,
    /// Modification time of the backing data, if the loader knows it. Used
    /// by the outdated check for reloads.
    pub modification_time: Option<SystemTime>,
}

impl std::fmt::Debug for LoadData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadData")
            .field("modification_time", &self.modification_time)
            .finish_non_exhaustive()
    }
}

/// Why opening a data stream failed.
///
/// Loader failures are expected conditions: the pipeline converts them into
/// an absent stream and the resource ends up `LoadedResourceMissing`. They
/// never escape a worker task.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No data exists for the requested id.
    #[error("no resource data found for '{id}'")]
    NotFound {
        /// The id that could not be resolved.
        id: String,
    },
    /// The data exists but could not be opened or read.
    #[error("failed to open resource data: {0}")]
    Io(#[from] io::Error),
    /// Any other loader-specific failure.
    #[error("{0}")]
    Other(String),
}

/// The strategy that resolves a resource id to a byte stream.
///
/// Precedence when the manager picks a loader for a resource: a custom
/// per-instance loader, then the per-type loader, then the global default.
pub trait ResourceTypeLoader: Send + Sync {
    /// Produce a readable byte stream for the given resource, or fail.
    ///
    /// May be slow (disk access); only ever called from the data-load stage
    /// of the pipeline, never inline from an acquire.
    fn open_data_stream(&self, request: &ResourceRequest<'_>) -> Result<LoadData, LoaderError>;

    /// Release whatever was held open for the stream. Called exactly once
    /// per successful [`Self::open_data_stream`], after the update-content
    /// stage has consumed the stream.
    fn close_data_stream(&self, request: &ResourceRequest<'_>, data: LoadData) {
        let _ = request;
        drop(data);
    }

    /// Cheap check whether previously loaded data is stale (file
    /// modification time, typically). `loaded_modification_time` is what
    /// the last successful load reported. Used by the explicit reload
    /// sweep, not by ordinary acquires.
    fn is_resource_outdated(
        &self,
        request: &ResourceRequest<'_>,
        loaded_modification_time: Option<SystemTime>,
    ) -> bool {
        let _ = (request, loaded_modification_time);
        false
    }
}

/// The standard header at the front of every resource data stream.
///
/// Every stream a loader produces starts with this header so that resources
/// and any wrapping deduplication context agree on the stream position where
/// type-specific content begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Absolute path of the source the data came from; empty when the data
    /// has no file backing (in-memory loaders).
    pub source_path: String,
    /// Hash of the asset content, for change detection. Zero when unknown.
    pub content_hash: u64,
}

/// Writes the standard stream header. Loaders call this before appending
/// type-specific content.
pub fn write_stream_header(out: &mut impl Write, header: &StreamHeader) -> io::Result<()> {
    let path = header.source_path.as_bytes();
    let len = u32::try_from(path.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "source path too long"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(path)?;
    out.write_all(&header.content_hash.to_le_bytes())?;
    Ok(())
}

/// Reads and returns the standard stream header, leaving the stream
/// positioned at the first byte of type-specific content.
///
/// Resource implementations call this at the top of `update_content`, even
/// if they ignore the result.
pub fn read_stream_header(stream: &mut dyn Read) -> io::Result<StreamHeader> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut path = vec![0u8; len];
    stream.read_exact(&mut path)?;
    let source_path = String::from_utf8(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "header path is not utf-8"))?;

    let mut hash_bytes = [0u8; 8];
    stream.read_exact(&mut hash_bytes)?;

    Ok(StreamHeader {
        source_path,
        content_hash: u64::from_le_bytes(hash_bytes),
    })
}
