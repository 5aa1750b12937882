//! The content-addressed build cache.
//!
//! One flat directory holds every cached artifact. File names are derived
//! entirely from hashes, with a prefix tagging the artifact kind:
//!
//! ```text
//! pkg-<56 hex>.bc    compiled package bitcode
//! obj-<56 hex>.o     per-C-file object
//! dep-<56 hex>.json  per-C-file dependency manifest
//! tmp-*              in-flight temporaries
//! ```
//!
//! Publication is always rename-of-a-fully-written-temporary within the
//! cache directory, so no reader can observe a partial file under a
//! canonical name. Because destination names are content hashes, concurrent
//! drivers racing on the same key write identical content and both renames
//! are idempotent; no locking is needed. Temporaries left behind by crashed
//! processes waste space but never interfere.

pub mod cfile;
pub mod package;

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::CACHE_DISABLED;
use crate::error::BuildError;
use crate::hash;

/// Filename prefix for package bitcode.
pub const PKG_PREFIX: &str = "pkg-";
/// Filename prefix for C/assembly object files.
pub const OBJ_PREFIX: &str = "obj-";
/// Filename prefix for dependency manifests.
pub const DEP_PREFIX: &str = "dep-";
/// Filename prefix for in-flight temporaries.
pub const TMP_PREFIX: &str = "tmp-";

/// Hash the canonical encoding of a cache key.
///
/// This is the one step shared by every cache kind: serialize the key with
/// its stable encoding, hash the bytes, render as hex. The result is used
/// directly as the variable part of a cache filename.
///
/// # Panics
///
/// Key types are plain data and always serialize; a failure here is a
/// programming error.
#[must_use]
pub fn action_digest<K: Serialize>(key: &K) -> String {
    let encoded = serde_json::to_vec(key).expect("cache key serialization cannot fail");
    hash::hash_bytes(&encoded).to_hex()
}

/// Handle to the build cache directory.
#[derive(Debug, Clone)]
pub struct BuildCache {
    dir: PathBuf,
}

impl BuildCache {
    /// Use an existing directory as the cache.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve the configured cache setting once at the start of a build.
    ///
    /// The [`CACHE_DISABLED`] sentinel substitutes the per-invocation
    /// scratch directory, which makes every lookup a miss and discards all
    /// output when the build finishes.
    pub fn resolve(setting: &str, scratch_dir: &Path) -> Self {
        if setting == CACHE_DISABLED {
            Self::new(scratch_dir)
        } else {
            Self::new(setting)
        }
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cache entry `<prefix><digest><ext>`.
    #[must_use]
    pub fn entry(&self, prefix: &str, digest: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{prefix}{digest}{ext}"))
    }

    /// Create a temporary file inside the cache directory for later
    /// publication. The external tool writing it may reopen it by path.
    pub fn temp_file(&self, suffix: &str) -> Result<tempfile::TempPath, BuildError> {
        let file = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .suffix(suffix)
            .tempfile_in(&self.dir)
            .map_err(|e| BuildError::io(&self.dir, e))?;
        Ok(file.into_temp_path())
    }

    /// Atomically publish `bytes` under `dest`, which must lie in the cache
    /// directory.
    pub fn publish_bytes(&self, dest: &Path, bytes: &[u8]) -> Result<(), BuildError> {
        let mut file = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| BuildError::io(&self.dir, e))?;
        file.write_all(bytes).map_err(|e| BuildError::io(dest, e))?;
        file.flush().map_err(|e| BuildError::io(dest, e))?;
        file.into_temp_path()
            .persist(dest)
            .map_err(|e| BuildError::io(dest, e.error))?;
        Ok(())
    }

    /// Atomically publish an already-written temporary under `dest`.
    pub fn publish_temp(
        &self,
        temp: tempfile::TempPath,
        dest: &Path,
    ) -> Result<(), BuildError> {
        temp.persist(dest)
            .map_err(|e| BuildError::io(dest, e.error))?;
        Ok(())
    }
}
