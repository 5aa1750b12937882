//! Content hashing for cache keys.
//!
//! All cache filenames derive from SHA-512/224 digests: wide enough that a
//! collision is not a practical concern, short enough to keep filenames
//! readable. Files are streamed so memory stays bounded regardless of input
//! size.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha512_224};

use crate::error::BuildError;

/// Number of bytes in a digest.
pub const DIGEST_LEN: usize = 28;

/// Number of characters in the hex rendering of a digest.
pub const DIGEST_HEX_LEN: usize = 2 * DIGEST_LEN;

/// A SHA-512/224 digest of some input, typically a file's contents.
///
/// Two inputs with equal bytes have equal digests; the inverse is assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDigest([u8; DIGEST_LEN]);

impl FileDigest {
    /// Hex rendering, used directly in cache filenames.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl std::fmt::Display for FileDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a byte slice.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> FileDigest {
    let digest = Sha512_224::digest(data);
    FileDigest(digest.into())
}

/// Stream-hash the file at `path`.
///
/// # Errors
///
/// Returns [`BuildError::Io`] if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<FileDigest, BuildError> {
    let mut file = File::open(path).map_err(|e| BuildError::io(path, e))?;
    let mut hasher = Sha512_224::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| BuildError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(FileDigest(hasher.finalize().into()))
}
