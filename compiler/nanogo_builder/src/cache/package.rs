//! Caching compiled package bitcode.
//!
//! A package compilation is fingerprinted by everything that flows into it:
//! its sources, its flags, the code generator and IR toolchain versions,
//! the compiler configuration, and the action digests of every import. A
//! dependency exporting a constant this package folded in must invalidate
//! this package too, which is why import digests are part of the key.
//!
//! The digest of the canonical key encoding names the bitcode file
//! (`pkg-<digest>.bc`). If that file exists the compile job is elided
//! entirely; within one process run the cache is monotonic.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cache::{BuildCache, PKG_PREFIX, TMP_PREFIX};
use crate::config::CompilerConfig;
use crate::error::BuildError;
use crate::ir::PackageModule;
use crate::program::Package;

/// The fingerprint of one package compilation.
#[derive(Debug, Clone, Serialize)]
pub struct PackageActionKey {
    pub import_path: String,
    pub codegen_version: u32,
    pub ir_version: String,
    pub config: CompilerConfig,
    pub cflags: Vec<String>,
    /// Digest of every source file, keyed by path.
    pub file_hashes: BTreeMap<String, String>,
    /// Action digest of every imported package, keyed by import path.
    pub imports: BTreeMap<String, String>,
}

impl PackageActionKey {
    /// Assemble the action key for `package`.
    ///
    /// `import_digests` must already contain the digest of every import;
    /// the loader's sorted order guarantees imports are processed first.
    pub fn assemble(
        package: &Package,
        config: &CompilerConfig,
        codegen_version: u32,
        ir_version: &str,
        import_digests: &BTreeMap<String, String>,
    ) -> Result<Self, BuildError> {
        let mut imports = BTreeMap::new();
        for import in &package.imports {
            let digest = import_digests.get(import).ok_or_else(|| BuildError::Other {
                message: format!(
                    "package {} imports {} but couldn't find dependency",
                    package.import_path, import
                ),
            })?;
            imports.insert(import.clone(), digest.clone());
        }

        let file_hashes = package
            .file_hashes
            .iter()
            .map(|(path, digest)| (path.clone(), digest.to_hex()))
            .collect();

        Ok(Self {
            import_path: package.import_path.clone(),
            codegen_version,
            ir_version: ir_version.to_string(),
            config: config.clone(),
            cflags: package.cflags.clone(),
            file_hashes,
            imports,
        })
    }

    /// The action digest naming this package's bitcode file.
    #[must_use]
    pub fn digest(&self) -> String {
        crate::cache::action_digest(self)
    }
}

/// Path of the cached bitcode for an action digest.
#[must_use]
pub fn bitcode_path(cache: &BuildCache, action_digest: &str) -> PathBuf {
    cache.entry(PKG_PREFIX, action_digest, ".bc")
}

/// Serialize a compiled module and publish it atomically under `dest`.
///
/// On Windows the IR toolchain cannot stream bitcode through a reopened
/// file handle, so the module is serialized to memory there; elsewhere the
/// bitcode is streamed straight into the temporary.
pub fn publish_bitcode(
    cache: &BuildCache,
    dest: &Path,
    module: &dyn PackageModule,
) -> Result<(), BuildError> {
    if cfg!(windows) {
        let bytes = module.bitcode()?;
        return cache.publish_bytes(dest, &bytes);
    }

    let mut temp = tempfile::Builder::new()
        .prefix(TMP_PREFIX)
        .suffix(".bc")
        .tempfile_in(cache.dir())
        .map_err(|e| BuildError::io(cache.dir(), e))?;
    module.write_bitcode(temp.as_file_mut())?;
    temp.as_file_mut()
        .flush()
        .map_err(|e| BuildError::io(dest, e))?;
    cache.publish_temp(temp.into_temp_path(), dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    fn sample_package() -> Package {
        let mut file_hashes = BTreeMap::new();
        file_hashes.insert(
            "/src/machine/uart.go".to_string(),
            hash::hash_bytes(b"package machine"),
        );
        Package {
            import_path: "machine".to_string(),
            dir: PathBuf::from("/src/machine"),
            file_hashes,
            imports: vec!["runtime".to_string()],
            c_files: Vec::new(),
            cflags: vec!["-mcpu=cortex-m4".to_string()],
        }
    }

    fn sample_config() -> CompilerConfig {
        crate::config::Config::default().compiler_config()
    }

    fn digests_with_runtime() -> BTreeMap<String, String> {
        let mut digests = BTreeMap::new();
        digests.insert("runtime".to_string(), "a".repeat(56));
        digests
    }

    #[test]
    fn test_action_digest_is_deterministic() {
        let package = sample_package();
        let config = sample_config();
        let digests = digests_with_runtime();

        let a = PackageActionKey::assemble(&package, &config, 7, "17.0.1", &digests)
            .unwrap()
            .digest();
        let b = PackageActionKey::assemble(&package, &config, 7, "17.0.1", &digests)
            .unwrap()
            .digest();
        assert_eq!(a, b);
    }

    #[test]
    fn test_action_digest_depends_on_toolchain_and_imports() {
        let package = sample_package();
        let config = sample_config();
        let digests = digests_with_runtime();
        let base = PackageActionKey::assemble(&package, &config, 7, "17.0.1", &digests)
            .unwrap()
            .digest();

        // IR toolchain version changes the digest.
        let other = PackageActionKey::assemble(&package, &config, 7, "18.1.0", &digests)
            .unwrap()
            .digest();
        assert_ne!(base, other);

        // Code generator version changes the digest.
        let other = PackageActionKey::assemble(&package, &config, 8, "17.0.1", &digests)
            .unwrap()
            .digest();
        assert_ne!(base, other);

        // The import's own digest changes the digest.
        let mut digests = BTreeMap::new();
        digests.insert("runtime".to_string(), "b".repeat(56));
        let other = PackageActionKey::assemble(&package, &config, 7, "17.0.1", &digests)
            .unwrap()
            .digest();
        assert_ne!(base, other);
    }

    #[test]
    fn test_missing_import_digest_is_an_error() {
        let package = sample_package();
        let config = sample_config();
        let err =
            PackageActionKey::assemble(&package, &config, 7, "17.0.1", &BTreeMap::new())
                .unwrap_err();
        assert!(err.to_string().contains("couldn't find dependency"));
    }

    #[test]
    fn test_publish_bitcode_writes_atomically() {
        struct FakeModule(Vec<u8>);
        impl PackageModule for FakeModule {
            fn verify(&self) -> Result<(), BuildError> {
                Ok(())
            }
            fn write_bitcode(&self, out: &mut dyn Write) -> Result<(), BuildError> {
                out.write_all(&self.0)
                    .map_err(|e| BuildError::io("bitcode", e))
            }
            fn bitcode(&self) -> Result<Vec<u8>, BuildError> {
                Ok(self.0.clone())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = BuildCache::new(dir.path());
        let dest = bitcode_path(&cache, &"c".repeat(56));

        let module = FakeModule(b"BC\xc0\xde...".to_vec());
        publish_bitcode(&cache, &dest, &module).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), module.0);

        // No temporary remains in the cache directory.
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }
}
