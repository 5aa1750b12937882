//! Caching compilation of C and assembly files.
//!
//! Unlike package compilation, the full input set of a C file (headers, and
//! headers of headers) is only known after the compiler has run. The cache
//! therefore keeps two artifacts per translation unit:
//!
//! 1. `dep-<D>.json` — the dependency manifest, named after a hash of
//!    everything known *before* compiling: path, file digest, compiler,
//!    flags, IR toolchain version.
//! 2. `obj-<K>.o` — the object file, named after a hash of the manifest
//!    digest plus the digest of every file in the manifest.
//!
//! A lookup reads the manifest, hashes the files it lists, and probes for
//! the object. On a miss the compiler runs with `-MD -MV -MTdeps` so it
//! emits a fresh manifest as a side effect; the manifest is re-published on
//! every compilation because a header can change its include set without
//! changing the manifest's own name.
//!
//! Known gap: a file added earlier on an include path can shadow a recorded
//! header without changing any recorded digest, so a stale object can be
//! returned. Recording include lookup failures would close this, but the
//! compiler does not report them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::debug;

use crate::cache::{BuildCache, DEP_PREFIX, OBJ_PREFIX};
use crate::depfile;
use crate::error::BuildError;
use crate::hash;
use crate::tool;

/// Cache key of the dependency manifest: everything that is known about a
/// translation unit before the first compile.
#[derive(Serialize)]
struct CFileDepKey<'a> {
    path: &'a str,
    hash: String,
    compiler: &'a str,
    flags: &'a [String],
    ir_version: &'a str,
}

/// Cache key of the object file: the manifest digest plus the digest of
/// every input the manifest lists.
#[derive(Serialize)]
struct COutputKey<'a> {
    depfile_digest: &'a str,
    file_hashes: BTreeMap<&'a str, String>,
}

/// Compile `abspath` with the build cache.
///
/// Returns the path of the cached object file, compiling only when either
/// the dependency manifest or the object for the current input set is
/// missing. `scratch_dir` receives the short-lived manifest the compiler
/// writes; everything else lives in the cache directory.
pub fn compile_and_cache_c_file(
    abspath: &Path,
    scratch_dir: &Path,
    cache: &BuildCache,
    compiler: &str,
    cflags: &[String],
    ir_version: &str,
) -> Result<PathBuf, BuildError> {
    let source = abspath.to_string_lossy().into_owned();
    let file_hash = hash::hash_file(abspath)?;

    let dep_key = CFileDepKey {
        path: &source,
        hash: file_hash.to_hex(),
        compiler,
        flags: cflags,
        ir_version,
    };
    let depfile_digest = crate::cache::action_digest(&dep_key);
    let dep_path = cache.entry(DEP_PREFIX, &depfile_digest, ".json");

    // Phase one: if a manifest exists for this key, hash its inputs and
    // probe for the object.
    match std::fs::read(&dep_path) {
        Ok(buf) => {
            let dependencies: Vec<String> =
                serde_json::from_slice(&buf).map_err(|e| BuildError::MalformedDepFile {
                    message: format!("could not parse cached manifest: {e}"),
                })?;
            // A hashing failure here means an input vanished; fall through
            // and recompile instead of failing the build.
            if let Ok(outpath) = object_cache_path(cache, &dependencies, &depfile_digest) {
                if outpath.exists() {
                    debug!(object = %outpath.display(), "cache hit for {source}");
                    return Ok(outpath);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BuildError::io(&dep_path, e)),
    }

    // Phase two: compile, asking the compiler to emit the manifest.
    let obj_tmp = cache.temp_file(".o")?;
    let dep_tmp = tempfile::Builder::new()
        .prefix("dep-")
        .suffix(".d")
        .tempfile_in(scratch_dir)
        .map_err(|e| BuildError::io(scratch_dir, e))?
        .into_temp_path();

    let mut flags = cflags.to_vec();
    flags.extend([
        "-MD".to_string(),
        "-MV".to_string(),
        "-MTdeps".to_string(),
        "-MF".to_string(),
        dep_tmp.to_string_lossy().into_owned(),
    ]);
    flags.extend([
        "-c".to_string(),
        "-o".to_string(),
        obj_tmp.to_string_lossy().into_owned(),
        source.clone(),
    ]);
    debug!("{} {}", compiler, flags.join(" "));
    tool::run(compiler, &flags).map_err(|e| BuildError::CompilerInvocationFailed {
        source_path: abspath.to_path_buf(),
        detail: e.to_string(),
    })?;

    // Canonical manifest: append the primary source (assemblers omit it),
    // de-duplicate preserving first occurrence, then sort.
    let mut dependencies = depfile::read_dep_file(&dep_tmp)?;
    dependencies.push(source);
    let mut seen = FxHashSet::default();
    dependencies.retain(|dep| seen.insert(dep.clone()));
    dependencies.sort();

    // The manifest is refreshed on every compile, even when its content did
    // not change, to absorb include-set changes that keep the key stable.
    cache.publish_bytes(&dep_path, &encode_manifest(&dependencies))?;

    let outpath = object_cache_path(cache, &dependencies, &depfile_digest)?;
    cache.publish_temp(obj_tmp, &outpath)?;
    Ok(outpath)
}

/// Compute the object path for a manifest: hash every listed input and
/// derive the `obj-` filename from the combined key.
fn object_cache_path(
    cache: &BuildCache,
    dependencies: &[String],
    depfile_digest: &str,
) -> Result<PathBuf, BuildError> {
    let mut file_hashes = BTreeMap::new();
    for dep in dependencies {
        let digest = hash::hash_file(Path::new(dep))?;
        file_hashes.insert(dep.as_str(), digest.to_hex());
    }
    let key = COutputKey {
        depfile_digest,
        file_hashes,
    };
    let object_digest = crate::cache::action_digest(&key);
    Ok(cache.entry(OBJ_PREFIX, &object_digest, ".o"))
}

/// Encode the canonical manifest: a JSON string array, pretty-printed with
/// tab indentation.
fn encode_manifest(dependencies: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    dependencies
        .serialize(&mut serializer)
        .expect("manifest serialization cannot fail");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Round-trip of the on-disk manifest encoding.
    #[test]
    fn test_manifest_encoding_round_trips() {
        let deps = vec![
            "/inc/a.h".to_string(),
            "/inc/b with space.h".to_string(),
            "/src/main.c".to_string(),
        ];
        let encoded = encode_manifest(&deps);
        // Tab-indented pretty printing.
        assert!(encoded.windows(2).any(|w| w == b"\n\t"));
        let decoded: Vec<String> = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, deps);
    }

    #[cfg(unix)]
    mod compile {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        /// A stand-in C compiler: writes a quoted-NMake manifest listing the
        /// source plus every path found in `<source>.extra`, copies the
        /// source to the output object, and counts its invocations in
        /// `<source>.calls`.
        const FAKE_CC: &str = r#"#!/bin/sh
set -e
dep=""
out=""
src=""
while [ "$#" -gt 0 ]; do
    case "$1" in
        -MF) dep="$2"; shift ;;
        -o) out="$2"; shift ;;
        -MD|-MV|-MTdeps|-c) ;;
        -*) ;;
        *) src="$1" ;;
    esac
    shift
done
printf 'deps: %s' "$src" > "$dep"
if [ -f "$src.extra" ]; then
    while IFS= read -r extra; do
        printf ' %s' "$extra" >> "$dep"
    done < "$src.extra"
fi
printf '\n' >> "$dep"
cat "$src" > "$out"
printf 'x\n' >> "$src.calls"
"#;

        struct Fixture {
            _dir: tempfile::TempDir,
            cache: BuildCache,
            scratch: PathBuf,
            compiler: String,
            source: PathBuf,
        }

        fn fixture() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let cache_dir = dir.path().join("cache");
            let scratch = dir.path().join("scratch");
            std::fs::create_dir_all(&cache_dir).unwrap();
            std::fs::create_dir_all(&scratch).unwrap();

            let cc = dir.path().join("fake-cc");
            std::fs::write(&cc, FAKE_CC).unwrap();
            std::fs::set_permissions(&cc, std::fs::Permissions::from_mode(0o755)).unwrap();

            let source = dir.path().join("main.c");
            std::fs::write(&source, "int main(void) { return 0; }\n").unwrap();

            Fixture {
                cache: BuildCache::new(&cache_dir),
                scratch,
                compiler: cc.to_string_lossy().into_owned(),
                source,
                _dir: dir,
            }
        }

        fn compile(fx: &Fixture, flags: &[&str]) -> PathBuf {
            let flags: Vec<String> = flags.iter().map(|s| s.to_string()).collect();
            compile_and_cache_c_file(
                &fx.source,
                &fx.scratch,
                &fx.cache,
                &fx.compiler,
                &flags,
                "17.0.1",
            )
            .unwrap()
        }

        fn call_count(fx: &Fixture) -> usize {
            std::fs::read_to_string(fx.source.with_extension("c.calls"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn cache_entries(fx: &Fixture, prefix: &str) -> usize {
            std::fs::read_dir(fx.cache.dir())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
                .count()
        }

        #[test]
        fn test_cold_compile_publishes_manifest_and_object() {
            let fx = fixture();
            let header = fx.source.parent().unwrap().join("shared.h");
            std::fs::write(&header, "#define SHARED 1\n").unwrap();
            std::fs::write(
                fx.source.with_extension("c.extra"),
                format!("{}\n", header.display()),
            )
            .unwrap();

            let outpath = compile(&fx, &["-O2"]);
            assert!(outpath.exists());
            let name = outpath.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(OBJ_PREFIX));
            assert!(name.ends_with(".o"));

            // One manifest, sorted, containing the source and the header.
            assert_eq!(cache_entries(&fx, DEP_PREFIX), 1);
            let dep_entry = std::fs::read_dir(fx.cache.dir())
                .unwrap()
                .filter_map(|e| e.ok())
                .find(|e| e.file_name().to_string_lossy().starts_with(DEP_PREFIX))
                .unwrap();
            let manifest: Vec<String> =
                serde_json::from_slice(&std::fs::read(dep_entry.path()).unwrap()).unwrap();
            let mut sorted = manifest.clone();
            sorted.sort();
            assert_eq!(manifest, sorted);
            assert!(manifest.contains(&fx.source.to_string_lossy().into_owned()));
            assert!(manifest.contains(&header.to_string_lossy().into_owned()));
            assert_eq!(call_count(&fx), 1);
        }

        #[test]
        fn test_warm_hit_spawns_no_compiler() {
            let fx = fixture();
            let first = compile(&fx, &["-O2"]);
            let second = compile(&fx, &["-O2"]);
            assert_eq!(first, second);
            assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
            assert_eq!(call_count(&fx), 1);
        }

        #[test]
        fn test_flag_change_yields_new_manifest_and_object() {
            let fx = fixture();
            let first = compile(&fx, &["-O2"]);
            let second = compile(&fx, &["-O1"]);
            assert_ne!(first, second);
            assert_eq!(cache_entries(&fx, DEP_PREFIX), 2);
            assert_eq!(cache_entries(&fx, OBJ_PREFIX), 2);
            assert_eq!(call_count(&fx), 2);
        }

        #[test]
        fn test_source_change_yields_new_object() {
            let fx = fixture();
            let first = compile(&fx, &["-Os"]);
            std::fs::write(&fx.source, "int main(void) { return 1; }\n").unwrap();
            let second = compile(&fx, &["-Os"]);
            assert_ne!(first, second);
            assert_eq!(call_count(&fx), 2);
        }

        #[test]
        fn test_header_change_recompiles_under_same_manifest_name() {
            let fx = fixture();
            let header = fx.source.parent().unwrap().join("config.h");
            std::fs::write(&header, "#define N 1\n").unwrap();
            std::fs::write(
                fx.source.with_extension("c.extra"),
                format!("{}\n", header.display()),
            )
            .unwrap();

            let first = compile(&fx, &[]);
            std::fs::write(&header, "#define N 2\n").unwrap();
            let second = compile(&fx, &[]);

            // Same dep key (source and flags unchanged), new object key.
            assert_ne!(first, second);
            assert_eq!(cache_entries(&fx, DEP_PREFIX), 1);
            assert_eq!(cache_entries(&fx, OBJ_PREFIX), 2);
            assert_eq!(call_count(&fx), 2);
        }

        #[test]
        fn test_vanished_manifest_input_falls_back_to_recompile() {
            let fx = fixture();
            let header = fx.source.parent().unwrap().join("gone.h");
            std::fs::write(&header, "#define GONE\n").unwrap();
            std::fs::write(
                fx.source.with_extension("c.extra"),
                format!("{}\n", header.display()),
            )
            .unwrap();
            compile(&fx, &[]);

            // The header disappears and is no longer reported; the stale
            // manifest must not fail the build.
            std::fs::remove_file(&header).unwrap();
            std::fs::remove_file(fx.source.with_extension("c.extra")).unwrap();
            let outpath = compile(&fx, &[]);
            assert!(outpath.exists());
            assert_eq!(call_count(&fx), 2);
        }

        #[test]
        fn test_compiler_failure_is_attributed_to_source() {
            let fx = fixture();
            // A compiler that always fails.
            let bad_cc = fx.source.parent().unwrap().join("bad-cc");
            std::fs::write(&bad_cc, "#!/bin/sh\nexit 1\n").unwrap();
            std::fs::set_permissions(&bad_cc, std::fs::Permissions::from_mode(0o755)).unwrap();

            let err = compile_and_cache_c_file(
                &fx.source,
                &fx.scratch,
                &fx.cache,
                &bad_cc.to_string_lossy(),
                &[],
                "17.0.1",
            )
            .unwrap_err();
            match err {
                BuildError::CompilerInvocationFailed { source_path, .. } => {
                    assert_eq!(source_path, fx.source);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }
}
