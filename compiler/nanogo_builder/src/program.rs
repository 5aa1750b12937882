//! The loaded program as seen by the build pipeline.
//!
//! The front-end loads source into memory, resolves imports, and hashes
//! every source file; the pipeline only ever reads the result. Packages are
//! kept in the loader's sorted order, a deterministic topological order over
//! imports, and that order decides both compilation and the sequence of
//! package initializer calls.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::hash::FileDigest;

/// One package of the program under compilation.
#[derive(Debug, Clone, Default)]
pub struct Package {
    /// Import path, unique within the program.
    pub import_path: String,
    /// Directory the package sources live in.
    pub dir: PathBuf,
    /// Digest of every source file belonging to the package, keyed by path.
    pub file_hashes: BTreeMap<String, FileDigest>,
    /// Import paths of directly imported packages.
    pub imports: Vec<String>,
    /// C sources of this package (CGo), relative to [`Package::dir`].
    pub c_files: Vec<String>,
    /// Extra C compiler flags from CGo directives.
    pub cflags: Vec<String>,
}

/// A whole loaded program in sorted package order.
#[derive(Debug, Clone, Default)]
pub struct Program {
    packages: Vec<Package>,
    /// Linker flags collected from CGo directives across all packages.
    pub ld_flags: Vec<String>,
    /// Directory of the main package; test binaries run from here.
    pub main_dir: PathBuf,
}

impl Program {
    /// Build a program from packages already in dependency-sorted order.
    #[must_use]
    pub fn new(packages: Vec<Package>, ld_flags: Vec<String>, main_dir: PathBuf) -> Self {
        Self {
            packages,
            ld_flags,
            main_dir,
        }
    }

    /// All packages, dependencies before dependents.
    #[must_use]
    pub fn sorted(&self) -> &[Package] {
        &self.packages
    }
}
