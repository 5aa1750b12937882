//! Build configuration.
//!
//! [`Config`] collects everything the driver needs to know about one build:
//! the target description (tools, flags, libc/runtime selection, stack
//! behavior), the per-invocation options, the toolchain root, and the cache
//! directory setting. [`CompilerConfig`] is the subset handed to the code
//! generator; it is serializable with a stable encoding because it is part
//! of every package cache key.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::BuildError;

/// Sentinel value for [`Config::cache_dir`] meaning the build cache is
/// disabled. A per-invocation scratch directory is used instead, so
/// everything is recomputed.
pub const CACHE_DISABLED: &str = "off";

/// Optimization level accepted by the driver.
///
/// `-opt=0` is intentionally absent: the pipeline relies on the optimizer
/// removing dead symbols, and a fully unoptimized build does not link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// Basic optimization (`-opt=1`).
    O1,
    /// Standard optimization (`-opt=2`).
    O2,
    /// Optimize for size (`-opt=s`).
    Os,
    /// Aggressively optimize for size (`-opt=z`), the default.
    #[default]
    Oz,
}

impl OptLevel {
    /// Parse a command-line optimization level.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1" => Some(Self::O1),
            "2" => Some(Self::O2),
            "s" => Some(Self::Os),
            "z" => Some(Self::Oz),
            _ => None,
        }
    }
}

/// Configuration of the code generator, embedded in package action keys.
///
/// The derived `Serialize` impl together with fixed field order gives this
/// struct a canonical encoding: equal configurations always serialize to the
/// same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilerConfig {
    pub triple: String,
    pub cpu: String,
    pub features: String,
    pub goos: String,
    pub goarch: String,
    pub code_model: String,
    pub relocation_model: String,
    pub scheduler: String,
    pub automatic_stack_size: bool,
    pub default_stack_size: u64,
    pub needs_stack_objects: bool,
    pub debug: bool,
}

/// Static description of a compilation target.
///
/// Loaded by the host driver from its target database; the orchestration
/// core treats it as read-only data.
#[derive(Debug, Clone)]
pub struct Target {
    /// LLVM-style target triple.
    pub triple: String,
    pub cpu: String,
    pub features: String,
    pub goos: String,
    pub goarch: String,
    pub code_model: String,
    pub relocation_model: String,
    /// Goroutine scheduler flavor baked into the runtime.
    pub scheduler: String,

    /// External C compiler used for extra files, CGo files, and libraries.
    pub compiler: String,
    /// External linker producing the final executable.
    pub linker: String,
    /// External objcopy-compatible tool for hex/bin conversion.
    pub objcopy: String,

    /// C library selection: empty, `picolibc`, or `wasi-libc`.
    pub libc: String,
    /// Runtime support library selection: empty or `compiler-rt`.
    pub rtlib: String,

    /// Default output format when the extension does not dictate one.
    pub binary_format: String,
    /// UF2 family identifier passed to the conversion tool.
    pub uf2_family_id: String,

    /// Flags passed to every C compiler invocation.
    pub cflags: Vec<String>,
    /// Flags passed to the linker ahead of the object list.
    pub ldflags: Vec<String>,

    /// Extra C/assembly sources (interrupt vectors, stack switching, ...),
    /// relative to the toolchain root.
    pub extra_files: Vec<String>,
    /// Runtime-library sources, relative to the toolchain root.
    pub rtlib_files: Vec<String>,
    /// libc sources, relative to the toolchain root.
    pub libc_files: Vec<String>,
    /// Additional flags for libc and runtime-library compilation.
    pub libc_cflags: Vec<String>,

    /// Stack size given to goroutines whose usage cannot be computed.
    pub default_stack_size: u64,
    /// Whether the code generator emits stack-size sentinels for post-link
    /// patching.
    pub automatic_stack_size: bool,
    /// Whether the garbage collector needs explicit stack object tracking.
    pub needs_stack_objects: bool,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            triple: "armv7em-unknown-unknown-eabi".to_string(),
            cpu: "cortex-m4".to_string(),
            features: String::new(),
            goos: "linux".to_string(),
            goarch: "arm".to_string(),
            code_model: "default".to_string(),
            relocation_model: "static".to_string(),
            scheduler: "tasks".to_string(),
            compiler: "clang".to_string(),
            linker: "ld.lld".to_string(),
            objcopy: "llvm-objcopy".to_string(),
            libc: String::new(),
            rtlib: String::new(),
            binary_format: "elf".to_string(),
            uf2_family_id: String::new(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            extra_files: Vec::new(),
            rtlib_files: Vec::new(),
            libc_files: Vec::new(),
            libc_cflags: Vec::new(),
            default_stack_size: 2048,
            automatic_stack_size: true,
            needs_stack_objects: false,
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Optimization level string as given on the command line.
    pub opt: String,
    /// Dump the linked IR after linkage tightening.
    pub print_ir: bool,
    /// Report computed goroutine stack usage after linking.
    pub print_stacks: bool,
    /// Emit debug information.
    pub debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            opt: "z".to_string(),
            print_ir: false,
            print_stacks: false,
            debug: false,
        }
    }
}

/// Everything the build pipeline needs for a single invocation.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub options: Options,
    pub target: Target,
    /// Toolchain installation root; extra files and library sources are
    /// resolved relative to it.
    pub root: PathBuf,
    /// Build cache directory, or [`CACHE_DISABLED`].
    pub cache_dir: String,
}

impl Config {
    /// Flags for a C compiler invocation.
    #[must_use]
    pub fn cflags(&self) -> Vec<String> {
        self.target.cflags.clone()
    }

    /// Flags for compiling libc and runtime-library sources.
    #[must_use]
    pub fn libc_cflags(&self) -> Vec<String> {
        let mut flags = self.target.cflags.clone();
        flags.extend(self.target.libc_cflags.iter().cloned());
        flags
    }

    /// The code-generator configuration for this build.
    #[must_use]
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            triple: self.target.triple.clone(),
            cpu: self.target.cpu.clone(),
            features: self.target.features.clone(),
            goos: self.target.goos.clone(),
            goarch: self.target.goarch.clone(),
            code_model: self.target.code_model.clone(),
            relocation_model: self.target.relocation_model.clone(),
            scheduler: self.target.scheduler.clone(),
            automatic_stack_size: self.automatic_stack_size(),
            default_stack_size: self.target.default_stack_size,
            needs_stack_objects: self.target.needs_stack_objects,
            debug: self.options.debug,
        }
    }

    /// Whether post-link stack-size patching is enabled for this build.
    ///
    /// Sentinel loads only exist when the tasks scheduler is in use.
    #[must_use]
    pub fn automatic_stack_size(&self) -> bool {
        self.target.automatic_stack_size && self.target.scheduler == "tasks"
    }

    /// Parse and validate the requested optimization level.
    pub fn opt_level(&self) -> Result<OptLevel, BuildError> {
        OptLevel::parse(&self.options.opt).ok_or_else(|| BuildError::UnknownOption {
            option: "optimization level",
            value: self.options.opt.clone(),
        })
    }

    /// Determine the output binary format from the requested extension,
    /// falling back to the target default.
    #[must_use]
    pub fn binary_format(&self, extension: &str) -> String {
        match extension {
            ".hex" => "hex".to_string(),
            ".bin" => "bin".to_string(),
            ".uf2" => "uf2".to_string(),
            _ if !self.target.binary_format.is_empty() => self.target.binary_format.clone(),
            _ => "elf".to_string(),
        }
    }

    /// Resolve a path from the target description against the toolchain
    /// root.
    #[must_use]
    pub fn root_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Resolve the extension of the requested output path, empty if none.
#[must_use]
pub fn output_extension(outpath: &Path) -> String {
    outpath
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}
