//! Build orchestration for the nanogo compiler driver.
//!
//! This crate takes a loaded program and an output path and manages the
//! whole compilation pipeline in between: a content-addressed build cache
//! for package bitcode and C/assembly objects, a dependency-driven job
//! graph that compiles and links with as much parallelism as the
//! dependencies allow, and post-link patching of per-goroutine stack sizes
//! into the linked ELF.
//!
//! The front-end, the IR toolchain, the stack analyzer, and the external
//! tools (C compiler, linker, firmware converters) are collaborators
//! injected by the host driver; see [`ir::IrEngine`],
//! [`stacksize::StackAnalyzer`], and [`config::Target`].

pub mod cache;
pub mod config;
pub mod depfile;
pub mod elf;
pub mod error;
pub mod format;
pub mod hash;
pub mod ir;
pub mod jobs;
pub mod pipeline;
pub mod program;
pub mod stacksize;
mod tool;

pub use cache::BuildCache;
pub use config::{Config, OptLevel, Options, Target, CACHE_DISABLED};
pub use error::BuildError;
pub use hash::{hash_file, FileDigest};
pub use pipeline::{build, BuildResult};
pub use program::{Package, Program};
