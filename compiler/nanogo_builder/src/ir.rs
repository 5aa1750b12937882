//! The seam between the build pipeline and the IR toolchain.
//!
//! The code generator, bitcode reader/writer, and optimizer live in the
//! host driver; the pipeline drives them through these traits. The surface
//! is deliberately low-level where the build semantics live in this crate
//! (initializer ordering, linkage tightening, sentinel bookkeeping, call
//! classification) and coarse where they do not (pass execution, object
//! emission).
//!
//! Module handles are moved between build jobs but never shared across
//! threads concurrently, hence the `Send` bounds without `Sync`.

use std::io::Write;
use std::path::Path;

use crate::config::CompilerConfig;
use crate::error::BuildError;
use crate::program::Package;

/// Linkage of a function or global, reduced to the cases the pipeline acts
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
    /// Deduplicated-definition linkage used for thunks.
    LinkOnceOdr,
    Other,
}

/// Symbol visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Hidden,
}

/// Classification of one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// The callee is a function known at compile time.
    Direct,
    /// The callee is inline assembly.
    InlineAsm,
    /// The callee is a function pointer.
    Indirect,
}

/// Per-function facts needed by the stack-size driver.
#[derive(Debug, Clone, Default)]
pub struct FunctionSummary {
    pub name: String,
    /// Classification of every call instruction in the body.
    pub calls: Vec<Callee>,
    /// String attributes attached to the function, as key/value pairs.
    pub attributes: Vec<(String, String)>,
}

impl FunctionSummary {
    /// Look up a string attribute by key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Pass-pipeline parameters, mirroring the optimizer's knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptPipeline {
    pub speed_level: u8,
    pub size_level: u8,
    pub inliner_threshold: u32,
}

/// A mutable view of one function or global during linkage tightening.
pub trait SymbolHandle {
    fn visibility(&self) -> Visibility;
    fn set_visibility(&mut self, visibility: Visibility);
    fn linkage(&self) -> Linkage;
    fn set_linkage(&mut self, linkage: Linkage);
}

/// A freshly compiled package module, ready to be serialized as bitcode.
pub trait PackageModule: Send {
    /// Verify module well-formedness.
    fn verify(&self) -> Result<(), BuildError>;

    /// Stream the bitcode through a writer.
    fn write_bitcode(&self, out: &mut dyn Write) -> Result<(), BuildError>;

    /// Serialize the bitcode into memory.
    fn bitcode(&self) -> Result<Vec<u8>, BuildError>;
}

/// The whole-program module assembled by the link+optimize job.
pub trait ProgramModule: Send {
    /// Parse a bitcode file and link it into this module.
    fn link_bitcode_file(&mut self, path: &Path) -> Result<(), BuildError>;

    /// Prepare the body of the named program initializer: internal linkage
    /// and a fresh entry block.
    fn begin_program_init(&mut self, name: &str) -> Result<(), BuildError>;

    /// Append a call to the named function with two pointer-typed undef
    /// arguments to the program initializer body.
    ///
    /// # Errors
    ///
    /// [`BuildError::MissingSymbol`] if the function is not defined.
    fn add_program_init_call(&mut self, name: &str) -> Result<(), BuildError>;

    /// Terminate the program initializer body.
    fn finish_program_init(&mut self) -> Result<(), BuildError>;

    /// Visit every function for linkage surgery.
    fn for_each_function(&mut self, visit: &mut dyn FnMut(&mut dyn SymbolHandle));

    /// Visit every global for linkage surgery.
    fn for_each_global(&mut self, visit: &mut dyn FnMut(&mut dyn SymbolHandle));

    /// Verify module well-formedness.
    fn verify(&self) -> Result<(), BuildError>;

    /// Run the mandatory transformations and the configured optimization
    /// pipeline. Aggregated diagnostics surface as [`BuildError::Multi`].
    fn run_passes(&mut self, pipeline: &OptPipeline) -> Result<(), BuildError>;

    /// Move goroutine stack sizes into their own section and return the
    /// sentinel symbol names in slot order.
    fn create_stack_size_loads(&mut self) -> Vec<String>;

    /// Summaries of every defined function, for stack-size analysis.
    fn function_summaries(&self) -> Vec<FunctionSummary>;

    /// Textual IR.
    fn ir_text(&self) -> String;

    /// Serialize the module as bitcode.
    fn bitcode(&self) -> Result<Vec<u8>, BuildError>;

    /// Emit a relocatable object file for the configured target machine.
    fn emit_object(&self) -> Result<Vec<u8>, BuildError>;
}

/// The IR toolchain injected by the host driver.
pub trait IrEngine: Sync {
    /// Version string of the IR toolchain, part of every cache key.
    fn version(&self) -> &str;

    /// Version number of the code generator, part of every package cache
    /// key.
    fn codegen_version(&self) -> u32;

    /// Compile one package to an in-memory module.
    fn compile_package(
        &self,
        package: &Package,
        config: &CompilerConfig,
    ) -> Result<Box<dyn PackageModule + '_>, BuildError>;

    /// Create an empty whole-program module in a fresh context.
    fn new_program_module(&self) -> Result<Box<dyn ProgramModule + '_>, BuildError>;
}
