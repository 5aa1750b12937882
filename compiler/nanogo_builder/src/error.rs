//! Error types for the build driver.
//!
//! Every failure mode of the orchestration core is represented here as a
//! structured variant. The job graph surfaces the first job error verbatim
//! and cancels further scheduling; callers that want to inspect aggregated
//! compiler diagnostics can match on [`BuildError::Multi`].

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Error produced anywhere in the build pipeline.
#[derive(Debug)]
pub enum BuildError {
    /// A file open/read/write/rename failed.
    Io { path: PathBuf, source: io::Error },

    /// A dependency manifest could not be parsed: missing `deps:` prefix,
    /// unbalanced quotes, or a corrupt cached manifest.
    MalformedDepFile { message: String },

    /// The external C compiler exited with a non-zero status.
    CompilerInvocationFailed {
        /// The source file being compiled.
        source_path: PathBuf,
        detail: String,
    },

    /// The external linker exited with a non-zero status.
    LinkerFailed {
        /// The executable that was being produced.
        executable: PathBuf,
        detail: String,
    },

    /// An external conversion tool (objcopy and friends) failed.
    ToolFailed { tool: String, detail: String },

    /// IR verification failed after package compilation, after initializer
    /// synthesis, or after the optimization pipeline.
    VerifyFailed { stage: String },

    /// A queried symbol has zero or more than one definition in the call
    /// graph, or a recorded sentinel has no entry in the stack-size map.
    MissingSymbol { symbol: String, found: usize },

    /// The stack-sizes section is absent or its layout does not match the
    /// recorded sentinel loads.
    SectionLayoutMismatch { message: String },

    /// An unrecognized optimization level or libc name.
    UnknownOption { option: &'static str, value: String },

    /// Aggregated diagnostics from the IR compiler or the optimization
    /// pipeline, surfaced verbatim.
    Multi(Vec<BuildError>),

    /// A free-form diagnostic from one of the injected toolchain seams.
    Other { message: String },
}

impl BuildError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a [`BuildError::Multi`] from a list of messages, collapsing a
    /// single entry to itself.
    pub fn multi(mut errors: Vec<BuildError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Multi(errors)
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            Self::MalformedDepFile { message } => {
                write!(f, "malformed dependency file: {message}")
            }
            Self::CompilerInvocationFailed {
                source_path,
                detail,
            } => {
                write!(f, "failed to build {}: {detail}", source_path.display())
            }
            Self::LinkerFailed { executable, detail } => {
                write!(f, "failed to link {}: {detail}", executable.display())
            }
            Self::ToolFailed { tool, detail } => {
                write!(f, "{tool}: {detail}")
            }
            Self::VerifyFailed { stage } => {
                write!(f, "verification error after {stage}")
            }
            Self::MissingSymbol { symbol, found } => {
                write!(
                    f,
                    "expected exactly one definition of {symbol}, found {found}"
                )
            }
            Self::SectionLayoutMismatch { message } => {
                write!(f, "{message}")
            }
            Self::UnknownOption { option, value } => {
                write!(f, "unknown {option}: {value}")
            }
            Self::Multi(errors) => {
                for (i, err) in errors.iter().enumerate() {
                    if i != 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            Self::Other { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
