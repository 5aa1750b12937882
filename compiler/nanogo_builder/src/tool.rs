//! Running external tools.
//!
//! The C compiler, the linker, and the firmware converters are separate
//! programs. They are run to completion with captured output; exit code
//! zero means success and anything else surfaces the tool's stderr.

use std::fmt;
use std::process::Command;

/// Failure of an external tool invocation.
#[derive(Debug)]
pub struct ToolError {
    program: String,
    exit_code: Option<i32>,
    stderr: String,
    spawn_error: Option<std::io::Error>,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.spawn_error {
            return write!(f, "could not run {}: {err}", self.program);
        }
        write!(f, "{} exited with ", self.program)?;
        match self.exit_code {
            Some(code) => write!(f, "status {code}")?,
            None => write!(f, "a signal")?,
        }
        if !self.stderr.is_empty() {
            write!(f, ":\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolError {}

/// Run `program` with `args`, capturing output.
pub fn run(program: &str, args: &[String]) -> Result<(), ToolError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ToolError {
            program: program.to_string(),
            exit_code: None,
            stderr: String::new(),
            spawn_error: Some(e),
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(ToolError {
        program: program.to_string(),
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        spawn_error: None,
    })
}
