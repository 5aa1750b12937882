//! Dependency-manifest parsing.
//!
//! The C compiler is asked (`-MD -MV -MTdeps`) to emit the list of files a
//! translation unit depends on. Of the make dialects compilers can produce,
//! only the quoted NMake/Jom variant is parsed here: BSD make has no escaping
//! at all and GNU make escaping is buggy in both GCC and Clang, while the
//! NMake variant simply quotes any path containing unusual characters. Its
//! one remaining gap is that a double quote inside a path cannot be
//! represented; such paths are rejected by the target compiler anyway.

use std::path::Path;

use crate::error::BuildError;

/// Read and parse a dependency manifest from disk.
///
/// A missing or empty file yields an empty list: assembly inputs routinely
/// produce no manifest at all.
pub fn read_dep_file(path: &Path) -> Result<Vec<String>, BuildError> {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    if contents.is_empty() {
        return Ok(Vec::new());
    }
    parse_dep_file(&contents)
}

/// Parse the quoted NMake dependency format emitted by Clang's `-MD -MV`.
///
/// Only the first logical line is considered and it must start with the
/// `deps:` target. Paths starting with `"` extend to the closing quote and
/// may contain spaces; all other paths end at the next whitespace character.
///
/// # Errors
///
/// [`BuildError::MalformedDepFile`] when the `deps:` prefix is absent or an
/// opening quote is never closed.
pub fn parse_dep_file(input: &str) -> Result<Vec<String>, BuildError> {
    // A backslash before a newline is only a line continuation; fold the
    // whole manifest back onto one line before splitting.
    let unfolded = input.replace("\\\n", " ");
    let line = unfolded.split('\n').next().unwrap_or("");

    let rest = line
        .strip_prefix("deps:")
        .ok_or_else(|| BuildError::MalformedDepFile {
            message: "expected 'deps:' prefix".to_string(),
        })?;

    let mut line = rest.trim();
    let mut deps = Vec::new();
    while !line.is_empty() {
        if let Some(quoted) = line.strip_prefix('"') {
            // Quoted path, ends at the next double quote. Double quotes
            // inside the path itself cannot be represented in this format.
            let end = quoted.find('"').ok_or_else(|| BuildError::MalformedDepFile {
                message: "path is incorrectly quoted".to_string(),
            })?;
            deps.push(quoted[..end].to_string());
            line = quoted[end + 1..].trim_start();
        } else {
            // Unquoted path, ends at whitespace or the end of the line.
            match line.find(char::is_whitespace) {
                Some(end) => {
                    deps.push(line[..end].to_string());
                    line = line[end..].trim_start();
                }
                None => {
                    deps.push(line.to_string());
                    break;
                }
            }
        }
    }
    Ok(deps)
}
