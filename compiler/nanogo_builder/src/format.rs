//! Output binary formats.
//!
//! The link job always produces an ELF executable. Microcontroller flash
//! tools want other containers; those conversions are done by external
//! tools run after the final link.

use std::path::Path;

use tracing::debug;

use crate::config::Target;
use crate::error::BuildError;
use crate::tool;

/// Container format of the final build output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    /// The linked executable as-is.
    Elf,
    /// Intel HEX.
    Hex,
    /// Raw firmware image.
    Bin,
    /// UF2 flashing container.
    Uf2,
    /// ESP32 ROM bootloader image.
    Esp32,
    /// ESP8266 ROM bootloader image.
    Esp8266,
}

impl BinaryFormat {
    /// Parse a format name from the target description or an output
    /// extension.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "elf" => Some(Self::Elf),
            "hex" => Some(Self::Hex),
            "bin" => Some(Self::Bin),
            "uf2" => Some(Self::Uf2),
            "esp32" => Some(Self::Esp32),
            "esp8266" => Some(Self::Esp8266),
            _ => None,
        }
    }
}

/// Convert the linked ELF into `format` at `outpath` using the external
/// conversion tool for that format.
pub fn convert_executable(
    format: BinaryFormat,
    executable: &Path,
    outpath: &Path,
    target: &Target,
) -> Result<(), BuildError> {
    let executable_arg = executable.to_string_lossy().into_owned();
    let outpath_arg = outpath.to_string_lossy().into_owned();
    let (tool_name, args) = match format {
        BinaryFormat::Elf => return Ok(()),
        BinaryFormat::Hex => (
            target.objcopy.as_str(),
            vec![
                "-O".to_string(),
                "ihex".to_string(),
                executable_arg,
                outpath_arg,
            ],
        ),
        BinaryFormat::Bin => (
            target.objcopy.as_str(),
            vec![
                "-O".to_string(),
                "binary".to_string(),
                executable_arg,
                outpath_arg,
            ],
        ),
        BinaryFormat::Uf2 => (
            "uf2conv",
            vec![
                "-f".to_string(),
                target.uf2_family_id.clone(),
                "-c".to_string(),
                "-o".to_string(),
                outpath_arg,
                executable_arg,
            ],
        ),
        BinaryFormat::Esp32 | BinaryFormat::Esp8266 => {
            let chip = if format == BinaryFormat::Esp32 {
                "esp32"
            } else {
                "esp8266"
            };
            (
                "esptool",
                vec![
                    "--chip".to_string(),
                    chip.to_string(),
                    "elf2image".to_string(),
                    "--output".to_string(),
                    outpath_arg,
                    executable_arg,
                ],
            )
        }
    };

    debug!("{} {}", tool_name, args.join(" "));
    tool::run(tool_name, &args).map_err(|e| BuildError::ToolFailed {
        tool: tool_name.to_string(),
        detail: e.to_string(),
    })
}
