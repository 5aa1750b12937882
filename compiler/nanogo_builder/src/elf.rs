//! Post-link patching of the stack-sizes section.
//!
//! The code generator emits one 32-bit little-endian slot per goroutine in
//! the `.tinygo_stacksizes` section, in the order the sentinel loads were
//! created, with every slot holding the conservative default size. After
//! the stack analyzer produces bounded sizes, this module rewrites the
//! bounded slots in place; everything else keeps the default.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use goblin::elf::Elf;
use rustc_hash::FxHashMap;

use crate::error::BuildError;
use crate::stacksize::{SizeKind, TaskStackSize};

/// Section holding one 32-bit stack-size slot per goroutine.
pub const STACK_SIZES_SECTION: &str = ".tinygo_stacksizes";

/// Bytes reserved for the stack canary. Overflow checking stays on even for
/// computed sizes because not every goroutine gets one.
const STACK_CANARY_BYTES: u32 = 4;

/// Stack bytes an interrupt may consume before switching to the interrupt
/// stack. On Cortex-M the hardware pushes 8 words of caller-saved registers.
const ARM_INTERRUPT_RESERVE: u32 = 32;

/// Read the ELF machine type of an executable.
pub fn elf_machine(executable: &Path) -> Result<u16, BuildError> {
    let bytes = std::fs::read(executable).map_err(|e| BuildError::io(executable, e))?;
    let header = Elf::parse_header(&bytes).map_err(|e| BuildError::Other {
        message: format!(
            "could not load executable {} for stack size analysis: {e}",
            executable.display()
        ),
    })?;
    Ok(header.e_machine)
}

/// Rewrite `.tinygo_stacksizes` with computed worst-case stack sizes.
///
/// `stack_size_loads` are the sentinel symbol names recorded during
/// optimization, in slot order; the section must contain exactly one
/// 32-bit slot per sentinel. Slots whose verdict is not bounded keep the
/// default baked in by the code generator. Running the patcher twice with
/// the same inputs leaves the file unchanged.
pub fn patch_stack_sizes(
    executable: &Path,
    stack_size_loads: &[String],
    stack_sizes: &FxHashMap<String, TaskStackSize>,
) -> Result<(), BuildError> {
    let bytes = std::fs::read(executable).map_err(|e| BuildError::io(executable, e))?;
    let elf = Elf::parse(&bytes).map_err(|e| BuildError::Other {
        message: format!("could not parse executable {}: {e}", executable.display()),
    })?;

    let section = elf
        .section_headers
        .iter()
        .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(STACK_SIZES_SECTION))
        .ok_or_else(|| BuildError::SectionLayoutMismatch {
            message: format!("could not find {STACK_SIZES_SECTION} section"),
        })?;

    let file_range = section.file_range().unwrap_or(0..0);
    if file_range.len() as u64 != section.sh_size {
        return Err(BuildError::SectionLayoutMismatch {
            message: format!(
                "expected {STACK_SIZES_SECTION} to have identical size and file size, got {} and {}",
                section.sh_size,
                file_range.len()
            ),
        });
    }

    let mut data = bytes
        .get(file_range.clone())
        .ok_or_else(|| BuildError::SectionLayoutMismatch {
            message: format!("{STACK_SIZES_SECTION} lies outside the file"),
        })?
        .to_vec();

    if stack_size_loads.len() * 4 != data.len() {
        // AVR could get away with 2-byte sizes, but a stack larger than
        // 4 GiB makes no sense anywhere, so every slot is 4 bytes.
        return Err(BuildError::SectionLayoutMismatch {
            message: format!(
                "expected 4 byte stack sizes: {} slots but {} section bytes",
                stack_size_loads.len(),
                data.len()
            ),
        });
    }

    let interrupt_reserve = match elf.header.e_machine {
        goblin::elf::header::EM_ARM => ARM_INTERRUPT_RESERVE,
        _ => 0,
    };

    for (i, name) in stack_size_loads.iter().enumerate() {
        let entry = stack_sizes
            .get(name)
            .ok_or_else(|| BuildError::MissingSymbol {
                symbol: name.clone(),
                found: 0,
            })?;
        if entry.usage.kind != SizeKind::Bounded {
            continue;
        }
        let stack_size = entry.usage.size as u32 + STACK_CANARY_BYTES + interrupt_reserve;
        data[i * 4..i * 4 + 4].copy_from_slice(&stack_size.to_le_bytes());
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(executable)
        .map_err(|e| BuildError::io(executable, e))?;
    file.seek(SeekFrom::Start(file_range.start as u64))
        .map_err(|e| BuildError::io(executable, e))?;
    file.write_all(&data)
        .map_err(|e| BuildError::io(executable, e))?;
    Ok(())
}
