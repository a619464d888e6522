//! Target discovery from a Go binary
//!
//! Go functions cannot be traced with return probes: the runtime may move a
//! goroutine's stack while the function runs, and a uretprobe's rewritten
//! return address goes with it. Instead every `RET` instruction in the
//! function body gets its own uprobe. Finding them requires decoding the
//! body instruction by instruction; a `0xc3` byte may just as well be part of
//! an immediate or a displacement.

use std::fs;
use std::path::Path;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};
use log::info;
use object::{Architecture, Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};

use super::targets::{FunctionTarget, TargetSpec};
use crate::domain::{CaptureError, Pid};

/// User code of a Go program lives in package `main`
pub const DEFAULT_PREFIX: &str = "main.";

/// Build a target specification from the `.symtab` of `binary`
///
/// Every text symbol starting with `prefix` is traced, except Go
/// compiler-generated names (`main..stmp_0`, `main..inittask`). Function ids
/// are assigned in symbol-table order.
///
/// # Errors
/// Returns [`CaptureError::Symbols`] if the binary cannot be parsed, is not
/// x86-64, or has a matching symbol outside `.text`; [`CaptureError::NoTargets`]
/// if nothing matches.
pub fn discover_targets(binary: &Path, prefix: &str) -> Result<TargetSpec, CaptureError> {
    let data = fs::read(binary)
        .map_err(|e| CaptureError::Symbols(format!("Failed to read {}: {e}", binary.display())))?;
    let obj = object::File::parse(&*data)
        .map_err(|e| CaptureError::Symbols(format!("{}: {e}", binary.display())))?;

    if obj.architecture() != Architecture::X86_64 {
        return Err(CaptureError::Symbols(format!(
            "{}: unsupported architecture {:?} (x86-64 only)",
            binary.display(),
            obj.architecture()
        )));
    }

    let text = obj
        .section_by_name(".text")
        .ok_or_else(|| CaptureError::Symbols(format!("{}: no .text section", binary.display())))?;
    let text_address = text.address();
    let text_data = text.data().map_err(|e| CaptureError::Symbols(e.to_string()))?;

    let mut functions = Vec::new();
    for symbol in obj.symbols() {
        if symbol.kind() != SymbolKind::Text {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        if !is_traced_symbol(name, prefix) {
            continue;
        }

        let address = symbol.address();
        let body = function_body(text_data, text_address, address, symbol.size())
            .ok_or_else(|| CaptureError::Symbols(format!("{name} lies outside .text")))?;
        let id = u32::try_from(functions.len())
            .map_err(|_| CaptureError::Symbols("too many functions".to_string()))?;

        functions.push(FunctionTarget {
            id,
            symbol: name.to_string(),
            address,
            exit_offsets: ret_offsets(body, address),
        });
    }

    if functions.is_empty() {
        return Err(CaptureError::NoTargets(format!(
            "{} (no `{prefix}` symbols in .symtab; is the binary stripped?)",
            binary.display()
        )));
    }

    info!("Discovered {} functions in {}", functions.len(), binary.display());
    Ok(TargetSpec { binary: binary.to_path_buf(), pid: None, functions })
}

/// `main.foo` and `main.(*T).foo` match prefix `main.`, `main..stmp_0` does not
#[must_use]
pub fn is_traced_symbol(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix).is_some_and(|rest| !rest.is_empty() && !rest.starts_with('.'))
}

fn function_body(text: &[u8], text_address: u64, address: u64, size: u64) -> Option<&[u8]> {
    let start = usize::try_from(address.checked_sub(text_address)?).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    text.get(start..end)
}

/// Offsets (relative to `address`) of every return instruction in `code`
#[must_use]
pub fn ret_offsets(code: &[u8], address: u64) -> Vec<u64> {
    let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut offsets = Vec::new();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.mnemonic() == Mnemonic::Ret {
            offsets.push(instruction.ip() - address);
        }
    }
    offsets
}

/// Difference between runtime and link-time addresses of `binary` in `pid`
///
/// Zero for fixed-address executables (the Go default). For PIE binaries the
/// load address is read from `/proc/<pid>/maps`.
///
/// # Errors
/// Returns [`CaptureError::Symbols`] if the binary cannot be parsed, is PIE
/// and no pid is given (every process may load it elsewhere), or is not
/// mapped in `pid`
pub fn load_bias(binary: &Path, pid: Option<Pid>) -> Result<u64, CaptureError> {
    let data = fs::read(binary)
        .map_err(|e| CaptureError::Symbols(format!("Failed to read {}: {e}", binary.display())))?;
    let obj = object::File::parse(&*data)
        .map_err(|e| CaptureError::Symbols(format!("{}: {e}", binary.display())))?;

    if obj.kind() != ObjectKind::Dynamic {
        return Ok(0);
    }

    let Some(pid) = pid else {
        return Err(CaptureError::Symbols(format!(
            "{} is position independent; its load address is only known for a running \
             process, pass --pid",
            binary.display()
        )));
    };

    let link_base = obj.segments().map(|segment| segment.address()).min().unwrap_or(0);
    let canonical = fs::canonicalize(binary).unwrap_or_else(|_| binary.to_path_buf());
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path)
        .map_err(|e| CaptureError::Symbols(format!("Failed to read {maps_path}: {e}")))?;

    let base = mapping_base(&maps, &canonical.to_string_lossy()).ok_or_else(|| {
        CaptureError::Symbols(format!("{} is not mapped in {pid}", canonical.display()))
    })?;

    let bias = base.saturating_sub(link_base);
    info!("Load bias for {}: 0x{bias:x}", canonical.display());
    Ok(bias)
}

/// Start address of the mapping of `binary_path` at file offset 0
fn mapping_base(maps: &str, binary_path: &str) -> Option<u64> {
    maps.lines().find_map(|line| {
        // "start-end perms offset dev inode pathname"
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 || parts[5] != binary_path {
            return None;
        }
        if u64::from_str_radix(parts[2], 16).ok()? != 0 {
            return None;
        }
        let (start, _) = parts[0].split_once('-')?;
        u64::from_str_radix(start, 16).ok()
    })
}
