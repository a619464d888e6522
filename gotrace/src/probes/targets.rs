//! Target specification
//!
//! Which functions of which binary to trace, stored as JSON:
//!
//! ```json
//! {
//!   "binary": "/srv/app/server",
//!   "pid": 1234,
//!   "functions": [
//!     { "id": 0, "symbol": "main.handle", "address": 4825568, "exit_offsets": [87, 142] }
//!   ]
//! }
//! ```
//!
//! `id` is the function code written into records, so the same file maps
//! codes in `output.txt` back to names. `address` is the link-time address of
//! the symbol; each exit offset is relative to it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use gotrace_common::ProbeSite;
use serde::{Deserialize, Serialize};

use crate::domain::CaptureError;

/// Largest exit offset accepted from a specification file (16 MiB function body)
pub const MAX_EXIT_OFFSET: u64 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionTarget {
    pub id: u32,
    pub symbol: String,
    pub address: u64,
    /// Offsets of every return instruction, relative to `address`
    #[serde(default)]
    pub exit_offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub binary: PathBuf,
    /// Restrict probes to one process (`None` = every process running `binary`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub functions: Vec<FunctionTarget>,
}

/// One uprobe to attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSpec<'a> {
    pub symbol: &'a str,
    /// Offset from the symbol (0 for the entry site)
    pub offset: u64,
    /// Link-time address of the site
    pub address: u64,
    pub site: ProbeSite,
}

impl SiteSpec<'_> {
    /// `symbol+0xoffset`, for messages
    #[must_use]
    pub fn label(&self) -> String {
        if self.offset == 0 {
            self.symbol.to_string()
        } else {
            format!("{}+{:#x}", self.symbol, self.offset)
        }
    }
}

impl TargetSpec {
    /// Read and validate a JSON target specification
    ///
    /// # Errors
    /// Returns [`CaptureError::TargetSpec`] if the file cannot be read or parsed,
    /// or if it fails [`validate`](Self::validate)
    pub fn from_file(path: &Path) -> Result<Self, CaptureError> {
        let text = fs::read_to_string(path)
            .map_err(|e| CaptureError::TargetSpec(format!("{}: {e}", path.display())))?;
        let spec: Self = serde_json::from_str(&text)
            .map_err(|e| CaptureError::TargetSpec(format!("{}: {e}", path.display())))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Serialize as pretty-printed JSON
    ///
    /// # Errors
    /// Returns [`CaptureError::TargetSpec`] if serialization fails
    pub fn to_json(&self) -> Result<String, CaptureError> {
        serde_json::to_string_pretty(self).map_err(|e| CaptureError::TargetSpec(e.to_string()))
    }

    /// At least one function, unique function ids, and exit sites that lie
    /// inside the address space and apart from the entry site
    ///
    /// # Errors
    /// Returns [`CaptureError::NoTargets`] or [`CaptureError::TargetSpec`]
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.functions.is_empty() {
            return Err(CaptureError::NoTargets(self.binary.display().to_string()));
        }

        let mut seen = HashSet::new();
        for function in &self.functions {
            if !seen.insert(function.id) {
                return Err(CaptureError::TargetSpec(format!(
                    "function id {} is used more than once ({})",
                    function.id, function.symbol
                )));
            }
            for &offset in &function.exit_offsets {
                if offset == 0 || offset > MAX_EXIT_OFFSET {
                    return Err(CaptureError::TargetSpec(format!(
                        "{}: exit offset {offset:#x} outside 1..={MAX_EXIT_OFFSET:#x}",
                        function.symbol
                    )));
                }
                if function.address.checked_add(offset).is_none() {
                    return Err(CaptureError::TargetSpec(format!(
                        "{}: exit offset {offset:#x} overflows address {:#x}",
                        function.symbol, function.address
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every entry and exit site, entry first for each function
    pub fn sites(&self) -> impl Iterator<Item = SiteSpec<'_>> + '_ {
        self.functions.iter().flat_map(|function| {
            let entry = SiteSpec {
                symbol: &function.symbol,
                offset: 0,
                address: function.address,
                site: ProbeSite::entry(function.id),
            };
            let exits = function.exit_offsets.iter().map(move |&offset| SiteSpec {
                symbol: &function.symbol,
                offset,
                // validate() rejects offsets that overflow
                address: function.address.saturating_add(offset),
                site: ProbeSite::exit(function.id),
            });
            std::iter::once(entry).chain(exits)
        })
    }

    #[must_use]
    pub fn site_count(&self) -> usize {
        self.functions.iter().map(|f| 1 + f.exit_offsets.len()).sum()
    }
}
