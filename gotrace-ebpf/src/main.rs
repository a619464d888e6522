//! # eBPF Probe Bundle
//!
//! One uprobe program, `gotrace_probe`, attached by userspace at every entry
//! and every `RET` site of the traced functions. Each hit emits one
//! [`EventRecordV3`] into the `EVENTS` ring buffer.
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer carrying capture records
//! - `PROBE_SITES` - Runtime address → `{func_id, kind}`, filled before attaching
//!
//! Goroutine id extraction is not done here: `goid` and `continuation` are
//! always written as 0.
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{map, uprobe},
    maps::{HashMap, RingBuf},
    programs::ProbeContext,
};
use aya_log_ebpf::debug;
use gotrace_common::{EventRecordV3, ProbeSite, EVENTS_RING_SIZE, MAX_PROBE_SITES};

// ============================================================================
// eBPF Maps
// ============================================================================

/// Capture records for userspace (drops on overflow, the consumer never blocks producers)
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_SIZE, 0);

/// Map: runtime probe address → probe site
///
/// Populated by userspace before each uprobe is attached.
#[map]
static PROBE_SITES: HashMap<u64, ProbeSite> = HashMap::with_max_entries(MAX_PROBE_SITES, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: every entry / exit site of a traced function
#[uprobe]
pub fn gotrace_probe(ctx: ProbeContext) -> u32 {
    match try_probe(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_probe(ctx: &ProbeContext) -> Result<(), i64> {
    // The uprobe handler sees the instruction pointer rewound to the probed address
    let ip = unsafe { (*ctx.regs).rip };

    let Some(site) = (unsafe { PROBE_SITES.get(&ip) }) else {
        debug!(ctx, "no probe site registered for 0x{:x}", ip);
        return Err(1);
    };

    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };

    let record = EventRecordV3 {
        func_id: site.func_id,
        kind: site.kind,
        continuation: 0,
        _padding: [0; 2],
        pid: pid_tgid as u32,
        tgid: (pid_tgid >> 32) as u32,
        goid: 0,
        timestamp_ns: unsafe { bpf_ktime_get_ns() },
    };

    EVENTS.output(&record, 0).map_err(|_| 1i64)?;
    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
