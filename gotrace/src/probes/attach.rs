//! # eBPF Probe Bundle
//!
//! Loads the compiled probe object and attaches its single uprobe program to
//! every entry and exit site of a [`TargetSpec`].
//!
//! One program serves all sites. Before attaching, each site's runtime
//! address is written into the `PROBE_SITES` map together with the function
//! id and event kind; the probe looks up its own instruction pointer there to
//! know what it is reporting.

use std::fmt;
use std::path::{Path, PathBuf};

use aya::maps::{HashMap, RingBuf};
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::UProbe;
use aya::Ebpf;
use aya_log::EbpfLogger;
use gotrace_common::{ProbeSite, MAX_PROBE_SITES};
use log::{debug, info, warn};

use super::symbols::load_bias;
use super::{ProbeBackend, SiteSpec, TargetSpec};
use crate::consumer::RingBufSource;
use crate::domain::{CaptureError, Pid};
use crate::lifecycle::raise_memlock_limit;

/// Where `cargo xtask build-ebpf` leaves the probe object
pub const DEFAULT_BUNDLE_PATH: &str = "target/bpfel-unknown-none/release/gotrace";

const PROBE_PROGRAM: &str = "gotrace_probe";
const EVENTS_MAP: &str = "EVENTS";
const SITES_MAP: &str = "PROBE_SITES";

/// [`ProbeBackend`] over a real kernel through aya
pub struct AyaBackend {
    bundle_path: PathBuf,
    links: Vec<UProbeLinkId>,
}

impl AyaBackend {
    #[must_use]
    pub fn new(bundle_path: impl Into<PathBuf>) -> Self {
        Self { bundle_path: bundle_path.into(), links: Vec::new() }
    }

    #[must_use]
    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    /// Number of probes currently attached
    #[must_use]
    pub fn attached(&self) -> usize {
        self.links.len()
    }
}

fn probe_program(bpf: &mut Ebpf) -> Result<&mut UProbe, CaptureError> {
    let program = bpf
        .program_mut(PROBE_PROGRAM)
        .ok_or_else(|| CaptureError::BundleLoad(format!("{PROBE_PROGRAM} program not found")))?;
    program
        .try_into()
        .map_err(|e| CaptureError::BundleLoad(format!("{PROBE_PROGRAM} is not a uprobe: {e}")))
}

fn register_sites(bpf: &mut Ebpf, targets: &TargetSpec, bias: u64) -> Result<(), CaptureError> {
    let map = bpf
        .map_mut(SITES_MAP)
        .ok_or_else(|| CaptureError::BundleLoad(format!("{SITES_MAP} map not found")))?;
    let mut sites: HashMap<_, u64, ProbeSite> =
        HashMap::try_from(map).map_err(|e| CaptureError::BundleLoad(format!("{SITES_MAP}: {e}")))?;

    for spec in targets.sites() {
        let address = runtime_address(&spec, bias)?;
        sites.insert(address, spec.site, 0).map_err(|e| CaptureError::ProbeAttach {
            probe: spec.label(),
            binary: targets.binary.display().to_string(),
            error: format!("failed to register site: {e}"),
        })?;
    }
    Ok(())
}

/// Address the probe sees in `rip` when `spec` fires
fn runtime_address(spec: &SiteSpec<'_>, bias: u64) -> Result<u64, CaptureError> {
    spec.address.checked_add(bias).ok_or_else(|| {
        CaptureError::TargetSpec(format!(
            "{} at {:#x} does not fit the address space with load bias {bias:#x}",
            spec.label(),
            spec.address
        ))
    })
}

/// Attach every site or none
///
/// New links are appended to `links`. When a site fails, the links made by
/// this call are detached again, newest first, and `links` is left as it was.
fn attach_all<'s, P, L, E>(
    program: &mut P,
    sites: impl IntoIterator<Item = SiteSpec<'s>>,
    binary: &Path,
    links: &mut Vec<L>,
    attach: impl Fn(&mut P, &SiteSpec<'s>) -> Result<L, E>,
    detach: impl Fn(&mut P, L),
) -> Result<usize, CaptureError>
where
    E: fmt::Display,
{
    let start = links.len();
    for spec in sites {
        match attach(program, &spec) {
            Ok(link) => {
                debug!("attached {}", spec.label());
                links.push(link);
            }
            Err(e) => {
                for link in links.drain(start..).rev() {
                    detach(program, link);
                }
                return Err(CaptureError::ProbeAttach {
                    probe: spec.label(),
                    binary: binary.display().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(links.len() - start)
}

impl ProbeBackend for AyaBackend {
    type Bundle = Ebpf;
    type Source = RingBufSource;

    fn raise_limits(&mut self) -> Result<(), CaptureError> {
        raise_memlock_limit()
    }

    fn load(&mut self) -> Result<Ebpf, CaptureError> {
        let mut bpf = Ebpf::load_file(&self.bundle_path).map_err(|e| {
            CaptureError::BundleLoad(format!("{}: {e}", self.bundle_path.display()))
        })?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {e}");
        }

        probe_program(&mut bpf)?
            .load()
            .map_err(|e| CaptureError::BundleLoad(format!("{PROBE_PROGRAM}: {e}")))?;

        info!("✓ Loaded probe bundle {}", self.bundle_path.display());
        Ok(bpf)
    }

    fn attach(&mut self, bpf: &mut Ebpf, targets: &TargetSpec) -> Result<usize, CaptureError> {
        targets.validate()?;

        let site_count = targets.site_count();
        if site_count > MAX_PROBE_SITES as usize {
            return Err(CaptureError::TargetSpec(format!(
                "{site_count} probe sites exceed the limit of {MAX_PROBE_SITES}"
            )));
        }

        let bias = load_bias(&targets.binary, targets.pid.map(Pid))?;
        register_sites(bpf, targets, bias)?;

        let program = probe_program(bpf)?;
        attach_all(
            program,
            targets.sites(),
            &targets.binary,
            &mut self.links,
            |program, spec| program.attach(Some(spec.symbol), spec.offset, &targets.binary, targets.pid),
            |program, link| {
                if let Err(e) = program.detach(link) {
                    warn!("Failed to detach probe: {e}");
                }
            },
        )
    }

    fn open_source(&mut self, bpf: &mut Ebpf) -> Result<RingBufSource, CaptureError> {
        let map = bpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| CaptureError::BundleLoad(format!("{EVENTS_MAP} map not found")))?;
        let ring = RingBuf::try_from(map)
            .map_err(|e| CaptureError::BundleLoad(format!("{EVENTS_MAP}: {e}")))?;
        RingBufSource::new(ring)
    }

    fn detach(&mut self, bpf: &mut Ebpf) {
        if self.links.is_empty() {
            return;
        }
        let program = match probe_program(bpf) {
            Ok(program) => program,
            Err(e) => {
                // Links are released with the bundle
                warn!("Cannot detach probes: {e}");
                self.links.clear();
                return;
            }
        };

        let total = self.links.len();
        for link in self.links.drain(..) {
            if let Err(e) = program.detach(link) {
                warn!("Failed to detach probe: {e}");
            }
        }
        debug!("detached {total} probes");
    }

    fn destroy(&mut self, bpf: Ebpf) {
        drop(bpf);
    }
}
