use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context as _;
use aya::Ebpf;
use aya::maps::{Array, HashMap, MapData};
use aya::programs::{Xdp, XdpFlags};
use conntracker_common::{
    CONN_MAP, FILTER_MAP, FILTER_MAP_SIZE, FilterRuleRecord, ICMP_MAP, PERF_STATS_MAP,
    XDP_PROGRAM,
};
use guarder_core::ebpf::raise_memlock_rlimit;
use tracing::{info, warn};

use crate::reader::MapTelemetry;
use crate::table::FilterTable;

/// The loaded object must outlive the handles; dropping it detaches the
/// program.
pub type EbpfHandles = (Ebpf, FilterTable, MapTelemetry);

/// How the XDP program is attached to the interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachMode {
    /// Let the kernel pick (native if the driver supports it).
    #[default]
    Default,
    /// Generic XDP in the network stack.
    Skb,
    /// Native driver mode.
    Driver,
    /// NIC offload.
    Hardware,
}

impl AttachMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            AttachMode::Default => XdpFlags::default(),
            AttachMode::Skb => XdpFlags::SKB_MODE,
            AttachMode::Driver => XdpFlags::DRV_MODE,
            AttachMode::Hardware => XdpFlags::HW_MODE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttachMode::Default => "default",
            AttachMode::Skb => "skb",
            AttachMode::Driver => "driver",
            AttachMode::Hardware => "hardware",
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(AttachMode::Default),
            "skb" | "generic" => Ok(AttachMode::Skb),
            "driver" | "drv" | "native" => Ok(AttachMode::Driver),
            "hardware" | "hw" | "offload" => Ok(AttachMode::Hardware),
            other => Err(format!(
                "unknown XDP mode {other:?} (expected default, skb, driver or hardware)"
            )),
        }
    }
}

/// Load the compiled tracker from `object`, attach it to `iface` and take
/// ownership of its maps.
pub fn load_and_attach(object: &Path, iface: &str, mode: AttachMode) -> anyhow::Result<EbpfHandles> {
    raise_memlock_rlimit();

    let mut ebpf = Ebpf::load_file(object)
        .with_context(|| format!("failed to load eBPF object {}", object.display()))?;

    let prog: &mut Xdp = ebpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found in object"))?
        .try_into()?;
    prog.load().context("failed to load XDP program")?;
    prog.attach(iface, mode.flags())
        .with_context(|| format!("failed to attach XDP program to {iface} ({mode} mode)"))?;
    info!(iface, %mode, "attached {XDP_PROGRAM}");

    // Take ownership so the handles are 'static.
    let filters: Array<MapData, FilterRuleRecord> = Array::try_from(
        ebpf.take_map(FILTER_MAP)
            .with_context(|| format!("map {FILTER_MAP} not found"))?,
    )?;
    if filters.len() != FILTER_MAP_SIZE {
        warn!(
            expected = FILTER_MAP_SIZE,
            actual = filters.len(),
            "{FILTER_MAP} size differs from the rule capacity"
        );
    }
    let conns = HashMap::try_from(
        ebpf.take_map(CONN_MAP)
            .with_context(|| format!("map {CONN_MAP} not found"))?,
    )?;
    let icmp = HashMap::try_from(
        ebpf.take_map(ICMP_MAP)
            .with_context(|| format!("map {ICMP_MAP} not found"))?,
    )?;
    let stats = Array::try_from(
        ebpf.take_map(PERF_STATS_MAP)
            .with_context(|| format!("map {PERF_STATS_MAP} not found"))?,
    )?;

    Ok((
        ebpf,
        FilterTable::new(filters),
        MapTelemetry::new(conns, icmp, stats),
    ))
}
