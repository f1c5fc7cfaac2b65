use std::net::Ipv4Addr;

use aya::maps::{Array, HashMap, MapData};
use conntracker_common::{
    CONN_MAP, ConnInfo, ConnKey, ICMP_MAP, IcmpInfo, IcmpKey, PERF_STATS_MAP, PerfStatsRecord,
};
use guarder_core::ebpf::ClockAnchor;
use guarder_core::error::TelemetryError;
use guarder_core::telemetry::{
    ConnectionRecord, IcmpInner, IcmpRecord, PerfStats, TcpState, TelemetryReader,
};
use tracing::debug;

/// Telemetry read straight from the tracker's maps.
pub struct MapTelemetry {
    conns: HashMap<MapData, ConnKey, ConnInfo>,
    icmp: HashMap<MapData, IcmpKey, IcmpInfo>,
    stats: Array<MapData, PerfStatsRecord>,
}

impl MapTelemetry {
    pub fn new(
        conns: HashMap<MapData, ConnKey, ConnInfo>,
        icmp: HashMap<MapData, IcmpKey, IcmpInfo>,
        stats: Array<MapData, PerfStatsRecord>,
    ) -> Self {
        Self { conns, icmp, stats }
    }
}

impl TelemetryReader for MapTelemetry {
    fn connections(&self) -> Result<Vec<ConnectionRecord>, TelemetryError> {
        let anchor = ClockAnchor::now();
        let mut out = Vec::new();
        for item in self.conns.iter() {
            match item {
                Ok((key, info)) => out.push(connection_record(&key, &info, &anchor)),
                Err(e) => {
                    // LRU eviction during the walk invalidates the cursor.
                    debug!("{CONN_MAP} iter error: {e}");
                    break;
                }
            }
        }
        Ok(out)
    }

    fn icmp_flows(&self) -> Result<Vec<IcmpRecord>, TelemetryError> {
        let anchor = ClockAnchor::now();
        let mut out = Vec::new();
        for item in self.icmp.iter() {
            match item {
                Ok((key, info)) => out.push(icmp_record(&key, &info, &anchor)),
                Err(e) => {
                    debug!("{ICMP_MAP} iter error: {e}");
                    break;
                }
            }
        }
        Ok(out)
    }

    fn stats(&self) -> Result<Option<PerfStats>, TelemetryError> {
        let record = self.stats.get(&0, 0).map_err(|e| TelemetryError {
            map: PERF_STATS_MAP,
            detail: e.to_string(),
        })?;
        Ok(Some(PerfStats::from(&record)))
    }
}

/// Addresses sit in the maps exactly as read from the IPv4 header.
fn addr(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

fn connection_record(key: &ConnKey, info: &ConnInfo, anchor: &ClockAnchor) -> ConnectionRecord {
    // Copy out of the packed key before use.
    let (src_ip, dst_ip, src_port, dst_port, protocol) =
        (key.src_ip, key.dst_ip, key.src_port, key.dst_port, key.protocol);

    ConnectionRecord {
        src_ip: addr(src_ip),
        dst_ip: addr(dst_ip),
        src_port,
        dst_port,
        protocol,
        packets: info.packets,
        bytes: info.bytes,
        ip_id: info.ip_id,
        first_seen: anchor.to_wall(info.start_time),
        last_seen: anchor.to_wall(info.last_seen),
        tcp: (info.tcp_flags != 0).then(|| TcpState {
            flags: info.tcp_flags,
            seq: info.seq,
            ack: info.ack_seq,
            window: info.window,
        }),
    }
}

fn icmp_record(key: &IcmpKey, info: &IcmpInfo, anchor: &ClockAnchor) -> IcmpRecord {
    let has_inner = info.inner_src_ip != 0 || info.inner_dst_ip != 0;
    IcmpRecord {
        src_ip: addr(key.src_ip),
        dst_ip: addr(key.dst_ip),
        icmp_type: key.icmp_type,
        icmp_code: key.icmp_code,
        packets: info.packets,
        bytes: info.bytes,
        ip_id: info.ip_id,
        last_seen: anchor.to_wall(info.last_seen),
        inner: has_inner.then(|| IcmpInner {
            src_ip: addr(info.inner_src_ip),
            dst_ip: addr(info.inner_dst_ip),
            protocol: info.inner_protocol,
            src_port: info.inner_src_port,
            dst_port: info.inner_dst_port,
        }),
    }
}
