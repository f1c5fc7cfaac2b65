//! Read-only view of the connection tracker's tables.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, SecondsFormat, Utc};
use conntracker_common::{IPPROTO_TCP, IPPROTO_UDP, PerfStatsRecord};
use serde::Serialize;

use crate::error::TelemetryError;

/// Snapshot-at-call access to the kernel's telemetry maps. Each call walks
/// its table once; records inserted or evicted concurrently may or may not
/// appear.
pub trait TelemetryReader: Send + Sync {
    fn connections(&self) -> Result<Vec<ConnectionRecord>, TelemetryError>;
    fn icmp_flows(&self) -> Result<Vec<IcmpRecord>, TelemetryError>;
    fn stats(&self) -> Result<Option<PerfStats>, TelemetryError>;
}

/// Which tables a digest covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestScope {
    pub connections: bool,
    pub icmp: bool,
    pub stats: bool,
}

impl DigestScope {
    pub const ALL: Self = Self {
        connections: true,
        icmp: true,
        stats: true,
    };
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub connections: Vec<ConnectionRecord>,
    pub icmp: Vec<IcmpRecord>,
    pub stats: Option<PerfStats>,
}

impl TelemetrySnapshot {
    /// Read the tables `scope` asks for; the rest stay empty.
    pub fn capture(reader: &dyn TelemetryReader, scope: DigestScope) -> Result<Self, TelemetryError> {
        Ok(Self {
            connections: if scope.connections {
                reader.connections()?
            } else {
                Vec::new()
            },
            icmp: if scope.icmp {
                reader.icmp_flows()?
            } else {
                Vec::new()
            },
            stats: if scope.stats { reader.stats()? } else { None },
        })
    }
}

// ── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpState {
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub packets: u64,
    pub bytes: u64,
    pub ip_id: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Present once a TCP segment with flags has been seen.
    pub tcp: Option<TcpState>,
}

impl ConnectionRecord {
    /// `src:port -> dst:port (PROTO)`
    pub fn key(&self) -> String {
        format!(
            "{}:{} -> {}:{} ({})",
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            protocol_name(self.protocol)
        )
    }

    pub fn details(&self) -> String {
        let mut parts = vec![
            format!("Packets: {}", self.packets),
            format!("Bytes: {}", self.bytes),
            format!("IP ID: {}", self.ip_id),
            format!("Last Seen: {}", rfc3339(self.last_seen)),
            format!("First Seen: {}", rfc3339(self.first_seen)),
        ];
        if let Some(tcp) = &self.tcp {
            parts.push(format!("TCP Flags: {}", tcp.flags));
            parts.push(format!("Seq: {}", tcp.seq));
            parts.push(format!("Ack: {}", tcp.ack));
            parts.push(format!("Window: {}", tcp.window));
        }
        parts.join(", ")
    }
}

/// The packet quoted inside an ICMP error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IcmpInner {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for IcmpInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Inner Src IP: {}, Inner Dst IP: {}, Inner Protocol: {}",
            self.src_ip,
            self.dst_ip,
            protocol_name(self.protocol)
        )?;
        if self.src_port != 0 || self.dst_port != 0 {
            write!(f, ", Inner Ports: {} -> {}", self.src_port, self.dst_port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IcmpRecord {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub packets: u64,
    pub bytes: u64,
    pub ip_id: u32,
    pub last_seen: DateTime<Utc>,
    pub inner: Option<IcmpInner>,
}

impl IcmpRecord {
    /// `src -> dst (Type: t, Code: c)`
    pub fn key(&self) -> String {
        format!(
            "{} -> {} (Type: {}, Code: {})",
            self.src_ip, self.dst_ip, self.icmp_type, self.icmp_code
        )
    }

    pub fn details(&self) -> String {
        let mut out = format!(
            "Packets: {}, Bytes: {}, IP ID: {}, Last Seen: {}",
            self.packets,
            self.bytes,
            self.ip_id,
            rfc3339(self.last_seen)
        );
        if let Some(inner) = &self.inner {
            out.push_str(&format!(", Inner Packet: {{{inner}}}"));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PerfStats {
    /// Indexed by ICMP type, 0..16.
    pub icmp_type_counts: Vec<u64>,
    /// Indexed by ICMP code, 0..256.
    pub icmp_code_counts: Vec<u64>,
    pub tcp_retrans: u64,
    pub tcp_duplicate_ack: u64,
    pub tcp_out_of_order: u64,
    pub tcp_zero_window: u64,
    pub tcp_small_window: u64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub dropped_packets: u64,
    pub malformed_packets: u64,
}

impl From<&PerfStatsRecord> for PerfStats {
    fn from(r: &PerfStatsRecord) -> Self {
        Self {
            icmp_type_counts: r.icmp_type_counts.to_vec(),
            icmp_code_counts: r.icmp_code_counts.to_vec(),
            tcp_retrans: r.tcp_retrans,
            tcp_duplicate_ack: r.tcp_duplicate_ack,
            tcp_out_of_order: r.tcp_out_of_order,
            tcp_zero_window: r.tcp_zero_window,
            tcp_small_window: r.tcp_small_window,
            total_packets: r.total_packets,
            total_bytes: r.total_bytes,
            dropped_packets: r.dropped_packets,
            malformed_packets: r.malformed_packets,
        }
    }
}

pub fn protocol_name(protocol: u8) -> &'static str {
    match protocol {
        IPPROTO_TCP => "TCP",
        IPPROTO_UDP => "UDP",
        _ => "Unknown",
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── In-memory reader ─────────────────────────────────────────────────

/// Reader over a fixed snapshot. Backs the agent's dry-run mode, the tests
/// and the benchmarks.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    pub snapshot: TelemetrySnapshot,
}

impl StaticTelemetry {
    pub fn new(snapshot: TelemetrySnapshot) -> Self {
        Self { snapshot }
    }
}

impl TelemetryReader for StaticTelemetry {
    fn connections(&self) -> Result<Vec<ConnectionRecord>, TelemetryError> {
        Ok(self.snapshot.connections.clone())
    }

    fn icmp_flows(&self) -> Result<Vec<IcmpRecord>, TelemetryError> {
        Ok(self.snapshot.icmp.clone())
    }

    fn stats(&self) -> Result<Option<PerfStats>, TelemetryError> {
        Ok(self.snapshot.stats.clone())
    }
}
