//! `no_std` C-compatible structs shared between the XDP connection tracker
//! and userspace: the filter rule record, telemetry map keys and values,
//! and the wire constants the kernel program matches on.
#![no_std]

// ── Program and map names ────────────────────────────────────────────
pub const XDP_PROGRAM: &str = "conn_tracker";
pub const FILTER_MAP: &str = "filter_map";
pub const CONN_MAP: &str = "conn_map";
pub const ICMP_MAP: &str = "icmp_map";
pub const PERF_STATS_MAP: &str = "perf_stats_map";

// ── Map sizes ────────────────────────────────────────────────────────
pub const FILTER_MAP_SIZE: u32 = 32;
pub const CONN_MAP_SIZE: u32 = 65_536;
pub const ICMP_MAP_SIZE: u32 = 1_024;

// ── IP protocol numbers ──────────────────────────────────────────────
pub const PROTO_ANY: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// ── Rule actions ─────────────────────────────────────────────────────
pub const ACTION_ALLOW: u8 = 0;
pub const ACTION_DROP: u8 = 1;

// ── Rule types ───────────────────────────────────────────────────────
pub const RULE_TYPE_BASIC: u8 = 0;
pub const RULE_TYPE_ICMP: u8 = 1;
pub const RULE_TYPE_TCP: u8 = 2;
pub const RULE_TYPE_UDP: u8 = 3;

// ── Wildcards ────────────────────────────────────────────────────────
pub const ICMP_ANY: u8 = 255;

// ── Map update flags (BPF_ANY / BPF_EXIST) ───────────────────────────
pub const BPF_ANY: u64 = 0;
pub const BPF_EXIST: u64 = 2;

// ── Statistics layout ────────────────────────────────────────────────
pub const ICMP_TYPE_SLOTS: usize = 16;
pub const ICMP_CODE_SLOTS: usize = 256;

// ── Shared types ─────────────────────────────────────────────────────

/// One slot of `filter_map`. Addresses are stored exactly as they appear
/// in the IPv4 header (network byte order); ports in host order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterRuleRecord {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub action: u8,
    pub enabled: u8,
    pub rule_type: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub tcp_flags: u8,
    pub tcp_flags_mask: u8,
    pub inner_src_ip: u32,
    pub inner_dst_ip: u32,
    pub inner_protocol: u8,
    pub _pad: [u8; 3],
}

const _: () = assert!(core::mem::size_of::<FilterRuleRecord>() == 32);

#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct ConnKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _pad: [u8; 3],
}

const _: () = assert!(core::mem::size_of::<ConnKey>() == 16);

/// Timestamps are `bpf_ktime_get_ns()` values (CLOCK_MONOTONIC).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct ConnInfo {
    pub packets: u64,
    pub bytes: u64,
    pub ip_id: u32,
    pub start_time: u64,
    pub last_seen: u64,
    pub tcp_flags: u8,
    pub seq: u32,
    pub ack_seq: u32,
    pub window: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct IcmpKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub _pad: [u8; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct IcmpInfo {
    pub packets: u64,
    pub bytes: u64,
    pub ip_id: u32,
    pub last_seen: u64,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub inner_src_ip: u32,
    pub inner_dst_ip: u32,
    pub inner_protocol: u8,
    pub inner_src_port: u16,
    pub inner_dst_port: u16,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct PerfStatsRecord {
    pub icmp_type_counts: [u64; ICMP_TYPE_SLOTS],
    pub icmp_code_counts: [u64; ICMP_CODE_SLOTS],
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

impl Default for PerfStatsRecord {
    fn default() -> Self {
        Self {
            icmp_type_counts: [0; ICMP_TYPE_SLOTS],
            icmp_code_counts: [0; ICMP_CODE_SLOTS],
            tcp_retrans: 0,
            tcp_duplicate_ack: 0,
            tcp_out_of_order: 0,
            tcp_zero_window: 0,
            tcp_small_window: 0,
            total_packets: 0,
            total_bytes: 0,
            dropped_packets: 0,
            malformed_packets: 0,
        }
    }
}

// Safety: these are plain C-compatible structs with no pointers
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for FilterRuleRecord {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ConnKey {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ConnInfo {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for IcmpKey {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for IcmpInfo {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for PerfStatsRecord {}
