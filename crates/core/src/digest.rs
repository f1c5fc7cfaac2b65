//! Size-bounded textual summary of telemetry, fed to the generation
//! service as the user message.
//!
//! Sections are appended in order (connections, ICMP, statistics) and
//! each one is gated on how much of the budget is already spent, so the
//! later sections give way first on a busy host.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use chrono::{SecondsFormat, Utc};
use conntracker_common::{IPPROTO_TCP, IPPROTO_UDP};

use crate::telemetry::{DigestScope, TelemetrySnapshot};

pub const MAX_DIGEST_LEN: usize = 10_000;

pub const TRUNCATION_MARKER: &str = "\n\n... (content truncated to fit 10000 character limit)";

const MAX_CONNECTION_DETAILS: usize = 50;
const MAX_ICMP_DETAILS: usize = 30;
const MAX_ACTIVE_SOURCES: usize = 20;

// Budget gates, in bytes of output so far.
const CONNECTION_DETAIL_GATE: usize = MAX_DIGEST_LEN * 70 / 100;
const ICMP_SECTION_GATE: usize = MAX_DIGEST_LEN * 90 / 100;
const ICMP_DETAIL_GATE: usize = MAX_DIGEST_LEN * 95 / 100;
const STATS_SECTION_GATE: usize = MAX_DIGEST_LEN * 98 / 100;

/// Render `snapshot` as a digest of at most [`MAX_DIGEST_LEN`] bytes.
///
/// Whenever a gate cuts a section short or skips a requested one, the
/// output ends with [`TRUNCATION_MARKER`].
pub fn summarize(snapshot: &TelemetrySnapshot, scope: DigestScope) -> String {
    let mut out = String::with_capacity(MAX_DIGEST_LEN);
    let mut truncated = false;

    out.push_str("=== Network Connection Analysis ===\n\n");
    let _ = writeln!(
        out,
        "Analysis Time: {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    if scope.connections {
        truncated |= write_connections(&mut out, snapshot);
    }

    if scope.icmp {
        if out.len() < ICMP_SECTION_GATE {
            truncated |= write_icmp(&mut out, snapshot);
        } else {
            truncated = true;
        }
    }

    if scope.stats
        && let Some(stats) = &snapshot.stats
    {
        if out.len() < STATS_SECTION_GATE {
            out.push_str("=== Performance Statistics ===\n");
            let _ = writeln!(out, "Total Packets: {}", stats.total_packets);
            let _ = writeln!(out, "Total Bytes: {}", stats.total_bytes);
            let _ = writeln!(out, "Dropped Packets: {}", stats.dropped_packets);
            let _ = writeln!(out, "Malformed Packets: {}", stats.malformed_packets);
            let _ = writeln!(out, "TCP Retransmissions: {}", stats.tcp_retrans);
            let _ = writeln!(out, "TCP Duplicate ACKs: {}", stats.tcp_duplicate_ack);
            let _ = writeln!(out, "TCP Out-of-Order: {}", stats.tcp_out_of_order);
            let _ = writeln!(out, "TCP Zero Window: {}", stats.tcp_zero_window);
            let _ = writeln!(out, "TCP Small Window: {}", stats.tcp_small_window);
            out.push_str("\nICMP Type Counts:\n");
            for (icmp_type, count) in stats.icmp_type_counts.iter().enumerate() {
                if *count > 0 {
                    let _ = writeln!(out, "- Type {icmp_type}: {count}");
                }
            }
            out.push('\n');
        } else {
            truncated = true;
        }
    }

    finish(out, truncated)
}

/// Returns whether detail output was cut by the budget gate.
fn write_connections(out: &mut String, snapshot: &TelemetrySnapshot) -> bool {
    let total = snapshot.connections.len();
    out.push_str("=== TCP/UDP Connections ===\n");
    let _ = writeln!(out, "Total Connections: {total}\n");

    let mut displayed = 0;
    let mut cut = false;
    for conn in &snapshot.connections {
        if out.len() > CONNECTION_DETAIL_GATE {
            let _ = writeln!(
                out,
                "... (showing first {displayed} of {total} connections, truncated to save space)\n"
            );
            cut = true;
            break;
        }
        if displayed == MAX_CONNECTION_DETAILS {
            let _ = writeln!(out, "... (showing first {displayed} of {total} connections)\n");
            break;
        }
        let _ = writeln!(out, "Connection: {}", conn.key());
        let _ = writeln!(out, "Details: {}\n", conn.details());
        displayed += 1;
    }

    // Tallies cover every record, not just the ones shown above.
    let mut tcp = 0usize;
    let mut udp = 0usize;
    let mut sources: HashMap<Ipv4Addr, usize> = HashMap::new();
    for conn in &snapshot.connections {
        match conn.protocol {
            IPPROTO_TCP => tcp += 1,
            IPPROTO_UDP => udp += 1,
            _ => {}
        }
        *sources.entry(conn.src_ip).or_default() += 1;
    }

    let _ = writeln!(
        out,
        "Connection Summary:\n- TCP Connections: {tcp}\n- UDP Connections: {udp}\n"
    );

    let mut recurring: Vec<(Ipv4Addr, usize)> =
        sources.into_iter().filter(|&(_, n)| n > 1).collect();
    recurring.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    out.push_str("Active Source IPs:\n");
    for (ip, count) in recurring.iter().take(MAX_ACTIVE_SOURCES) {
        let _ = writeln!(out, "- {ip}: {count} connections");
    }
    if recurring.len() > MAX_ACTIVE_SOURCES {
        let _ = writeln!(out, "... and {} more IPs", recurring.len() - MAX_ACTIVE_SOURCES);
    }
    out.push('\n');

    cut
}

fn write_icmp(out: &mut String, snapshot: &TelemetrySnapshot) -> bool {
    let total = snapshot.icmp.len();
    out.push_str("=== ICMP Traffic ===\n");
    let _ = writeln!(out, "Total ICMP Entries: {total}\n");

    let mut displayed = 0;
    let mut cut = false;
    for flow in &snapshot.icmp {
        if out.len() > ICMP_DETAIL_GATE {
            let _ = writeln!(
                out,
                "... (showing first {displayed} of {total} ICMP entries, truncated)\n"
            );
            cut = true;
            break;
        }
        if displayed == MAX_ICMP_DETAILS {
            let _ = writeln!(out, "... (showing first {displayed} of {total} ICMP entries)\n");
            break;
        }
        let _ = writeln!(out, "ICMP: {}", flow.key());
        let _ = writeln!(out, "Details: {}\n", flow.details());
        displayed += 1;
    }

    let mut by_type: BTreeMap<u8, usize> = BTreeMap::new();
    for flow in &snapshot.icmp {
        *by_type.entry(flow.icmp_type).or_default() += 1;
    }
    out.push_str("ICMP Type Summary:\n");
    for (icmp_type, count) in by_type {
        let _ = writeln!(out, "- Type {icmp_type}: {count} entries");
    }
    out.push('\n');

    cut
}

fn finish(mut out: String, truncated: bool) -> String {
    if out.len() > MAX_DIGEST_LEN {
        out.truncate(floor_char_boundary(&out, MAX_DIGEST_LEN - 100));
        out.push_str(TRUNCATION_MARKER);
    } else if truncated {
        let room = MAX_DIGEST_LEN - TRUNCATION_MARKER.len();
        if out.len() > room {
            out.truncate(floor_char_boundary(&out, room));
        }
        out.push_str(TRUNCATION_MARKER);
    }
    out
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ConnectionRecord, IcmpRecord, PerfStats};

    fn conn(src: [u8; 4], src_port: u16, protocol: u8) -> ConnectionRecord {
        let now = Utc::now();
        ConnectionRecord {
            src_ip: Ipv4Addr::from(src),
            dst_ip: Ipv4Addr::new(10, 0, 0, 254),
            src_port,
            dst_port: 80,
            protocol,
            packets: 10,
            bytes: 1500,
            ip_id: 1,
            first_seen: now,
            last_seen: now,
            tcp: None,
        }
    }

    fn icmp(icmp_type: u8) -> IcmpRecord {
        IcmpRecord {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            icmp_type,
            icmp_code: 0,
            packets: 1,
            bytes: 64,
            ip_id: 9,
            last_seen: Utc::now(),
            inner: None,
        }
    }

    fn stats() -> PerfStats {
        let mut icmp_type_counts = vec![0; 16];
        icmp_type_counts[8] = 12;
        PerfStats {
            icmp_type_counts,
            icmp_code_counts: vec![0; 256],
            total_packets: 1000,
            tcp_retrans: 3,
            ..Default::default()
        }
    }

    #[test]
    fn small_snapshot_is_rendered_in_full() {
        let snapshot = TelemetrySnapshot {
            connections: vec![
                conn([10, 0, 0, 1], 1000, IPPROTO_TCP),
                conn([10, 0, 0, 1], 1001, IPPROTO_TCP),
                conn([10, 0, 0, 3], 53, IPPROTO_UDP),
            ],
            icmp: vec![icmp(8), icmp(8), icmp(0)],
            stats: Some(stats()),
        };

        let digest = summarize(&snapshot, DigestScope::ALL);
        assert!(digest.starts_with("=== Network Connection Analysis ===\n\nAnalysis Time: "));
        assert!(digest.contains("Total Connections: 3\n"));
        assert!(digest.contains("Connection: 10.0.0.1:1000 -> 10.0.0.254:80 (TCP)\n"));
        assert!(digest.contains("- TCP Connections: 2\n- UDP Connections: 1\n"));
        assert!(digest.contains("Active Source IPs:\n- 10.0.0.1: 2 connections\n\n"));
        assert!(!digest.contains("- 10.0.0.3:"));
        assert!(digest.contains("ICMP Type Summary:\n- Type 0: 1 entries\n- Type 8: 2 entries\n"));
        assert!(digest.contains("Total Packets: 1000\n"));
        assert!(digest.contains("TCP Retransmissions: 3\n"));
        assert!(digest.contains("ICMP Type Counts:\n- Type 8: 12\n"));
        assert!(!digest.contains("truncated"));
    }

    #[test]
    fn scope_excludes_sections() {
        let snapshot = TelemetrySnapshot {
            connections: vec![conn([10, 0, 0, 1], 1000, IPPROTO_TCP)],
            icmp: vec![icmp(8)],
            stats: Some(stats()),
        };
        let scope = DigestScope {
            connections: false,
            icmp: true,
            stats: false,
        };

        let digest = summarize(&snapshot, scope);
        assert!(!digest.contains("=== TCP/UDP Connections ==="));
        assert!(digest.contains("=== ICMP Traffic ==="));
        assert!(!digest.contains("=== Performance Statistics ==="));
    }

    #[test]
    fn connection_details_stop_at_budget_gate() {
        let connections = (0..80)
            .map(|i| conn([10, 0, 1, i as u8], 2000, IPPROTO_UDP))
            .collect();
        let snapshot = TelemetrySnapshot {
            connections,
            ..Default::default()
        };

        let digest = summarize(&snapshot, DigestScope::ALL);
        let shown = digest.matches("Connection: ").count();
        assert!(shown > 0 && shown < 50, "shown {shown}");
        assert!(digest.contains(&format!(
            "... (showing first {shown} of 80 connections, truncated to save space)"
        )));
        assert!(digest.contains("- UDP Connections: 80\n"));
        assert!(digest.ends_with(TRUNCATION_MARKER));
        assert!(digest.len() <= MAX_DIGEST_LEN);
    }

    #[test]
    fn large_snapshot_stays_within_budget() {
        let connections: Vec<_> = (0..5000u32)
            .map(|i| {
                let b = i.to_be_bytes();
                conn([172, b[1], b[2], b[3]], (i % 60000) as u16, IPPROTO_TCP)
            })
            .chain((0..300).map(|i| conn([10, 9, 9, (i % 25) as u8], 1, IPPROTO_UDP)))
            .collect();
        let icmp = (0..1000).map(|i| icmp((i % 16) as u8)).collect();
        let snapshot = TelemetrySnapshot {
            connections,
            icmp,
            stats: Some(stats()),
        };

        let digest = summarize(&snapshot, DigestScope::ALL);
        assert!(digest.len() <= MAX_DIGEST_LEN);
        assert!(digest.ends_with(TRUNCATION_MARKER));
        // Tally still covers every record.
        assert!(digest.contains("- TCP Connections: 5000\n- UDP Connections: 300\n"));
        // 25 recurring sources, 12 each; only 20 are listed.
        assert!(digest.contains("... and 5 more IPs\n"));
    }

    #[test]
    fn finish_cuts_oversized_text() {
        let out = finish("x".repeat(MAX_DIGEST_LEN + 500), false);
        assert_eq!(out.len(), MAX_DIGEST_LEN - 100 + TRUNCATION_MARKER.len());
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn finish_respects_char_boundaries() {
        let out = finish("é".repeat(MAX_DIGEST_LEN), false);
        assert!(out.len() <= MAX_DIGEST_LEN);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn finish_marks_staged_truncation_near_the_limit() {
        let out = finish("y".repeat(MAX_DIGEST_LEN - 10), true);
        assert!(out.len() <= MAX_DIGEST_LEN);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn untruncated_output_has_no_marker() {
        let out = finish("short".to_string(), false);
        assert_eq!(out, "short");
    }
}
