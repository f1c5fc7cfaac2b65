//! Translation between rules and the fixed 32-byte `filter_map` record.
//!
//! All validation happens in [`parse`]; [`encode`] works on an already
//! validated [`FilterRule`] and cannot fail. There is no decode: the
//! catalogue, not the kernel table, is the source of truth.

use std::net::IpAddr;

use conntracker_common::{FilterRuleRecord, ICMP_ANY};

use crate::error::ValidationError;
use crate::rule::{
    Action, AddrMatch, FilterRule, InnerMatch, Protocol, RuleKind, RuleSpec, RuleType,
};

/// Validate a wire rule into its typed form.
///
/// Fields that have no meaning for the declared `rule_type` (TCP flags on
/// an ICMP rule, ICMP type on a TCP rule, ...) are dropped.
pub fn parse(spec: &RuleSpec) -> Result<FilterRule, ValidationError> {
    let src_ip = parse_addr("src_ip", &spec.src_ip)?;
    let dst_ip = parse_addr("dst_ip", &spec.dst_ip)?;
    let protocol = parse_protocol("protocol", &spec.protocol)?;
    let action = parse_action(&spec.action)?;
    let rule_type = parse_rule_type(&spec.rule_type)?;

    if let Some(implied) = rule_type.implied_protocol()
        && protocol != Protocol::Any
        && protocol != implied
    {
        return Err(ValidationError::new(
            "protocol",
            &spec.protocol,
            "conflicts with rule_type",
        ));
    }

    let kind = match rule_type {
        RuleType::Basic => RuleKind::Basic,
        RuleType::Udp => RuleKind::Udp,
        RuleType::Tcp => RuleKind::Tcp {
            flags: spec.tcp_flags.unwrap_or(0),
            flags_mask: spec.tcp_flags_mask.unwrap_or(0),
        },
        RuleType::Icmp => RuleKind::Icmp {
            icmp_type: spec.icmp_type.filter(|&t| t != ICMP_ANY),
            icmp_code: spec.icmp_code.filter(|&c| c != ICMP_ANY),
            inner: InnerMatch {
                src: parse_addr("inner_src_ip", &spec.inner_src_ip)?,
                dst: parse_addr("inner_dst_ip", &spec.inner_dst_ip)?,
                protocol: parse_protocol("inner_protocol", &spec.inner_protocol)?,
            },
        },
    };

    Ok(FilterRule {
        id: spec.id,
        src_ip,
        dst_ip,
        src_port: spec.src_port,
        dst_port: spec.dst_port,
        protocol,
        action,
        enabled: spec.enabled,
        comment: spec.comment.clone(),
        kind,
    })
}

/// Build the kernel record for a validated rule.
pub fn encode(rule: &FilterRule) -> FilterRuleRecord {
    let mut record = FilterRuleRecord {
        src_ip: rule.src_ip.encode(),
        dst_ip: rule.dst_ip.encode(),
        src_port: rule.src_port,
        dst_port: rule.dst_port,
        protocol: rule.protocol.code(),
        action: rule.action.code(),
        enabled: u8::from(rule.enabled),
        rule_type: rule.kind.rule_type().code(),
        icmp_type: ICMP_ANY,
        icmp_code: ICMP_ANY,
        ..Default::default()
    };

    match rule.kind {
        RuleKind::Tcp { flags, flags_mask } => {
            record.tcp_flags = flags;
            record.tcp_flags_mask = flags_mask;
        }
        RuleKind::Icmp {
            icmp_type,
            icmp_code,
            inner,
        } => {
            record.icmp_type = icmp_type.unwrap_or(ICMP_ANY);
            record.icmp_code = icmp_code.unwrap_or(ICMP_ANY);
            record.inner_src_ip = inner.src.encode();
            record.inner_dst_ip = inner.dst.encode();
            record.inner_protocol = inner.protocol.code();
        }
        RuleKind::Basic | RuleKind::Udp => {}
    }

    record
}

/// Validate and encode in one step.
pub fn encode_spec(spec: &RuleSpec) -> Result<FilterRuleRecord, ValidationError> {
    parse(spec).map(|rule| encode(&rule))
}

/// The record written over a slot when its rule is removed.
pub fn tombstone() -> FilterRuleRecord {
    FilterRuleRecord::default()
}

fn parse_addr(field: &'static str, raw: &str) -> Result<AddrMatch, ValidationError> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("any") {
        return Ok(AddrMatch::Any);
    }
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(AddrMatch::Exact(addr)),
        Ok(IpAddr::V6(_)) => Err(ValidationError::new(
            field,
            raw,
            "IPv6 addresses are not supported",
        )),
        Err(_) => Err(ValidationError::new(field, raw, "not a valid IPv4 address")),
    }
}

fn parse_protocol(field: &'static str, raw: &str) -> Result<Protocol, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "any" => Ok(Protocol::Any),
        "icmp" => Ok(Protocol::Icmp),
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(ValidationError::new(
            field,
            raw,
            "expected one of tcp, udp, icmp, any",
        )),
    }
}

fn parse_action(raw: &str) -> Result<Action, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "allow" => Ok(Action::Allow),
        "drop" => Ok(Action::Drop),
        _ => Err(ValidationError::new(
            "action",
            raw,
            "expected allow or drop",
        )),
    }
}

fn parse_rule_type(raw: &str) -> Result<RuleType, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "any" | "basic" => Ok(RuleType::Basic),
        "icmp" => Ok(RuleType::Icmp),
        "tcp" => Ok(RuleType::Tcp),
        "udp" => Ok(RuleType::Udp),
        _ => Err(ValidationError::new(
            "rule_type",
            raw,
            "expected one of basic, tcp, udp, icmp",
        )),
    }
}
