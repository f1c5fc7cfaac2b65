//! Typed filter rules and their flat JSON wire form.

use std::fmt;
use std::net::Ipv4Addr;

use conntracker_common::{
    ACTION_ALLOW, ACTION_DROP, FILTER_MAP_SIZE, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, PROTO_ANY,
    RULE_TYPE_BASIC, RULE_TYPE_ICMP, RULE_TYPE_TCP, RULE_TYPE_UDP,
};
use serde::{Deserialize, Deserializer, Serialize};

/// Number of slots in the kernel enforcement table.
pub const RULE_CAPACITY: u32 = FILTER_MAP_SIZE;

// ── Match primitives ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrMatch {
    #[default]
    Any,
    Exact(Ipv4Addr),
}

impl AddrMatch {
    /// Kernel encoding: the address octets in header order, 0 for any.
    pub fn encode(self) -> u32 {
        match self {
            AddrMatch::Any => 0,
            AddrMatch::Exact(addr) => u32::from_ne_bytes(addr.octets()),
        }
    }
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrMatch::Any => f.write_str("any"),
            AddrMatch::Exact(addr) => fmt::Display::fmt(addr, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Any,
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn code(self) -> u8 {
        match self {
            Protocol::Any => PROTO_ANY,
            Protocol::Icmp => IPPROTO_ICMP,
            Protocol::Tcp => IPPROTO_TCP,
            Protocol::Udp => IPPROTO_UDP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Drop,
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Action::Allow => ACTION_ALLOW,
            Action::Drop => ACTION_DROP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Basic,
    Icmp,
    Tcp,
    Udp,
}

impl RuleType {
    pub fn code(self) -> u8 {
        match self {
            RuleType::Basic => RULE_TYPE_BASIC,
            RuleType::Icmp => RULE_TYPE_ICMP,
            RuleType::Tcp => RULE_TYPE_TCP,
            RuleType::Udp => RULE_TYPE_UDP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Basic => "basic",
            RuleType::Icmp => "icmp",
            RuleType::Tcp => "tcp",
            RuleType::Udp => "udp",
        }
    }

    /// The L4 protocol a typed rule implies, if any.
    pub fn implied_protocol(self) -> Option<Protocol> {
        match self {
            RuleType::Basic => None,
            RuleType::Icmp => Some(Protocol::Icmp),
            RuleType::Tcp => Some(Protocol::Tcp),
            RuleType::Udp => Some(Protocol::Udp),
        }
    }
}

/// Match on the packet embedded in an ICMP error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InnerMatch {
    pub src: AddrMatch,
    pub dst: AddrMatch,
    pub protocol: Protocol,
}

// ── Rules ────────────────────────────────────────────────────────────

/// Type-specific match criteria. Each variant only carries the fields the
/// kernel consults for that rule type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Basic,
    /// Packet matches when `tcp_flags & flags_mask == flags`; a zero mask
    /// ignores flags.
    Tcp { flags: u8, flags_mask: u8 },
    Udp,
    /// `None` matches any ICMP type or code.
    Icmp {
        icmp_type: Option<u8>,
        icmp_code: Option<u8>,
        inner: InnerMatch,
    },
}

impl RuleKind {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleKind::Basic => RuleType::Basic,
            RuleKind::Tcp { .. } => RuleType::Tcp,
            RuleKind::Udp => RuleType::Udp,
            RuleKind::Icmp { .. } => RuleType::Icmp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "RuleSpec")]
pub struct FilterRule {
    pub id: u32,
    pub src_ip: AddrMatch,
    pub dst_ip: AddrMatch,
    /// 0 matches any port.
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub action: Action,
    pub enabled: bool,
    pub comment: String,
    pub kind: RuleKind,
}

// ── Wire form ────────────────────────────────────────────────────────

/// Flat JSON representation accepted and returned by the HTTP API and
/// produced by the generation service. Enumerations are free-form strings
/// here; `codec::parse` validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    #[serde(deserialize_with = "null_as_default")]
    pub id: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub src_ip: String,
    #[serde(deserialize_with = "null_as_default")]
    pub dst_ip: String,
    #[serde(deserialize_with = "null_as_default")]
    pub src_port: u16,
    #[serde(deserialize_with = "null_as_default")]
    pub dst_port: u16,
    #[serde(deserialize_with = "null_as_default")]
    pub protocol: String,
    #[serde(deserialize_with = "null_as_default")]
    pub action: String,
    #[serde(deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub rule_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub comment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_flags: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_flags_mask: Option<u8>,
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub inner_src_ip: String,
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub inner_dst_ip: String,
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub inner_protocol: String,
}

/// JSON `null` reads as the field's default, the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl RuleSpec {
    /// Fill the defaults the API applies before validation: blank
    /// addresses become "any" and a blank protocol follows `rule_type`.
    pub fn normalized(mut self) -> Self {
        if self.src_ip.trim().is_empty() {
            self.src_ip = "any".to_string();
        }
        if self.dst_ip.trim().is_empty() {
            self.dst_ip = "any".to_string();
        }
        if self.protocol.trim().is_empty() {
            let protocol = match self.rule_type.trim().to_ascii_lowercase().as_str() {
                "tcp" => "tcp",
                "udp" => "udp",
                "icmp" => "icmp",
                _ => "any",
            };
            self.protocol = protocol.to_string();
        }
        self
    }
}

impl From<FilterRule> for RuleSpec {
    fn from(rule: FilterRule) -> Self {
        let mut spec = RuleSpec {
            id: rule.id,
            src_ip: rule.src_ip.to_string(),
            dst_ip: rule.dst_ip.to_string(),
            src_port: rule.src_port,
            dst_port: rule.dst_port,
            protocol: rule.protocol.as_str().to_string(),
            action: rule.action.as_str().to_string(),
            enabled: rule.enabled,
            rule_type: rule.kind.rule_type().as_str().to_string(),
            comment: rule.comment,
            ..Default::default()
        };
        match rule.kind {
            RuleKind::Tcp { flags, flags_mask } => {
                spec.tcp_flags = Some(flags);
                spec.tcp_flags_mask = Some(flags_mask);
            }
            RuleKind::Icmp {
                icmp_type,
                icmp_code,
                inner,
            } => {
                spec.icmp_type = icmp_type;
                spec.icmp_code = icmp_code;
                if inner.src != AddrMatch::Any {
                    spec.inner_src_ip = inner.src.to_string();
                }
                if inner.dst != AddrMatch::Any {
                    spec.inner_dst_ip = inner.dst.to_string();
                }
                if inner.protocol != Protocol::Any {
                    spec.inner_protocol = inner.protocol.as_str().to_string();
                }
            }
            RuleKind::Basic | RuleKind::Udp => {}
        }
        spec
    }
}
