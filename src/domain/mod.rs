use std::fmt;

/// Rule id used for patterns loaded from the local rule file. The control-plane never
/// sees these ids.
pub const LOCAL_RULE_ID: i64 = -1;

/// Converts an upstream Mbps value into bytes per second.
///
/// The control-plane stores limits as float megabits; the runtime wants whole bytes.
/// The fraction is truncated, never rounded, so `0.0000079` Mbps yields `0`.
pub fn mbps_to_bytes_per_sec(mbps: f64) -> u64 {
    if mbps.is_nan() || mbps <= 0.0 {
        return 0;
    }
    (mbps * 1_000_000.0 / 8.0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeType {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    ShadowsocksPlugin,
    /// Redirecting companion listener of a `Shadowsocks-Plugin` node. Never sent by the
    /// control-plane.
    DokodemoDoor,
    Other(String),
}

impl NodeType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "V2ray" | "Vmess" => Self::Vmess,
            "Vless" => Self::Vless,
            "Trojan" => Self::Trojan,
            "Shadowsocks" => Self::Shadowsocks,
            "Shadowsocks-Plugin" => Self::ShadowsocksPlugin,
            "dokodemo-door" => Self::DokodemoDoor,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Vmess => "Vmess",
            Self::Vless => "Vless",
            Self::Trojan => "Trojan",
            Self::Shadowsocks => "Shadowsocks",
            Self::ShadowsocksPlugin => "Shadowsocks-Plugin",
            Self::DokodemoDoor => "dokodemo-door",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single listener configuration the agent keeps live.
///
/// Compared as a whole: any field difference between two fetches means the tag is torn
/// down and rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u32,
    /// Bytes per second, `0` for unlimited.
    pub speed_limit: u64,
    pub transport: String,
    pub enable_tls: bool,
    pub tls_type: String,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub header_type: String,
    pub cipher_method: String,
    pub allow_insecure: bool,
    pub relay: bool,
    pub relay_node_id: u32,
    pub listen_ip: String,
    pub proxy_protocol: bool,
    pub sniffing: bool,
}

/// Second-hop target that per-user relay egresses connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNodeDescriptor {
    pub node: NodeDescriptor,
    pub address: String,
}

/// One user as delivered by the control-plane, after local overrides were applied.
///
/// Equality and hashing are structural; the user diff relies on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserRecord {
    pub uid: i64,
    pub email: String,
    pub password: String,
    pub uuid: String,
    /// Bytes per second, `0` for unlimited.
    pub speed_limit: u64,
    pub device_limit: u32,
    pub relay: bool,
}

/// Stable key of one listener/egress/limiter triple in the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    pub fn for_node(node: &NodeDescriptor) -> Self {
        Self(format!("{}|{}|{}", node.node_type, node.port, node.node_id))
    }

    pub fn relay(uid: i64) -> Self {
        Self(format!("Relay_{uid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Runtime key of a user attached to this tag. Traffic counters use the same key.
    pub fn user_key(&self, user: &UserRecord) -> String {
        format!("{}|{}|{}", self.0, user.email, user.uid)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRule {
    pub id: i64,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSample {
    pub uid: i64,
    pub email: String,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub uid: i64,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectResult {
    pub uid: i64,
    pub rule_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeStatus {
    /// Percent, 0..=100.
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub uptime: u64,
}
