//! Control-plane wire payloads and their translation into domain records.

use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        DetectResult, DetectionRule, NodeDescriptor, NodeStatus, NodeType, OnlineUser,
        RelayNodeDescriptor, TrafficSample, UserRecord, mbps_to_bytes_per_sec,
    },
    xray::builder::select_stream,
};

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub ret: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct PostData<T> {
    pub data: T,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeResponse {
    #[serde(default)]
    pub speedlimit: f64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub server: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub security: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headertype: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub relay_node_id: u32,
    #[serde(default)]
    pub listen_ip: String,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default = "default_true")]
    pub sniffing: bool,
    #[serde(default)]
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UserResponse {
    pub id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub passwd: String,
    #[serde(default)]
    pub speedlimit: f64,
    /// Device limit as configured on the control-plane.
    #[serde(default)]
    pub connector: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub ip_count: i64,
    #[serde(default)]
    pub limit_type: i64,
    #[serde(default)]
    pub relay: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RuleItem {
    pub id: i64,
    #[serde(default)]
    pub regex: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SystemLoad {
    pub uptime: String,
    pub load: String,
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
}

impl From<NodeStatus> for SystemLoad {
    fn from(s: NodeStatus) -> Self {
        let load = s.cpu / 100.0;
        Self {
            uptime: s.uptime.to_string(),
            load: format!("{load:.2} {load:.2} {load:.2}"),
            cpu: s.cpu,
            mem: s.mem,
            disk: s.disk,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OnlineUserItem {
    pub user_id: i64,
    pub ip: String,
}

impl From<OnlineUser> for OnlineUserItem {
    fn from(u: OnlineUser) -> Self {
        Self {
            user_id: u.uid,
            ip: u.ip,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UserTrafficItem {
    pub user_id: i64,
    pub u: i64,
    pub d: i64,
}

impl From<TrafficSample> for UserTrafficItem {
    fn from(t: TrafficSample) -> Self {
        Self {
            user_id: t.uid,
            u: t.upload,
            d: t.download,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct IllegalItem {
    pub list_id: i64,
    pub user_id: i64,
}

impl From<DetectResult> for IllegalItem {
    fn from(r: DetectResult) -> Self {
        Self {
            list_id: r.rule_id,
            user_id: r.uid,
        }
    }
}

impl From<RuleItem> for DetectionRule {
    fn from(r: RuleItem) -> Self {
        Self {
            id: r.id,
            pattern: r.regex,
        }
    }
}

/// Local overrides applied while parsing control-plane payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOverrides {
    pub node_id: u32,
    /// `0` keeps the reported device limit.
    pub device_limit: u32,
    /// Mbps; `0` keeps the reported speed limits.
    pub speed_limit: f64,
}

impl LocalOverrides {
    fn speed_limit(&self, reported_mbps: f64) -> u64 {
        if self.speed_limit > 0.0 {
            mbps_to_bytes_per_sec(self.speed_limit)
        } else {
            mbps_to_bytes_per_sec(reported_mbps)
        }
    }
}

fn descriptor_from(
    resp: &NodeResponse,
    node_id: u32,
    overrides: &LocalOverrides,
) -> Result<NodeDescriptor, String> {
    if resp.server.is_empty() {
        return Err("no server address in response".to_string());
    }
    let node_type = NodeType::parse(&resp.node_type);
    let stream = select_stream(
        &node_type,
        &resp.protocol,
        &resp.security,
        &resp.path,
        resp.port,
    )
    .map_err(|e| e.to_string())?;

    let header_type = match node_type {
        NodeType::Vmess | NodeType::Vless if !resp.headertype.is_empty() => {
            resp.headertype.clone()
        }
        _ => "none".to_string(),
    };

    Ok(NodeDescriptor {
        node_type,
        node_id,
        port: stream.port,
        speed_limit: overrides.speed_limit(resp.speedlimit),
        transport: stream.transport,
        enable_tls: stream.enable_tls,
        tls_type: stream.tls_type,
        host: resp.host.clone(),
        path: resp.path.clone(),
        service_name: stream.service_name,
        header_type,
        cipher_method: resp.method.clone(),
        allow_insecure: resp.allow_insecure,
        relay: resp.relay,
        relay_node_id: resp.relay_node_id,
        listen_ip: resp.listen_ip.clone(),
        proxy_protocol: resp.proxy_protocol,
        sniffing: resp.sniffing,
    })
}

pub(crate) fn parse_node(
    resp: &NodeResponse,
    overrides: &LocalOverrides,
) -> Result<NodeDescriptor, String> {
    descriptor_from(resp, overrides.node_id, overrides)
}

pub(crate) fn parse_relay_node(
    resp: &NodeResponse,
    overrides: &LocalOverrides,
) -> Result<RelayNodeDescriptor, String> {
    let node = descriptor_from(resp, resp.relay_node_id, overrides)?;
    Ok(RelayNodeDescriptor {
        node,
        address: resp.server.clone(),
    })
}

/// Applies device-limit rules. Users whose IP-count budget is already exhausted are left
/// out of the generation entirely.
pub(crate) fn parse_users(resp: Vec<UserResponse>, overrides: &LocalOverrides) -> Vec<UserRecord> {
    resp.into_iter()
        .filter_map(|u| {
            let mut device_limit = if overrides.device_limit > 0 {
                i64::from(overrides.device_limit)
            } else {
                u.connector
            };
            if u.limit_type == 1 && device_limit > 0 {
                let remaining = device_limit - u.ip_count;
                if remaining < 0 {
                    return None;
                }
                device_limit = remaining;
            }
            Some(UserRecord {
                uid: u.id,
                email: u.email,
                password: u.passwd,
                uuid: u.uuid,
                speed_limit: overrides.speed_limit(u.speedlimit),
                device_limit: u32::try_from(device_limit).unwrap_or(0),
                relay: u.relay,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn overrides() -> LocalOverrides {
        LocalOverrides {
            node_id: 7,
            ..Default::default()
        }
    }

    fn node_response(value: serde_json::Value) -> NodeResponse {
        serde_json::from_value(value).unwrap()
    }

    fn user_response(id: i64, connector: i64, ip_count: i64, limit_type: i64) -> UserResponse {
        serde_json::from_value(json!({
            "id": id,
            "email": format!("u{id}@example.com"),
            "passwd": "p",
            "uuid": "uuid",
            "speedlimit": 0,
            "connector": connector,
            "ip_count": ip_count,
            "limit_type": limit_type,
        }))
        .unwrap()
    }

    #[test]
    fn parses_vmess_node_with_legacy_type_name() {
        let resp = node_response(json!({
            "type": "V2ray",
            "server": "a.example.com",
            "port": 10086,
            "protocol": "ws",
            "security": "tls",
            "host": "a.example.com",
            "path": "/v",
            "headertype": "",
            "speedlimit": 8.0,
        }));
        let node = parse_node(&resp, &overrides()).unwrap();
        assert_eq!(node.node_type, NodeType::Vmess);
        assert_eq!(node.node_id, 7);
        assert_eq!(node.port, 10086);
        assert_eq!(node.transport, "ws");
        assert!(node.enable_tls);
        assert_eq!(node.header_type, "none");
        assert_eq!(node.speed_limit, 1_000_000);
        assert!(node.sniffing);
    }

    #[test]
    fn empty_server_is_rejected() {
        let resp = node_response(json!({ "type": "Trojan", "port": 443 }));
        assert!(parse_node(&resp, &overrides()).is_err());
    }

    #[test]
    fn local_speed_limit_overrides_reported() {
        let resp = node_response(json!({
            "type": "Trojan", "server": "s", "port": 443, "speedlimit": 100.0,
        }));
        let o = LocalOverrides {
            speed_limit: 1.0,
            ..overrides()
        };
        assert_eq!(parse_node(&resp, &o).unwrap().speed_limit, 125_000);

        let users = parse_users(vec![user_response(1, 0, 0, 0)], &o);
        assert_eq!(users[0].speed_limit, 125_000);
    }

    #[test]
    fn relay_node_keeps_server_address_and_relay_id() {
        let resp = node_response(json!({
            "type": "Vless", "server": "203.0.113.5", "port": 8443,
            "protocol": "grpc", "path": "svc", "security": "xtls", "relay_node_id": 12,
        }));
        let relay = parse_relay_node(&resp, &overrides()).unwrap();
        assert_eq!(relay.address, "203.0.113.5");
        assert_eq!(relay.node.node_id, 12);
        assert_eq!(relay.node.service_name, "svc");
        assert_eq!(relay.node.tls_type, "xtls");
    }

    #[test]
    fn device_limit_override_and_ip_count_budget() {
        let o = LocalOverrides {
            device_limit: 3,
            ..overrides()
        };
        let users = parse_users(
            vec![
                // Local limit replaces the reported one.
                user_response(1, 10, 0, 0),
                // Budget 3 - 1 online = 2 remaining.
                user_response(2, 10, 1, 1),
                // Budget exhausted: dropped for this generation.
                user_response(3, 10, 5, 1),
                // Exactly at budget stays with 0.
                user_response(4, 10, 3, 1),
            ],
            &o,
        );
        let limits: Vec<(i64, u32)> = users.iter().map(|u| (u.uid, u.device_limit)).collect();
        assert_eq!(limits, vec![(1, 3), (2, 2), (4, 0)]);
    }

    #[test]
    fn unlimited_users_skip_ip_budget() {
        let users = parse_users(vec![user_response(1, 0, 9, 1)], &overrides());
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].device_limit, 0);
    }

    #[test]
    fn status_report_body_shape() {
        let body = SystemLoad::from(NodeStatus {
            cpu: 50.0,
            mem: 20.0,
            disk: 10.0,
            uptime: 3600,
        });
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "uptime": "3600",
                "load": "0.50 0.50 0.50",
                "cpu": 50.0,
                "mem": 20.0,
                "disk": 10.0,
            })
        );
    }
}
