use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;

use crate::{
    cert::{CertConfig, CertError},
    domain::{NodeDescriptor, NodeType, RelayNodeDescriptor, Tag, UserRecord},
    xray::{
        conf::{
            Certificate, GrpcSettings, HttpSettings, InboundConfig, OutboundConfig, Sniffing,
            StreamSettings, TcpHeader, TcpSettings, TlsSettings, WsSettings,
        },
        users,
    },
};

const OCSP_STAPLING_SECS: u64 = 3600;
const DEFAULT_LISTEN: &str = "0.0.0.0";

/// Local settings the translator needs next to the node descriptor.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub listen_ip: Option<String>,
    pub send_ip: Option<String>,
    pub domain_strategy: String,
    /// `None` when fallbacks are disabled.
    pub fallbacks: Option<Vec<FallbackConfig>>,
    pub cert: CertConfig,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            listen_ip: None,
            send_ip: None,
            domain_strategy: "AsIs".to_string(),
            fallbacks: None,
            cert: CertConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub proxy_protocol_ver: u64,
}

#[derive(Debug)]
pub enum TranslationError {
    InvalidPort { port: u32 },
    UnsupportedNodeType { node_type: String },
    UnsupportedTransport { transport: String },
    MissingFallbacks { reason: &'static str },
    MissingRelayAddress,
    Certificate(CertError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for TranslationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPort { port } => write!(f, "invalid port: {port}"),
            Self::UnsupportedNodeType { node_type } => write!(
                f,
                "unsupported node type: {node_type} (supported: Vmess, Vless, Trojan, Shadowsocks, Shadowsocks-Plugin)"
            ),
            Self::UnsupportedTransport { transport } => {
                write!(f, "unsupported transport: {transport}")
            }
            Self::MissingFallbacks { reason } => write!(f, "invalid fallbacks: {reason}"),
            Self::MissingRelayAddress => write!(f, "relay node has no address"),
            Self::Certificate(err) => write!(f, "certificate: {err}"),
            Self::Encode(err) => write!(f, "encode config: {err}"),
        }
    }
}

impl std::error::Error for TranslationError {}

impl From<CertError> for TranslationError {
    fn from(value: CertError) -> Self {
        Self::Certificate(value)
    }
}

impl From<serde_json::Error> for TranslationError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}

/// Transport and TLS selection derived from a control-plane node payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChoice {
    pub transport: String,
    pub enable_tls: bool,
    pub tls_type: String,
    pub service_name: String,
    pub port: u32,
}

/// Picks transport and TLS for a node the way each protocol family advertises them.
///
/// `protocol` and `security` are the raw control-plane fields. A `Shadowsocks-Plugin`
/// node listens one port below the advertised one; the advertised port belongs to the
/// companion redirect listener.
pub fn select_stream(
    node_type: &NodeType,
    protocol: &str,
    security: &str,
    path: &str,
    port: u32,
) -> Result<StreamChoice, TranslationError> {
    let mut choice = StreamChoice {
        transport: "tcp".to_string(),
        enable_tls: false,
        tls_type: "none".to_string(),
        service_name: String::new(),
        port,
    };

    let tls_or_xtls = matches!(security, "tls" | "xtls");
    match node_type {
        NodeType::Trojan => {
            match protocol {
                "grpc" => {
                    choice.transport = "grpc".to_string();
                    choice.service_name = path.to_string();
                }
                "ws" => choice.transport = "ws".to_string(),
                _ => {}
            }
            choice.enable_tls = tls_or_xtls;
        }
        NodeType::Vmess | NodeType::Vless => {
            if !protocol.is_empty() {
                choice.transport = protocol.to_string();
            }
            if protocol == "grpc" {
                choice.service_name = path.to_string();
            }
            choice.enable_tls = match node_type {
                NodeType::Vless => tls_or_xtls,
                _ => security == "tls",
            };
        }
        NodeType::Shadowsocks => {}
        NodeType::ShadowsocksPlugin => {
            if !protocol.is_empty() {
                choice.transport = protocol.to_string();
            }
            choice.enable_tls = security == "tls";
            if port <= 1 {
                return Err(TranslationError::InvalidPort { port });
            }
            choice.port = port - 1;
        }
        NodeType::DokodemoDoor | NodeType::Other(_) => {
            return Err(TranslationError::UnsupportedNodeType {
                node_type: node_type.to_string(),
            });
        }
    }

    if choice.enable_tls {
        choice.tls_type = security.to_string();
    }
    Ok(choice)
}

fn checked_port(port: u32) -> Result<u16, TranslationError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(TranslationError::InvalidPort { port }),
    }
}

pub fn build_inbound(
    ctx: &BuildContext,
    node: &NodeDescriptor,
) -> Result<InboundConfig, TranslationError> {
    let port = checked_port(node.port)?;

    let listen = ctx
        .listen_ip
        .clone()
        .or_else(|| Some(node.listen_ip.clone()).filter(|ip| !ip.is_empty()))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    let (protocol, settings) = match &node.node_type {
        NodeType::Vless => {
            let mut settings = json!({ "clients": [], "decryption": "none" });
            if let Some(fallbacks) = fallbacks_json(ctx)? {
                settings["fallbacks"] = fallbacks;
            }
            ("vless", settings)
        }
        NodeType::Vmess => ("vmess", json!({ "clients": [] })),
        NodeType::Trojan => {
            let mut settings = json!({ "clients": [] });
            if let Some(fallbacks) = fallbacks_json(ctx)? {
                settings["fallbacks"] = fallbacks;
            }
            ("trojan", settings)
        }
        NodeType::Shadowsocks | NodeType::ShadowsocksPlugin => (
            "shadowsocks",
            // The runtime refuses a multi-user shadowsocks listener without clients.
            json!({
                "clients": [{
                    "method": node.cipher_method,
                    "password": uuid::Uuid::new_v4().to_string(),
                }],
                "network": "tcp,udp",
            }),
        ),
        NodeType::DokodemoDoor => (
            "dokodemo-door",
            json!({
                "address": "v1.mux.cool",
                "followRedirect": false,
                "network": "tcp,udp",
            }),
        ),
        NodeType::Other(raw) => {
            return Err(TranslationError::UnsupportedNodeType {
                node_type: raw.clone(),
            });
        }
    };

    let mut stream = transport_settings(node)?;
    if node.enable_tls && ctx.cert.is_enabled() {
        let paths = ctx.cert.resolve()?;
        let tls = TlsSettings {
            certificates: vec![Certificate {
                certificate_file: paths.cert_file.display().to_string(),
                key_file: paths.key_file.display().to_string(),
                ocsp_stapling: OCSP_STAPLING_SECS,
            }],
            ..Default::default()
        };
        if node.tls_type == "xtls" {
            stream.security = "xtls".to_string();
            stream.xtls_settings = Some(tls);
        } else {
            stream.security = "tls".to_string();
            stream.tls_settings = Some(tls);
        }
    }

    Ok(InboundConfig {
        tag: Tag::for_node(node).to_string(),
        listen,
        port,
        protocol: protocol.to_string(),
        settings,
        stream_settings: stream,
        sniffing: Sniffing::http_tls(node.sniffing),
    })
}

fn fallbacks_json(ctx: &BuildContext) -> Result<Option<serde_json::Value>, TranslationError> {
    let Some(fallbacks) = &ctx.fallbacks else {
        return Ok(None);
    };
    if fallbacks.is_empty() {
        return Err(TranslationError::MissingFallbacks {
            reason: "fallbacks enabled but none configured",
        });
    }
    let mut out = Vec::with_capacity(fallbacks.len());
    for fb in fallbacks {
        if fb.dest.is_empty() {
            return Err(TranslationError::MissingFallbacks {
                reason: "fallback dest is required",
            });
        }
        out.push(json!({
            "name": fb.sni,
            "path": fb.path,
            "dest": fb.dest,
            "xver": fb.proxy_protocol_ver,
        }));
    }
    Ok(Some(serde_json::Value::Array(out)))
}

fn transport_settings(node: &NodeDescriptor) -> Result<StreamSettings, TranslationError> {
    let transport = if node.transport.is_empty() {
        "tcp"
    } else {
        node.transport.as_str()
    };

    let stream = match transport {
        "tcp" => {
            let mut stream = StreamSettings::new("tcp");
            stream.tcp_settings = Some(TcpSettings {
                accept_proxy_protocol: node.proxy_protocol,
                header: TcpHeader {
                    kind: if node.header_type.is_empty() {
                        "none".to_string()
                    } else {
                        node.header_type.clone()
                    },
                },
            });
            stream
        }
        "ws" => {
            let mut stream = StreamSettings::new("ws");
            stream.ws_settings = Some(WsSettings {
                accept_proxy_protocol: node.proxy_protocol,
                path: node.path.clone(),
                headers: BTreeMap::from([("Host".to_string(), node.host.clone())]),
            });
            stream
        }
        "h2" | "http" => {
            let mut stream = StreamSettings::new("http");
            stream.http_settings = Some(HttpSettings {
                host: vec![node.host.clone()],
                path: node.path.clone(),
            });
            stream
        }
        "grpc" => {
            let mut stream = StreamSettings::new("grpc");
            stream.grpc_settings = Some(GrpcSettings {
                service_name: node.service_name.clone(),
            });
            stream
        }
        other => {
            return Err(TranslationError::UnsupportedTransport {
                transport: other.to_string(),
            });
        }
    };
    Ok(stream)
}

pub fn build_outbound(
    ctx: &BuildContext,
    node: &NodeDescriptor,
) -> Result<OutboundConfig, TranslationError> {
    let mut settings = json!({ "domainStrategy": ctx.domain_strategy });
    if node.node_type == NodeType::DokodemoDoor {
        let port = checked_port(node.port)?;
        if port <= 1 {
            return Err(TranslationError::InvalidPort { port: node.port });
        }
        settings["redirect"] = json!(format!("127.0.0.1:{}", port - 1));
    }

    Ok(OutboundConfig {
        tag: Tag::for_node(node).to_string(),
        protocol: "freedom".to_string(),
        send_through: ctx.send_ip.clone(),
        settings,
        stream_settings: None,
    })
}

/// Egress carrying one user's traffic to the relay node, authenticated as that user.
pub fn build_relay_outbound(
    ctx: &BuildContext,
    relay: &RelayNodeDescriptor,
    user: &UserRecord,
) -> Result<OutboundConfig, TranslationError> {
    if relay.address.is_empty() {
        return Err(TranslationError::MissingRelayAddress);
    }
    let node = &relay.node;
    // A plugin node's descriptor carries its plain shadowsocks port; the node's transport
    // and TLS are served by the companion one port above.
    let port = match node.node_type {
        NodeType::ShadowsocksPlugin => checked_port(node.port.saturating_add(1))?,
        _ => checked_port(node.port)?,
    };
    let address = relay.address.as_str();

    let (protocol, settings) = match &node.node_type {
        NodeType::Vmess => (
            "vmess",
            json!({
                "vnext": [{
                    "address": address,
                    "port": port,
                    "users": [{ "id": user.uuid, "alterId": 0, "security": "auto" }],
                }],
            }),
        ),
        NodeType::Vless => (
            "vless",
            json!({
                "vnext": [{
                    "address": address,
                    "port": port,
                    "users": [{ "id": user.uuid, "encryption": "none", "flow": users::vless_flow(node) }],
                }],
            }),
        ),
        NodeType::Trojan => (
            "trojan",
            json!({
                "servers": [{ "address": address, "port": port, "password": user.uuid }],
            }),
        ),
        NodeType::Shadowsocks | NodeType::ShadowsocksPlugin => (
            "shadowsocks",
            json!({
                "servers": [{
                    "address": address,
                    "port": port,
                    "method": node.cipher_method,
                    "password": users::shadowsocks_password(&node.cipher_method, user),
                }],
            }),
        ),
        other => {
            return Err(TranslationError::UnsupportedNodeType {
                node_type: other.to_string(),
            });
        }
    };

    let mut stream = transport_settings(node)?;
    if node.enable_tls {
        let tls = TlsSettings {
            server_name: node.host.clone(),
            allow_insecure: node.allow_insecure,
            certificates: Vec::new(),
        };
        if node.tls_type == "xtls" {
            stream.security = "xtls".to_string();
            stream.xtls_settings = Some(tls);
        } else {
            stream.security = "tls".to_string();
            stream.tls_settings = Some(tls);
        }
    }

    Ok(OutboundConfig {
        tag: Tag::relay(user.uid).to_string(),
        protocol: protocol.to_string(),
        send_through: ctx.send_ip.clone(),
        settings,
        stream_settings: Some(stream),
    })
}
