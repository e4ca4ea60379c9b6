//! Runtime-native listener and egress documents.
//!
//! Field names follow the runtime's JSON config schema, so these serialize straight into
//! the `config_json` payload of the control service.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: serde_json::Value,
    pub stream_settings: StreamSettings,
    pub sniffing: Sniffing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_through: Option<String>,
    pub settings: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

impl Sniffing {
    pub fn http_tls(enabled: bool) -> Self {
        Self {
            enabled,
            dest_override: vec!["http".to_string(), "tls".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xtls_settings: Option<TlsSettings>,
}

impl StreamSettings {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            security: "none".to_string(),
            tcp_settings: None,
            ws_settings: None,
            http_settings: None,
            grpc_settings: None,
            tls_settings: None,
            xtls_settings: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpSettings {
    pub accept_proxy_protocol: bool,
    pub header: TcpHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSettings {
    pub accept_proxy_protocol: bool,
    pub path: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpSettings {
    pub host: Vec<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_insecure: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<Certificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate_file: String,
    pub key_file: String,
    pub ocsp_stapling: u64,
}

/// One user as attached to an inbound. `account` is the protocol-specific account object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserConfig {
    pub email: String,
    pub level: u32,
    pub account: serde_json::Value,
}
