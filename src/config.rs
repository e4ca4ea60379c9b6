use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser};

use crate::{
    cert::{CertConfig, CertMode},
    xray::builder::{BuildContext, FallbackConfig},
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xnode",
    about = "Keeps a proxy runtime in sync with a panel control-plane",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long = "api-host",
        env = "XNODE_API_HOST",
        value_name = "URL",
        default_value = "http://127.0.0.1:667"
    )]
    pub api_host: String,

    #[arg(
        long = "api-key",
        env = "XNODE_API_KEY",
        value_name = "KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub api_key: String,

    #[arg(
        long = "node-id",
        env = "XNODE_NODE_ID",
        value_name = "ID",
        default_value_t = 1
    )]
    pub node_id: u32,

    #[arg(
        long = "api-timeout-secs",
        env = "XNODE_API_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub api_timeout_secs: u64,

    #[arg(
        long = "update-interval-secs",
        env = "XNODE_UPDATE_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(5..=3600)
    )]
    pub update_interval_secs: u64,

    /// Local per-user device limit; `0` keeps the control-plane value.
    #[arg(
        long = "device-limit",
        env = "XNODE_DEVICE_LIMIT",
        value_name = "N",
        default_value_t = 0
    )]
    pub device_limit: u32,

    /// Local speed limit in Mbps for the node and every user; `0` keeps the control-plane value.
    #[arg(
        long = "speed-limit",
        env = "XNODE_SPEED_LIMIT",
        value_name = "MBPS",
        default_value_t = 0.0
    )]
    pub speed_limit: f64,

    #[arg(long = "rule-list-path", env = "XNODE_RULE_LIST_PATH", value_name = "PATH")]
    pub rule_list_path: Option<PathBuf>,

    #[arg(
        long = "disable-get-rule",
        env = "XNODE_DISABLE_GET_RULE",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub disable_get_rule: bool,

    #[arg(
        long = "disable-upload-traffic",
        env = "XNODE_DISABLE_UPLOAD_TRAFFIC",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub disable_upload_traffic: bool,

    #[arg(long = "listen-ip", env = "XNODE_LISTEN_IP", value_name = "IP")]
    pub listen_ip: Option<String>,

    #[arg(long = "send-ip", env = "XNODE_SEND_IP", value_name = "IP")]
    pub send_ip: Option<String>,

    #[arg(
        long = "enable-dns",
        env = "XNODE_ENABLE_DNS",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub enable_dns: bool,

    #[arg(
        long = "dns-strategy",
        env = "XNODE_DNS_STRATEGY",
        value_name = "STRATEGY",
        default_value = "UseIP"
    )]
    pub dns_strategy: String,

    #[arg(
        long = "runtime-api-addr",
        env = "XNODE_RUNTIME_API_ADDR",
        value_name = "ADDR",
        default_value = "127.0.0.1:10085"
    )]
    pub runtime_api_addr: SocketAddr,

    #[arg(
        long = "cert-mode",
        env = "XNODE_CERT_MODE",
        value_name = "MODE",
        default_value = "none",
        value_enum
    )]
    pub cert_mode: CertMode,

    #[arg(long = "cert-file", env = "XNODE_CERT_FILE", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    #[arg(long = "key-file", env = "XNODE_KEY_FILE", value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    #[arg(
        long = "cert-domain",
        env = "XNODE_CERT_DOMAIN",
        value_name = "DOMAIN",
        default_value = ""
    )]
    pub cert_domain: String,

    #[arg(
        long = "cert-dir",
        env = "XNODE_CERT_DIR",
        value_name = "PATH",
        default_value = "./cert"
    )]
    pub cert_dir: PathBuf,

    #[arg(
        long = "enable-fallback",
        env = "XNODE_ENABLE_FALLBACK",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub enable_fallback: bool,

    /// YAML list of `{sni, path, dest, proxy_protocol_ver}` entries.
    #[arg(long = "fallback-config", env = "XNODE_FALLBACK_CONFIG", value_name = "PATH")]
    pub fallback_config: Option<PathBuf>,
}

impl Config {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn cert_config(&self) -> CertConfig {
        CertConfig {
            mode: self.cert_mode,
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            domain: self.cert_domain.clone(),
            cert_dir: self.cert_dir.clone(),
        }
    }

    /// Collects everything the config translator needs. Reads the fallback file when
    /// fallbacks are enabled.
    pub fn build_context(&self) -> anyhow::Result<BuildContext> {
        let fallbacks = match (&self.fallback_config, self.enable_fallback) {
            (Some(path), true) => Some(load_fallbacks(path)?),
            (None, true) => Some(Vec::new()),
            (_, false) => None,
        };

        let domain_strategy = if self.enable_dns {
            self.dns_strategy.clone()
        } else {
            "AsIs".to_string()
        };

        Ok(BuildContext {
            listen_ip: self.listen_ip.clone().filter(|s| !s.is_empty()),
            send_ip: self.send_ip.clone().filter(|s| !s.is_empty()),
            domain_strategy,
            fallbacks,
            cert: self.cert_config(),
        })
    }
}

fn load_fallbacks(path: &std::path::Path) -> anyhow::Result<Vec<FallbackConfig>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read fallback config {}: {e}", path.display()))?;
    let fallbacks: Vec<FallbackConfig> = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parse fallback config {}: {e}", path.display()))?;
    Ok(fallbacks)
}
