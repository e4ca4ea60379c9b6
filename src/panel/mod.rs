use std::time::Duration;

use reqwest::Method;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    domain::{
        DetectResult, DetectionRule, NodeDescriptor, NodeStatus, OnlineUser, RelayNodeDescriptor,
        TrafficSample, UserRecord,
    },
    xray::BoxFuture,
};

mod model;

pub use model::LocalOverrides;
use model::{
    Envelope, IllegalItem, NodeResponse, OnlineUserItem, PostData, RuleItem, SystemLoad,
    UserResponse, UserTrafficItem,
};

#[derive(Debug)]
pub enum PanelError {
    /// The request never produced a response: connect failure, timeout, broken body.
    Transport(reqwest::Error),
    /// The control-plane answered, but not with a usable payload.
    Protocol { path: String, reason: String },
}

impl std::fmt::Display for PanelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "control-plane transport error: {err}"),
            Self::Protocol { path, reason } => {
                write!(f, "control-plane protocol error on {path}: {reason}")
            }
        }
    }
}

impl std::error::Error for PanelError {}

impl From<reqwest::Error> for PanelError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

fn protocol_error(path: &str, reason: impl Into<String>) -> PanelError {
    PanelError::Protocol {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Desired state source and telemetry sink.
pub trait ControlPlane: Send + Sync {
    fn fetch_node(&self) -> BoxFuture<'_, Result<NodeDescriptor, PanelError>>;

    fn fetch_relay_node(&self) -> BoxFuture<'_, Result<RelayNodeDescriptor, PanelError>>;

    fn fetch_users(&self) -> BoxFuture<'_, Result<Vec<UserRecord>, PanelError>>;

    /// Control-plane detection rules only; locally sourced rules are merged by the caller.
    fn fetch_rules(&self) -> BoxFuture<'_, Result<Vec<DetectionRule>, PanelError>>;

    fn report_status(&self, status: NodeStatus) -> BoxFuture<'_, Result<(), PanelError>>;

    fn report_online_users(
        &self,
        users: Vec<OnlineUser>,
    ) -> BoxFuture<'_, Result<(), PanelError>>;

    fn report_traffic(&self, traffic: Vec<TrafficSample>)
    -> BoxFuture<'_, Result<(), PanelError>>;

    fn report_violations(
        &self,
        results: Vec<DetectResult>,
    ) -> BoxFuture<'_, Result<(), PanelError>>;
}

#[derive(Debug, Clone)]
pub struct PanelOptions {
    pub api_host: String,
    pub api_key: String,
    pub timeout: Duration,
    pub overrides: LocalOverrides,
}

/// HTTP client of the control-plane API.
///
/// Every request carries `key` as a query parameter; user-scoped requests also carry
/// `node_id`. Responses use the `{ret, data}` envelope where `ret == 1` means success.
#[derive(Debug, Clone)]
pub struct PanelClient {
    base: String,
    api_key: String,
    overrides: LocalOverrides,
    client: reqwest::Client,
}

impl PanelClient {
    pub fn new(options: PanelOptions) -> Result<Self, PanelError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("xnode/", env!("CARGO_PKG_VERSION")))
            .timeout(options.timeout)
            .build()?;
        Ok(Self {
            base: options.api_host.trim_end_matches('/').to_string(),
            api_key: options.api_key,
            overrides: options.overrides,
            client,
        })
    }

    fn node_id(&self) -> u32 {
        self.overrides.node_id
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        node_scoped: bool,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope, PanelError> {
        let url = format!("{}{path}", self.base);
        let mut req = self
            .client
            .request(method, url)
            .query(&[("key", self.api_key.as_str())]);
        if node_scoped {
            req = req.query(&[("node_id", self.node_id())]);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if status.as_u16() >= 400 {
            return Err(protocol_error(
                path,
                format!("status {}: {}", status.as_u16(), String::from_utf8_lossy(&bytes)),
            ));
        }

        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| protocol_error(path, format!("decode envelope: {e}")))?;
        if envelope.ret != 1 {
            return Err(protocol_error(path, format!("ret {} invalid", envelope.ret)));
        }
        Ok(envelope)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, node_scoped: bool) -> Result<T, PanelError> {
        let envelope = self.call(Method::GET, path, node_scoped, None).await?;
        serde_json::from_value(envelope.data)
            .map_err(|e| protocol_error(path, format!("decode data: {e}")))
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        node_scoped: bool,
        body: &B,
    ) -> Result<(), PanelError> {
        let body = serde_json::to_value(body)
            .map_err(|e| protocol_error(path, format!("encode body: {e}")))?;
        self.call(Method::POST, path, node_scoped, Some(body))
            .await
            .map(|_| ())
    }
}

impl ControlPlane for PanelClient {
    fn fetch_node(&self) -> BoxFuture<'_, Result<NodeDescriptor, PanelError>> {
        Box::pin(async move {
            let path = format!("/server/{}/info", self.node_id());
            let resp: NodeResponse = self.get(&path, false).await?;
            model::parse_node(&resp, &self.overrides).map_err(|reason| protocol_error(&path, reason))
        })
    }

    fn fetch_relay_node(&self) -> BoxFuture<'_, Result<RelayNodeDescriptor, PanelError>> {
        Box::pin(async move {
            let path = format!("/server/relay/{}/info", self.node_id());
            let resp: NodeResponse = self.get(&path, false).await?;
            model::parse_relay_node(&resp, &self.overrides)
                .map_err(|reason| protocol_error(&path, reason))
        })
    }

    fn fetch_users(&self) -> BoxFuture<'_, Result<Vec<UserRecord>, PanelError>> {
        Box::pin(async move {
            let resp: Vec<UserResponse> = self.get("/users", true).await?;
            Ok(model::parse_users(resp, &self.overrides))
        })
    }

    fn fetch_rules(&self) -> BoxFuture<'_, Result<Vec<DetectionRule>, PanelError>> {
        Box::pin(async move {
            let resp: Vec<RuleItem> = self.get("/rules/detect_rules", false).await?;
            Ok(resp.into_iter().map(DetectionRule::from).collect())
        })
    }

    fn report_status(&self, status: NodeStatus) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            let path = format!("/server/{}/info", self.node_id());
            self.post(&path, false, &SystemLoad::from(status)).await
        })
    }

    fn report_online_users(
        &self,
        users: Vec<OnlineUser>,
    ) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            let data: Vec<OnlineUserItem> = users.into_iter().map(Into::into).collect();
            self.post("/users/aliveip", true, &PostData { data }).await
        })
    }

    fn report_traffic(
        &self,
        traffic: Vec<TrafficSample>,
    ) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            let data: Vec<UserTrafficItem> = traffic.into_iter().map(Into::into).collect();
            self.post("/users/traffic", true, &PostData { data }).await
        })
    }

    fn report_violations(
        &self,
        results: Vec<DetectResult>,
    ) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            let data: Vec<IllegalItem> = results.into_iter().map(Into::into).collect();
            self.post("/users/detectlog", true, &PostData { data }).await
        })
    }
}
