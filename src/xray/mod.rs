use std::{future::Future, net::SocketAddr, pin::Pin};

use tonic::transport::{Channel, Endpoint};

use crate::{
    domain::{DetectResult, DetectionRule, OnlineUser},
    xray::{
        conf::{InboundConfig, OutboundConfig, UserConfig},
        proto::agent::runtime::{self as pb, runtime_control_client::RuntimeControlClient},
    },
};

pub mod builder;
pub mod conf;
pub mod proto;
pub mod users;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug)]
pub enum RuntimeError {
    Transport(tonic::transport::Error),
    Status(tonic::Status),
    Encode(serde_json::Error),
}

impl RuntimeError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Status(status) if is_already_exists(status))
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "runtime transport error: {err}"),
            Self::Status(status) => write!(
                f,
                "runtime call failed: {:?}: {}",
                status.code(),
                status.message()
            ),
            Self::Encode(err) => write!(f, "encode runtime config: {err}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<tonic::transport::Error> for RuntimeError {
    fn from(value: tonic::transport::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<tonic::Status> for RuntimeError {
    fn from(value: tonic::Status) -> Self {
        Self::Status(value)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}

/// Per-user entry of an inbound limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLimit {
    pub email: String,
    pub uid: i64,
    /// Bytes per second, `0` for unlimited.
    pub speed_limit: u64,
    pub device_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Traffic {
    pub upload: i64,
    pub download: i64,
}

/// Incremental control surface of a running proxy runtime.
///
/// Removals succeed when the object is already gone. Adding users that already exist
/// succeeds too. Adding a listener or egress whose tag is taken is an error; callers
/// check [`RuntimeError::is_already_exists`] when they need to recover from it.
pub trait Runtime: Send + Sync {
    fn add_inbound(
        &self,
        tag: String,
        config: InboundConfig,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn remove_inbound(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn add_outbound(
        &self,
        tag: String,
        config: OutboundConfig,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn remove_outbound(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn add_users(
        &self,
        tag: String,
        users: Vec<UserConfig>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn remove_users(
        &self,
        tag: String,
        emails: Vec<String>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn add_limiter(
        &self,
        tag: String,
        speed_limit: u64,
        users: Vec<UserLimit>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn update_limiter(
        &self,
        tag: String,
        users: Vec<UserLimit>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn delete_limiter(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn update_rules(
        &self,
        tag: String,
        rules: Vec<DetectionRule>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn get_traffic(&self, key: String, reset: bool)
    -> BoxFuture<'_, Result<Traffic, RuntimeError>>;

    fn online_users(&self, tag: String) -> BoxFuture<'_, Result<Vec<OnlineUser>, RuntimeError>>;

    fn rule_matches(&self, tag: String)
    -> BoxFuture<'_, Result<Vec<DetectResult>, RuntimeError>>;
}

/// gRPC client of the runtime control service.
///
/// The channel connects lazily, so building one never fails on an unreachable runtime;
/// the first call does.
#[derive(Debug, Clone)]
pub struct GrpcRuntime {
    client: RuntimeControlClient<Channel>,
}

impl GrpcRuntime {
    pub fn connect_lazy(addr: SocketAddr) -> Result<Self, RuntimeError> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))?;
        let channel = endpoint.connect_lazy();
        Ok(Self {
            client: RuntimeControlClient::new(channel),
        })
    }

    fn client(&self) -> RuntimeControlClient<Channel> {
        self.client.clone()
    }
}

fn ignore_not_found(
    res: Result<tonic::Response<pb::Ack>, tonic::Status>,
) -> Result<(), RuntimeError> {
    match res {
        Ok(_) => Ok(()),
        Err(status) if is_not_found(&status) => Ok(()),
        Err(status) => Err(status.into()),
    }
}

fn user_limits_to_pb(users: Vec<UserLimit>) -> Vec<pb::UserLimit> {
    users
        .into_iter()
        .map(|u| pb::UserLimit {
            email: u.email,
            uid: u.uid,
            speed_limit: u.speed_limit,
            device_limit: u.device_limit,
        })
        .collect()
}

impl Runtime for GrpcRuntime {
    fn add_inbound(
        &self,
        tag: String,
        config: InboundConfig,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            let config_json = serde_json::to_vec(&config)?;
            self.client()
                .add_inbound(pb::AddInboundRequest { tag, config_json })
                .await?;
            Ok(())
        })
    }

    fn remove_inbound(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            ignore_not_found(self.client().remove_inbound(pb::TagRequest { tag }).await)
        })
    }

    fn add_outbound(
        &self,
        tag: String,
        config: OutboundConfig,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            let config_json = serde_json::to_vec(&config)?;
            self.client()
                .add_outbound(pb::AddOutboundRequest { tag, config_json })
                .await?;
            Ok(())
        })
    }

    fn remove_outbound(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            ignore_not_found(self.client().remove_outbound(pb::TagRequest { tag }).await)
        })
    }

    fn add_users(
        &self,
        tag: String,
        users: Vec<UserConfig>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            let mut pb_users = Vec::with_capacity(users.len());
            for user in users {
                pb_users.push(pb::User {
                    email: user.email,
                    level: user.level,
                    account_json: serde_json::to_vec(&user.account)?,
                });
            }
            match self
                .client()
                .add_users(pb::AddUsersRequest {
                    tag,
                    users: pb_users,
                })
                .await
            {
                Ok(_) => Ok(()),
                Err(status) if is_already_exists(&status) => Ok(()),
                Err(status) => Err(status.into()),
            }
        })
    }

    fn remove_users(
        &self,
        tag: String,
        emails: Vec<String>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            ignore_not_found(
                self.client()
                    .remove_users(pb::RemoveUsersRequest { tag, emails })
                    .await,
            )
        })
    }

    fn add_limiter(
        &self,
        tag: String,
        speed_limit: u64,
        users: Vec<UserLimit>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.client()
                .add_limiter(pb::AddLimiterRequest {
                    tag,
                    speed_limit,
                    users: user_limits_to_pb(users),
                })
                .await?;
            Ok(())
        })
    }

    fn update_limiter(
        &self,
        tag: String,
        users: Vec<UserLimit>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.client()
                .update_limiter(pb::UpdateLimiterRequest {
                    tag,
                    users: user_limits_to_pb(users),
                })
                .await?;
            Ok(())
        })
    }

    fn delete_limiter(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            ignore_not_found(self.client().delete_limiter(pb::TagRequest { tag }).await)
        })
    }

    fn update_rules(
        &self,
        tag: String,
        rules: Vec<DetectionRule>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            let rules = rules
                .into_iter()
                .map(|r| pb::Rule {
                    id: r.id,
                    pattern: r.pattern,
                })
                .collect();
            self.client()
                .update_rules(pb::UpdateRulesRequest { tag, rules })
                .await?;
            Ok(())
        })
    }

    fn get_traffic(
        &self,
        key: String,
        reset: bool,
    ) -> BoxFuture<'_, Result<Traffic, RuntimeError>> {
        Box::pin(async move {
            let resp = self
                .client()
                .get_traffic(pb::GetTrafficRequest { key, reset })
                .await?
                .into_inner();
            Ok(Traffic {
                upload: resp.upload,
                download: resp.download,
            })
        })
    }

    fn online_users(&self, tag: String) -> BoxFuture<'_, Result<Vec<OnlineUser>, RuntimeError>> {
        Box::pin(async move {
            let resp = self
                .client()
                .get_online_ips(pb::TagRequest { tag })
                .await?
                .into_inner();
            Ok(resp
                .entries
                .into_iter()
                .map(|e| OnlineUser { uid: e.uid, ip: e.ip })
                .collect())
        })
    }

    fn rule_matches(
        &self,
        tag: String,
    ) -> BoxFuture<'_, Result<Vec<DetectResult>, RuntimeError>> {
        Box::pin(async move {
            let resp = self
                .client()
                .get_rule_matches(pb::TagRequest { tag })
                .await?
                .into_inner();
            Ok(resp
                .matches
                .into_iter()
                .map(|m| DetectResult {
                    uid: m.uid,
                    rule_id: m.rule_id,
                })
                .collect())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    AlreadyExists,
    NotFound,
    Other,
}

pub fn classify_idempotency_status(status: &tonic::Status) -> IdempotencyStatus {
    match status.code() {
        tonic::Code::AlreadyExists => return IdempotencyStatus::AlreadyExists,
        tonic::Code::NotFound => return IdempotencyStatus::NotFound,
        _ => {}
    }

    // Some runtimes report `Code::Unknown` carrying a nested message such as
    // "handler not found" instead of a proper status code.
    let msg = status.message().to_ascii_lowercase();
    if msg.contains("not found") {
        return IdempotencyStatus::NotFound;
    }
    if msg.contains("already exists") || msg.contains("already exist") {
        return IdempotencyStatus::AlreadyExists;
    }

    IdempotencyStatus::Other
}

pub fn is_already_exists(status: &tonic::Status) -> bool {
    classify_idempotency_status(status) == IdempotencyStatus::AlreadyExists
}

pub fn is_not_found(status: &tonic::Status) -> bool {
    classify_idempotency_status(status) == IdempotencyStatus::NotFound
}
