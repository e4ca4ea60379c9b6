//! In-memory fixtures shared by unit tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use crate::{
    domain::{
        DetectResult, DetectionRule, NodeDescriptor, NodeStatus, NodeType, OnlineUser,
        RelayNodeDescriptor, TrafficSample, UserRecord,
    },
    panel::{ControlPlane, PanelError},
    xray::{
        BoxFuture, Runtime, RuntimeError, Traffic, UserLimit,
        conf::{InboundConfig, OutboundConfig, UserConfig},
    },
};

pub(crate) fn node(node_type: NodeType, port: u32) -> NodeDescriptor {
    NodeDescriptor {
        node_type,
        node_id: 7,
        port,
        speed_limit: 0,
        transport: "tcp".to_string(),
        enable_tls: false,
        tls_type: "none".to_string(),
        host: String::new(),
        path: String::new(),
        service_name: String::new(),
        header_type: "none".to_string(),
        cipher_method: "aes-128-gcm".to_string(),
        allow_insecure: false,
        relay: false,
        relay_node_id: 0,
        listen_ip: String::new(),
        proxy_protocol: false,
        sniffing: true,
    }
}

pub(crate) fn user(uid: i64) -> UserRecord {
    UserRecord {
        uid,
        email: format!("user{uid}@example.com"),
        password: format!("pass-{uid}"),
        uuid: format!("00000000-0000-4000-8000-{uid:012}"),
        speed_limit: 0,
        device_limit: 0,
        relay: false,
    }
}

pub(crate) fn relay_user(uid: i64) -> UserRecord {
    UserRecord {
        relay: true,
        ..user(uid)
    }
}

/// Mutating runtime calls, in order. Reads are not recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuntimeCall {
    AddInbound(String),
    RemoveInbound(String),
    AddOutbound(String),
    RemoveOutbound(String),
    AddUsers(String, Vec<i64>),
    RemoveUsers(String, Vec<String>),
    AddLimiter(String, u64, Vec<i64>),
    UpdateLimiter(String, Vec<i64>),
    DeleteLimiter(String),
    UpdateRules(String, Vec<i64>),
}

#[derive(Debug, Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    inbounds: BTreeMap<String, InboundConfig>,
    outbounds: BTreeMap<String, OutboundConfig>,
    users: BTreeMap<String, BTreeSet<String>>,
    limiters: BTreeSet<String>,
    rules: BTreeMap<String, Vec<DetectionRule>>,
    traffic: BTreeMap<String, Traffic>,
    online: Vec<OnlineUser>,
    matches: Vec<DetectResult>,
    fail_add_inbound: BTreeSet<String>,
    fail_traffic: bool,
}

/// Runtime double that keeps the applied objects and the call log.
///
/// Mirrors the gRPC runtime's idempotency: removing something absent succeeds, adding a
/// listener or egress under a taken tag fails with `AlreadyExists`.
#[derive(Debug, Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

fn uid_of(email: &str) -> i64 {
    email
        .rsplit('|')
        .next()
        .and_then(|uid| uid.parse().ok())
        .unwrap_or_default()
}

impl FakeRuntime {
    fn with<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn calls(&self) -> Vec<RuntimeCall> {
        self.with(|s| s.calls.clone())
    }

    pub(crate) fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub(crate) fn inbounds(&self) -> BTreeMap<String, InboundConfig> {
        self.with(|s| s.inbounds.clone())
    }

    pub(crate) fn outbounds(&self) -> BTreeMap<String, OutboundConfig> {
        self.with(|s| s.outbounds.clone())
    }

    pub(crate) fn users_of(&self, tag: &str) -> BTreeSet<String> {
        self.with(|s| s.users.get(tag).cloned().unwrap_or_default())
    }

    pub(crate) fn has_limiter(&self, tag: &str) -> bool {
        self.with(|s| s.limiters.contains(tag))
    }

    pub(crate) fn rules_of(&self, tag: &str) -> Vec<DetectionRule> {
        self.with(|s| s.rules.get(tag).cloned().unwrap_or_default())
    }

    pub(crate) fn fail_add_inbound(&self, tag: &str) {
        self.with(|s| s.fail_add_inbound.insert(tag.to_string()));
    }

    pub(crate) fn clear_failures(&self) {
        self.with(|s| s.fail_add_inbound.clear());
    }

    pub(crate) fn fail_traffic(&self) {
        self.with(|s| s.fail_traffic = true);
    }

    pub(crate) fn set_traffic(&self, key: &str, upload: i64, download: i64) {
        self.with(|s| s.traffic.insert(key.to_string(), Traffic { upload, download }));
    }

    pub(crate) fn has_traffic(&self, key: &str) -> bool {
        self.with(|s| s.traffic.contains_key(key))
    }

    pub(crate) fn set_online(&self, online: Vec<OnlineUser>) {
        self.with(|s| s.online = online);
    }

    pub(crate) fn set_matches(&self, matches: Vec<DetectResult>) {
        self.with(|s| s.matches = matches);
    }
}

fn already_exists(tag: &str) -> RuntimeError {
    RuntimeError::Status(tonic::Status::already_exists(format!("{tag} already exists")))
}

impl Runtime for FakeRuntime {
    fn add_inbound(
        &self,
        tag: String,
        config: InboundConfig,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(RuntimeCall::AddInbound(tag.clone()));
                if s.fail_add_inbound.contains(&tag) {
                    return Err(RuntimeError::Status(tonic::Status::internal("injected")));
                }
                if s.inbounds.contains_key(&tag) {
                    return Err(already_exists(&tag));
                }
                s.inbounds.insert(tag, config);
                Ok(())
            })
        })
    }

    fn remove_inbound(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(RuntimeCall::RemoveInbound(tag.clone()));
                s.inbounds.remove(&tag);
                s.users.remove(&tag);
                Ok(())
            })
        })
    }

    fn add_outbound(
        &self,
        tag: String,
        config: OutboundConfig,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(RuntimeCall::AddOutbound(tag.clone()));
                if s.outbounds.contains_key(&tag) {
                    return Err(already_exists(&tag));
                }
                s.outbounds.insert(tag, config);
                Ok(())
            })
        })
    }

    fn remove_outbound(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(RuntimeCall::RemoveOutbound(tag.clone()));
                s.outbounds.remove(&tag);
                Ok(())
            })
        })
    }

    fn add_users(
        &self,
        tag: String,
        users: Vec<UserConfig>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                let uids = users.iter().map(|u| uid_of(&u.email)).collect();
                s.calls.push(RuntimeCall::AddUsers(tag.clone(), uids));
                s.users
                    .entry(tag)
                    .or_default()
                    .extend(users.into_iter().map(|u| u.email));
                Ok(())
            })
        })
    }

    fn remove_users(
        &self,
        tag: String,
        emails: Vec<String>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls
                    .push(RuntimeCall::RemoveUsers(tag.clone(), emails.clone()));
                if let Some(set) = s.users.get_mut(&tag) {
                    for email in &emails {
                        set.remove(email);
                    }
                }
                Ok(())
            })
        })
    }

    fn add_limiter(
        &self,
        tag: String,
        speed_limit: u64,
        users: Vec<UserLimit>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                let uids = users.iter().map(|u| u.uid).collect();
                s.calls
                    .push(RuntimeCall::AddLimiter(tag.clone(), speed_limit, uids));
                s.limiters.insert(tag);
                Ok(())
            })
        })
    }

    fn update_limiter(
        &self,
        tag: String,
        users: Vec<UserLimit>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                let uids = users.iter().map(|u| u.uid).collect();
                s.calls.push(RuntimeCall::UpdateLimiter(tag, uids));
                Ok(())
            })
        })
    }

    fn delete_limiter(&self, tag: String) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(RuntimeCall::DeleteLimiter(tag.clone()));
                s.limiters.remove(&tag);
                Ok(())
            })
        })
    }

    fn update_rules(
        &self,
        tag: String,
        rules: Vec<DetectionRule>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                let ids = rules.iter().map(|r| r.id).collect();
                s.calls.push(RuntimeCall::UpdateRules(tag.clone(), ids));
                s.rules.insert(tag, rules);
                Ok(())
            })
        })
    }

    fn get_traffic(
        &self,
        key: String,
        reset: bool,
    ) -> BoxFuture<'_, Result<Traffic, RuntimeError>> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_traffic {
                    return Err(RuntimeError::Status(tonic::Status::unavailable("down")));
                }
                let traffic = s.traffic.get(&key).copied().unwrap_or_default();
                if reset {
                    s.traffic.remove(&key);
                }
                Ok(traffic)
            })
        })
    }

    fn online_users(&self, _tag: String) -> BoxFuture<'_, Result<Vec<OnlineUser>, RuntimeError>> {
        Box::pin(async move { self.with(|s| Ok(s.online.clone())) })
    }

    fn rule_matches(
        &self,
        _tag: String,
    ) -> BoxFuture<'_, Result<Vec<DetectResult>, RuntimeError>> {
        Box::pin(async move { self.with(|s| Ok(std::mem::take(&mut s.matches))) })
    }
}

#[derive(Debug, Default)]
pub(crate) struct PanelState {
    pub node: Option<NodeDescriptor>,
    pub relay: Option<RelayNodeDescriptor>,
    pub users: Vec<UserRecord>,
    pub rules: Vec<DetectionRule>,
    pub fail_users: bool,
    pub fail_relay: bool,
    pub fail_rules: bool,
    pub statuses: Vec<NodeStatus>,
    pub traffic: Vec<Vec<TrafficSample>>,
    pub online: Vec<Vec<OnlineUser>>,
    pub violations: Vec<Vec<DetectResult>>,
}

/// Control-plane double. A missing node is reported as a protocol failure.
#[derive(Debug, Default)]
pub(crate) struct FakePanel {
    state: Mutex<PanelState>,
}

fn fake_error(what: &str) -> PanelError {
    PanelError::Protocol {
        path: format!("/fake/{what}"),
        reason: "injected".to_string(),
    }
}

impl FakePanel {
    pub(crate) fn new(node: NodeDescriptor, users: Vec<UserRecord>) -> Self {
        Self {
            state: Mutex::new(PanelState {
                node: Some(node),
                users,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut PanelState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

impl ControlPlane for FakePanel {
    fn fetch_node(&self) -> BoxFuture<'_, Result<NodeDescriptor, PanelError>> {
        Box::pin(async move { self.with(|s| s.node.clone().ok_or_else(|| fake_error("node"))) })
    }

    fn fetch_relay_node(&self) -> BoxFuture<'_, Result<RelayNodeDescriptor, PanelError>> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_relay {
                    return Err(fake_error("relay"));
                }
                s.relay.clone().ok_or_else(|| fake_error("relay"))
            })
        })
    }

    fn fetch_users(&self) -> BoxFuture<'_, Result<Vec<UserRecord>, PanelError>> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_users {
                    return Err(fake_error("users"));
                }
                Ok(s.users.clone())
            })
        })
    }

    fn fetch_rules(&self) -> BoxFuture<'_, Result<Vec<DetectionRule>, PanelError>> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_rules {
                    return Err(fake_error("rules"));
                }
                Ok(s.rules.clone())
            })
        })
    }

    fn report_status(&self, status: NodeStatus) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            self.with(|s| s.statuses.push(status));
            Ok(())
        })
    }

    fn report_online_users(
        &self,
        users: Vec<OnlineUser>,
    ) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            self.with(|s| s.online.push(users));
            Ok(())
        })
    }

    fn report_traffic(
        &self,
        traffic: Vec<TrafficSample>,
    ) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            self.with(|s| s.traffic.push(traffic));
            Ok(())
        })
    }

    fn report_violations(
        &self,
        results: Vec<DetectResult>,
    ) -> BoxFuture<'_, Result<(), PanelError>> {
        Box::pin(async move {
            self.with(|s| s.violations.push(results));
            Ok(())
        })
    }
}
