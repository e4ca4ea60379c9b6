use std::{collections::BTreeSet, sync::Arc};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    diff::diff_users,
    domain::{
        DetectionRule, NodeDescriptor, RelayNodeDescriptor, Tag, TrafficSample, UserRecord,
    },
    limiter,
    panel::{ControlPlane, PanelError},
    relay, rules, status,
    tag::{TagError, add_node_tags, remove_node_tags},
    xray::{Runtime, builder::BuildContext, users::build_users},
};

#[derive(Debug)]
pub enum TickError {
    FetchNode(PanelError),
    FetchUsers(PanelError),
    AddTag(TagError),
}

impl std::fmt::Display for TickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchNode(err) => write!(f, "fetch node: {err}"),
            Self::FetchUsers(err) => write!(f, "fetch users: {err}"),
            Self::AddTag(err) => write!(f, "add node tag: {err}"),
        }
    }
}

impl std::error::Error for TickError {}

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    pub build: BuildContext,
    pub local_rules: Vec<DetectionRule>,
    pub disable_get_rule: bool,
    pub disable_upload_traffic: bool,
}

/// What the runtime currently holds, as far as this process applied it.
#[derive(Debug, Default)]
struct Applied {
    /// `None` until a tag add succeeds; the next tick then rebuilds from scratch.
    node: Option<NodeDescriptor>,
    tag: Option<Tag>,
    users: Vec<UserRecord>,
    relay: Option<RelayNodeDescriptor>,
    relay_tags: BTreeSet<Tag>,
}

/// Keeps the runtime in step with the control-plane for one node.
pub struct Controller {
    panel: Arc<dyn ControlPlane>,
    runtime: Arc<dyn Runtime>,
    options: ControllerOptions,
    applied: Mutex<Applied>,
}

impl Controller {
    pub fn new(
        panel: Arc<dyn ControlPlane>,
        runtime: Arc<dyn Runtime>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            panel,
            runtime,
            options,
            applied: Mutex::new(Applied::default()),
        }
    }

    /// First reconciliation. Unlike a periodic tick, failing to fetch desired state or
    /// to bring the tag up is returned to the caller.
    pub async fn start(&self) -> Result<(), TickError> {
        let mut applied = self.applied.lock().await;
        self.reconcile(&mut applied).await?;
        if let Some(tag) = &applied.tag {
            info!(%tag, users = applied.users.len(), "node is live");
        }
        Ok(())
    }

    pub async fn sync_tick(&self) {
        let mut applied = self.applied.lock().await;
        if let Err(err) = self.reconcile(&mut applied).await {
            warn!(%err, "node sync failed; retrying next tick");
        }
    }

    async fn reconcile(&self, applied: &mut Applied) -> Result<(), TickError> {
        let runtime = self.runtime.as_ref();
        let ctx = &self.options.build;

        let node = self.panel.fetch_node().await.map_err(TickError::FetchNode)?;
        let users = self
            .panel
            .fetch_users()
            .await
            .map_err(TickError::FetchUsers)?;
        let relay_fetch = if node.relay {
            Some(self.panel.fetch_relay_node().await)
        } else {
            None
        };

        let node_replaced = applied.node.as_ref() != Some(&node);
        let new_tag = Tag::for_node(&node);
        let (deleted, added) = if node_replaced {
            if let Some(old) = applied.node.take() {
                info!(old_tag = %Tag::for_node(&old), new_tag = %new_tag, "node changed; replacing tag");
                remove_node_tags(runtime, &old).await;
            }
            if let Some(old_tag) = applied.tag.take() {
                if let Err(err) = limiter::delete_inbound_limiter(runtime, &old_tag).await {
                    warn!(tag = %old_tag, %err, "delete limiter failed");
                }
            }
            relay::remove_all_relays(runtime, &mut applied.relay_tags).await;
            applied.relay = None;
            applied.users.clear();

            add_node_tags(runtime, ctx, &node)
                .await
                .map_err(TickError::AddTag)?;
            applied.node = Some(node.clone());
            applied.tag = Some(new_tag.clone());

            self.add_users(&new_tag, &node, &users).await;
            if let Err(err) =
                limiter::add_inbound_limiter(runtime, &new_tag, node.speed_limit, &users).await
            {
                warn!(tag = %new_tag, %err, "add limiter failed");
            }
            (Vec::new(), users.clone())
        } else {
            let (deleted, added) = diff_users(&applied.users, &users);
            if !deleted.is_empty() {
                let emails = deleted.iter().map(|u| new_tag.user_key(u)).collect();
                if let Err(err) = runtime.remove_users(new_tag.to_string(), emails).await {
                    warn!(tag = %new_tag, %err, "remove users failed");
                }
            }
            self.add_users(&new_tag, &node, &added).await;
            if let Err(err) = limiter::update_inbound_limiter(runtime, &new_tag, &added).await {
                warn!(tag = %new_tag, %err, "update limiter failed");
            }
            if !deleted.is_empty() || !added.is_empty() {
                info!(tag = %new_tag, deleted = deleted.len(), added = added.len(), "users updated");
            }
            (deleted, added)
        };

        self.sync_relays(applied, relay_fetch, node_replaced, &users, &deleted, &added)
            .await;

        if !self.options.disable_get_rule {
            match self.panel.fetch_rules().await {
                Ok(remote) => {
                    let merged = rules::merge_rules(&self.options.local_rules, remote);
                    if let Err(err) = rules::update_rule(runtime, &new_tag, merged).await {
                        warn!(tag = %new_tag, %err, "update rules failed");
                    }
                }
                Err(err) => warn!(%err, "fetch rules failed"),
            }
        }

        applied.users = users;
        Ok(())
    }

    async fn add_users(&self, tag: &Tag, node: &NodeDescriptor, users: &[UserRecord]) {
        let configs = build_users(tag, node, users);
        if configs.is_empty() {
            return;
        }
        if let Err(err) = self.runtime.add_users(tag.to_string(), configs).await {
            warn!(%tag, %err, "add users failed");
        }
    }

    async fn sync_relays(
        &self,
        applied: &mut Applied,
        relay_fetch: Option<Result<RelayNodeDescriptor, PanelError>>,
        node_replaced: bool,
        users: &[UserRecord],
        deleted: &[UserRecord],
        added: &[UserRecord],
    ) {
        let runtime = self.runtime.as_ref();
        let ctx = &self.options.build;

        let (descriptor, changed) = match relay_fetch {
            None => {
                relay::remove_all_relays(runtime, &mut applied.relay_tags).await;
                applied.relay = None;
                return;
            }
            Some(Ok(fetched)) => {
                let changed = applied.relay.as_ref() != Some(&fetched);
                (Some(fetched), changed)
            }
            Some(Err(err)) => {
                warn!(%err, "fetch relay node failed; keeping relay egresses");
                (applied.relay.clone(), false)
            }
        };

        match &descriptor {
            Some(relay) if node_replaced || changed => {
                debug!(address = %relay.address, "rebuilding relay egresses");
                relay::rebuild_relays(runtime, ctx, relay, users, &mut applied.relay_tags).await;
            }
            _ => {
                relay::apply_relay_churn(
                    runtime,
                    ctx,
                    descriptor.as_ref(),
                    deleted,
                    added,
                    &mut applied.relay_tags,
                )
                .await;
            }
        }
        applied.relay = descriptor;
    }

    /// Collects telemetry for the live tag and reports it. Each step is independent.
    pub async fn report_tick(&self) {
        if let Err(err) = self.panel.report_status(status::sample()).await {
            warn!(%err, "report node status failed");
        }

        let (tag, users) = {
            let applied = self.applied.lock().await;
            (applied.tag.clone(), applied.users.clone())
        };
        let Some(tag) = tag else {
            return;
        };

        // Counters are read and reset even when upload is disabled, so nothing piles up.
        let mut samples = Vec::new();
        for user in &users {
            match self.runtime.get_traffic(tag.user_key(user), true).await {
                Ok(t) if t.upload != 0 || t.download != 0 => samples.push(TrafficSample {
                    uid: user.uid,
                    email: user.email.clone(),
                    upload: t.upload,
                    download: t.download,
                }),
                Ok(_) => {}
                Err(err) => warn!(%tag, uid = user.uid, %err, "read traffic failed"),
            }
        }
        if !samples.is_empty() && !self.options.disable_upload_traffic {
            if let Err(err) = self.panel.report_traffic(samples).await {
                warn!(%err, "report traffic failed");
            }
        }

        match self.runtime.online_users(tag.to_string()).await {
            Ok(online) if !online.is_empty() => {
                if let Err(err) = self.panel.report_online_users(online).await {
                    warn!(%err, "report online users failed");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%tag, %err, "read online users failed"),
        }

        match self.runtime.rule_matches(tag.to_string()).await {
            Ok(matches) => {
                let remote: Vec<_> = matches
                    .into_iter()
                    .filter(|m| m.rule_id != crate::domain::LOCAL_RULE_ID)
                    .collect();
                if !remote.is_empty() {
                    if let Err(err) = self.panel.report_violations(remote).await {
                        warn!(%err, "report violations failed");
                    }
                }
            }
            Err(err) => warn!(%tag, %err, "read rule matches failed"),
        }
    }
}
