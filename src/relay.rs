//! Per-user relay egresses.
//!
//! A relay-eligible user gets one egress `Relay_{uid}` that re-originates the user's
//! traffic towards the relay node with the user's own credentials. The runtime routes
//! each user's traffic to that tag by convention.

use std::collections::BTreeSet;

use tracing::warn;

use crate::{
    domain::{RelayNodeDescriptor, Tag, UserRecord},
    xray::{
        Runtime,
        builder::{self, BuildContext},
    },
};

async fn add_relay(
    runtime: &dyn Runtime,
    ctx: &BuildContext,
    relay: &RelayNodeDescriptor,
    user: &UserRecord,
    live: &mut BTreeSet<Tag>,
) {
    let tag = Tag::relay(user.uid);
    let outbound = match builder::build_relay_outbound(ctx, relay, user) {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!(%tag, uid = user.uid, %err, "build relay outbound failed");
            return;
        }
    };

    let mut res = runtime.add_outbound(tag.to_string(), outbound.clone()).await;
    if matches!(&res, Err(err) if err.is_already_exists()) {
        // Left over from an earlier process; its settings are unknown.
        if let Err(err) = runtime.remove_outbound(tag.to_string()).await {
            warn!(%tag, %err, "remove stale relay outbound failed");
        }
        res = runtime.add_outbound(tag.to_string(), outbound).await;
    }
    match res {
        Ok(()) => {
            live.insert(tag);
        }
        Err(err) => warn!(%tag, uid = user.uid, %err, "add relay outbound failed"),
    }
}

async fn remove_relay(runtime: &dyn Runtime, tag: Tag, live: &mut BTreeSet<Tag>) {
    match runtime.remove_outbound(tag.to_string()).await {
        Ok(()) => {
            live.remove(&tag);
        }
        Err(err) => warn!(%tag, %err, "remove relay outbound failed"),
    }
}

pub async fn remove_all_relays(runtime: &dyn Runtime, live: &mut BTreeSet<Tag>) {
    let tags: Vec<Tag> = live.iter().cloned().collect();
    for tag in tags {
        remove_relay(runtime, tag, live).await;
    }
}

/// Drops every live relay egress, then builds one per relay-eligible user.
pub async fn rebuild_relays(
    runtime: &dyn Runtime,
    ctx: &BuildContext,
    relay: &RelayNodeDescriptor,
    users: &[UserRecord],
    live: &mut BTreeSet<Tag>,
) {
    remove_all_relays(runtime, live).await;
    for user in users.iter().filter(|u| u.relay) {
        add_relay(runtime, ctx, relay, user, live).await;
    }
}

/// Follows an incremental user diff: deleted users lose their egress first, then added
/// eligible users get one. A credential rotation keeps the uid, so its egress is
/// rebuilt with the new credentials.
pub async fn apply_relay_churn(
    runtime: &dyn Runtime,
    ctx: &BuildContext,
    relay: Option<&RelayNodeDescriptor>,
    deleted: &[UserRecord],
    added: &[UserRecord],
    live: &mut BTreeSet<Tag>,
) {
    for user in deleted {
        let tag = Tag::relay(user.uid);
        if live.contains(&tag) {
            remove_relay(runtime, tag, live).await;
        }
    }
    let Some(relay) = relay else {
        return;
    };
    for user in added.iter().filter(|u| u.relay) {
        add_relay(runtime, ctx, relay, user, live).await;
    }
}
