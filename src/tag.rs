//! Listener/egress pair lifecycle for the node tag.
//!
//! A plain node owns one inbound and one outbound under its tag. A
//! `Shadowsocks-Plugin` node owns two pairs: the shadowsocks listener itself, and a
//! `dokodemo-door` companion one port above it that redirects into it.

use tracing::warn;

use crate::{
    domain::{NodeDescriptor, NodeType, Tag},
    xray::{
        Runtime, RuntimeError,
        builder::{self, BuildContext, TranslationError},
    },
};

#[derive(Debug)]
pub enum TagError {
    Translation { tag: Tag, source: TranslationError },
    Runtime { tag: Tag, source: RuntimeError },
}

impl std::fmt::Display for TagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Translation { tag, source } => write!(f, "build config for {tag}: {source}"),
            Self::Runtime { tag, source } => write!(f, "apply {tag}: {source}"),
        }
    }
}

impl std::error::Error for TagError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Translation { source, .. } => Some(source),
            Self::Runtime { source, .. } => Some(source),
        }
    }
}

/// Redirecting companion of a plugin node, `None` for every other node type.
pub fn companion_of(node: &NodeDescriptor) -> Option<NodeDescriptor> {
    if node.node_type != NodeType::ShadowsocksPlugin {
        return None;
    }
    Some(NodeDescriptor {
        node_type: NodeType::DokodemoDoor,
        port: node.port.saturating_add(1),
        ..node.clone()
    })
}

/// Descriptors of every pair the node owns, in add order.
fn pairs_of(node: &NodeDescriptor) -> Vec<NodeDescriptor> {
    match companion_of(node) {
        Some(companion) => {
            // The shadowsocks side only sees plain TCP from the companion.
            let base = NodeDescriptor {
                enable_tls: false,
                tls_type: "none".to_string(),
                transport: "tcp".to_string(),
                ..node.clone()
            };
            vec![base, companion]
        }
        None => vec![node.clone()],
    }
}

async fn add_pair(
    runtime: &dyn Runtime,
    ctx: &BuildContext,
    node: &NodeDescriptor,
) -> Result<(), TagError> {
    let tag = Tag::for_node(node);
    let inbound = builder::build_inbound(ctx, node).map_err(|source| TagError::Translation {
        tag: tag.clone(),
        source,
    })?;
    let outbound = builder::build_outbound(ctx, node).map_err(|source| TagError::Translation {
        tag: tag.clone(),
        source,
    })?;

    runtime
        .add_inbound(tag.to_string(), inbound)
        .await
        .map_err(|source| TagError::Runtime {
            tag: tag.clone(),
            source,
        })?;
    if let Err(source) = runtime.add_outbound(tag.to_string(), outbound).await {
        if let Err(err) = runtime.remove_inbound(tag.to_string()).await {
            warn!(%tag, %err, "rollback remove_inbound failed");
        }
        return Err(TagError::Runtime { tag, source });
    }
    Ok(())
}

async fn remove_pair(runtime: &dyn Runtime, node: &NodeDescriptor) {
    let tag = Tag::for_node(node);
    if let Err(err) = runtime.remove_inbound(tag.to_string()).await {
        warn!(%tag, %err, "remove_inbound failed");
    }
    if let Err(err) = runtime.remove_outbound(tag.to_string()).await {
        warn!(%tag, %err, "remove_outbound failed");
    }
}

/// Adds every pair the node owns. On failure, pairs added by this call are removed again
/// so nothing half-built stays live.
pub async fn add_node_tags(
    runtime: &dyn Runtime,
    ctx: &BuildContext,
    node: &NodeDescriptor,
) -> Result<(), TagError> {
    let pairs = pairs_of(node);
    for (idx, pair) in pairs.iter().enumerate() {
        if let Err(err) = add_pair(runtime, ctx, pair).await {
            for added in &pairs[..idx] {
                remove_pair(runtime, added).await;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Removes every pair the node owns. Objects already gone count as removed; other
/// failures are logged.
pub async fn remove_node_tags(runtime: &dyn Runtime, node: &NodeDescriptor) {
    for pair in pairs_of(node) {
        remove_pair(runtime, &pair).await;
    }
}
