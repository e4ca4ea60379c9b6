use base64::Engine as _;
use serde_json::json;

use crate::{
    domain::{NodeDescriptor, NodeType, Tag, UserRecord},
    xray::conf::UserConfig,
};

const SS2022_PREFIX: &str = "2022-";

pub fn vless_flow(node: &NodeDescriptor) -> &'static str {
    if node.enable_tls && node.tls_type == "xtls" {
        "xtls-rprx-direct"
    } else {
        ""
    }
}

/// Pre-shared key length of a shadowsocks 2022 method, in bytes.
fn ss2022_key_len(method: &str) -> usize {
    if method.contains("aes-128") { 16 } else { 32 }
}

/// Password a user authenticates with on a shadowsocks listener or relay.
///
/// 2022 methods need a base64 key of fixed length; it is cut from the user's uuid so both
/// ends derive the same key without extra state.
pub fn shadowsocks_password(method: &str, user: &UserRecord) -> String {
    if !method.starts_with(SS2022_PREFIX) {
        return user.password.clone();
    }
    let len = ss2022_key_len(method).min(user.uuid.len());
    base64::engine::general_purpose::STANDARD.encode(&user.uuid.as_bytes()[..len])
}

fn account_for(node: &NodeDescriptor, user: &UserRecord) -> Option<serde_json::Value> {
    let account = match &node.node_type {
        NodeType::Vless => json!({
            "id": user.uuid,
            "flow": vless_flow(node),
            "encryption": "none",
        }),
        NodeType::Vmess => json!({ "id": user.uuid, "alterId": 0 }),
        NodeType::Trojan => json!({ "password": user.uuid }),
        NodeType::Shadowsocks | NodeType::ShadowsocksPlugin => json!({
            "method": node.cipher_method,
            "password": shadowsocks_password(&node.cipher_method, user),
        }),
        NodeType::DokodemoDoor | NodeType::Other(_) => return None,
    };
    Some(account)
}

/// Runtime user entries for `users` on the listener `tag`. Listeners that carry no user
/// accounts yield an empty list.
pub fn build_users(tag: &Tag, node: &NodeDescriptor, users: &[UserRecord]) -> Vec<UserConfig> {
    users
        .iter()
        .filter_map(|user| {
            account_for(node, user).map(|account| UserConfig {
                email: tag.user_key(user),
                level: 0,
                account,
            })
        })
        .collect()
}
