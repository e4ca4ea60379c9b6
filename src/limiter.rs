use crate::{
    domain::{Tag, UserRecord},
    xray::{Runtime, RuntimeError, UserLimit},
};

pub fn user_limits(tag: &Tag, users: &[UserRecord]) -> Vec<UserLimit> {
    users
        .iter()
        .map(|u| UserLimit {
            email: tag.user_key(u),
            uid: u.uid,
            speed_limit: u.speed_limit,
            device_limit: u.device_limit,
        })
        .collect()
}

/// Installs the limiter of a freshly added tag with its full user set.
pub async fn add_inbound_limiter(
    runtime: &dyn Runtime,
    tag: &Tag,
    node_speed_limit: u64,
    users: &[UserRecord],
) -> Result<(), RuntimeError> {
    runtime
        .add_limiter(tag.to_string(), node_speed_limit, user_limits(tag, users))
        .await
}

/// Registers newly added users with an existing limiter. Deleted users need no call; the
/// runtime drops their buckets with the users themselves.
pub async fn update_inbound_limiter(
    runtime: &dyn Runtime,
    tag: &Tag,
    added: &[UserRecord],
) -> Result<(), RuntimeError> {
    if added.is_empty() {
        return Ok(());
    }
    runtime
        .update_limiter(tag.to_string(), user_limits(tag, added))
        .await
}

pub async fn delete_inbound_limiter(runtime: &dyn Runtime, tag: &Tag) -> Result<(), RuntimeError> {
    runtime.delete_limiter(tag.to_string()).await
}
