//! Queue naming for topics.
//!
//! The primary queue of a topic carries the topic's own name. Every replica
//! is named `{topic}-replica-{32 hex chars}`, which lets discovery and
//! startup recovery tell the two apart from names alone.

use uuid::Uuid;

use crate::constants::naming::{MAX_TOPIC_NAME_LEN, REPLICA_SEPARATOR, REPLICA_SUFFIX_LEN};
use crate::error::{PubSubError, PubSubResult};

/// Fresh replica queue name for `topic`
pub fn replica_queue_name(topic: &str) -> String {
    format!("{topic}{REPLICA_SEPARATOR}{}", Uuid::new_v4().simple())
}

/// Topic a replica queue belongs to, or `None` for non-replica names
pub fn replica_parent(queue_name: &str) -> Option<&str> {
    let split_at = queue_name.len().checked_sub(REPLICA_SUFFIX_LEN)?;
    if !queue_name.is_char_boundary(split_at) {
        return None;
    }
    let (head, suffix) = queue_name.split_at(split_at);
    let is_suffix = suffix
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        && Uuid::try_parse(suffix).is_ok();
    if !is_suffix {
        return None;
    }
    head.strip_suffix(REPLICA_SEPARATOR)
        .filter(|topic| !topic.is_empty())
}

pub fn is_replica_name(queue_name: &str) -> bool {
    replica_parent(queue_name).is_some()
}

/// Whether `queue_name` is the primary or a replica of exactly `topic`
pub fn queue_belongs_to_topic(queue_name: &str, topic: &str) -> bool {
    queue_name == topic || replica_parent(queue_name) == Some(topic)
}

/// Reject topic names that cannot be realised as queue names
pub fn validate_topic_name(topic: &str) -> PubSubResult<()> {
    if topic.is_empty() {
        return Err(PubSubError::invalid_topic_name(topic, "must not be empty"));
    }

    if topic.len() > MAX_TOPIC_NAME_LEN {
        return Err(PubSubError::invalid_topic_name(
            topic,
            format!("must be at most {MAX_TOPIC_NAME_LEN} characters"),
        ));
    }

    if let Some(bad) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(PubSubError::invalid_topic_name(
            topic,
            format!("contains unsupported character {bad:?}"),
        ));
    }

    if is_replica_name(topic) {
        return Err(PubSubError::invalid_topic_name(
            topic,
            "collides with the replica queue naming pattern",
        ));
    }

    Ok(())
}
