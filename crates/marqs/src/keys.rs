//! Key construction for every Redis structure MarQS touches.
//!
//! All methods return *logical* keys, without the global prefix; the broker
//! applies [`KeyProducer::physical`] exactly once, at the store boundary.
//! Child queue keys double as members of the parent "queue of queues" ZSETs
//! and as the `queue` field of message payloads, so they embed the tenant
//! identifiers needed to reconstruct every sibling key from the child key
//! alone.

use crate::tenant::TenantEnvironment;

const QUEUE_PART: &str = "queue";
const CONCURRENCY_KEY_PART: &str = "ck";
const ORG_PART: &str = "o";

const SHARED_QUEUE: &str = "sharedQueue";
const VISIBILITY_TIMEOUT: &str = "msgVisibilityTimeout";

/// Maximum length of a sanitized queue name.
const MAX_QUEUE_NAME_LEN: usize = 128;

/// Strips queue names down to `[A-Za-z0-9_/-]` and truncates to 128 chars.
pub fn sanitize_queue_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'))
        .take(MAX_QUEUE_NAME_LEN)
        .collect()
}

/// Produces the stable string keys used across all MarQS structures.
///
/// Implementations must be pure: the same inputs always produce the same
/// keys, and the `*_from_queue` family must reconstruct keys using only the
/// child queue key.
pub trait KeyProducer: Send + Sync {
    /// The global key prefix, e.g. `marqs:`.
    fn prefix(&self) -> &str;

    /// Child queue ZSET key: `queue:{env}:{queue}[:ck:{ck}]:o:{org}`.
    ///
    /// The trailing `o` section carries the organization id so that org-scoped
    /// keys can be rebuilt from the child key alone.
    fn queue_key(&self, env: &TenantEnvironment, queue: &str, ck: Option<&str>) -> String;

    /// Env-scoped parent ZSET: `env:{env}:sharedQueue`.
    fn env_shared_queue_key(&self, env: &TenantEnvironment) -> String;

    /// The global parent ZSET: `sharedQueue`.
    fn shared_queue_key(&self) -> String {
        SHARED_QUEUE.to_string()
    }

    /// The visibility-timeout ZSET: `msgVisibilityTimeout`.
    fn visibility_timeout_key(&self) -> String {
        VISIBILITY_TIMEOUT.to_string()
    }

    /// Message body: `message:{messageId}`.
    fn message_key(&self, message_id: &str) -> String;

    /// Queue concurrency limit: `cl:{env}:{queue}`. Concurrency-keyed
    /// subqueues share their parent queue's limit, so no `ck` section.
    fn concurrency_limit_key(&self, env: &TenantEnvironment, queue: &str) -> String;

    /// Queue current concurrency SET: `cc:{env}:{queue}[:ck:{ck}]`.
    fn current_concurrency_key(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        ck: Option<&str>,
    ) -> String;

    /// Env concurrency limit: `el:{env}`.
    fn env_concurrency_limit_key(&self, env: &TenantEnvironment) -> String;

    /// Env current concurrency SET: `ecc:{env}`.
    fn env_current_concurrency_key(&self, env: &TenantEnvironment) -> String;

    /// Org concurrency limit: `ol:{org}`.
    fn org_concurrency_limit_key(&self, env: &TenantEnvironment) -> String;

    /// Org current concurrency SET: `occ:{org}`.
    fn org_current_concurrency_key(&self, env: &TenantEnvironment) -> String;

    // Reconstruction from a child queue key alone.

    fn env_id_from_queue(&self, queue_key: &str) -> String;
    fn org_id_from_queue(&self, queue_key: &str) -> String;
    fn queue_name_from_queue(&self, queue_key: &str) -> String;
    fn concurrency_key_from_queue(&self, queue_key: &str) -> Option<String>;

    fn concurrency_limit_key_from_queue(&self, queue_key: &str) -> String;
    fn current_concurrency_key_from_queue(&self, queue_key: &str) -> String;
    fn env_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String;
    fn env_current_concurrency_key_from_queue(&self, queue_key: &str) -> String;
    fn org_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String;
    fn org_current_concurrency_key_from_queue(&self, queue_key: &str) -> String;
    fn env_shared_queue_key_from_queue(&self, queue_key: &str) -> String;

    /// Applies the global prefix, turning a logical key into the physical one.
    fn physical(&self, logical: &str) -> String {
        format!("{}{}", self.prefix(), logical)
    }
}

/// The default short-key scheme described above.
#[derive(Debug, Clone)]
pub struct DefaultKeyProducer {
    prefix: String,
}

impl DefaultKeyProducer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Splits a child queue key into (env id, queue name, ck, org id).
    ///
    /// Sanitized names cannot contain `:`, so every section is exactly one
    /// segment and the `ck` / `o` markers are unambiguous past index 2.
    fn parse_queue_key<'a>(key: &'a str) -> ParsedQueueKey<'a> {
        let segments: Vec<&str> = key.split(':').collect();
        let mut parsed = ParsedQueueKey {
            env_id: segments.get(1).copied().unwrap_or_default(),
            queue: segments.get(2).copied().unwrap_or_default(),
            concurrency_key: None,
            org_id: "",
        };

        let mut ix = 3;
        while ix + 1 < segments.len() {
            match segments[ix] {
                CONCURRENCY_KEY_PART => parsed.concurrency_key = Some(segments[ix + 1]),
                ORG_PART => parsed.org_id = segments[ix + 1],
                _ => {}
            }
            ix += 2;
        }
        parsed
    }
}

struct ParsedQueueKey<'a> {
    env_id: &'a str,
    queue: &'a str,
    concurrency_key: Option<&'a str>,
    org_id: &'a str,
}

impl Default for DefaultKeyProducer {
    fn default() -> Self {
        Self::new(crate::config::KEY_PREFIX)
    }
}

impl KeyProducer for DefaultKeyProducer {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn queue_key(&self, env: &TenantEnvironment, queue: &str, ck: Option<&str>) -> String {
        let mut key = format!("{QUEUE_PART}:{}:{}", env.id, sanitize_queue_name(queue));
        if let Some(ck) = ck {
            key.push_str(&format!(
                ":{CONCURRENCY_KEY_PART}:{}",
                sanitize_queue_name(ck)
            ));
        }
        key.push_str(&format!(":{ORG_PART}:{}", env.organization_id));
        key
    }

    fn env_shared_queue_key(&self, env: &TenantEnvironment) -> String {
        format!("env:{}:{SHARED_QUEUE}", env.id)
    }

    fn message_key(&self, message_id: &str) -> String {
        format!("message:{message_id}")
    }

    fn concurrency_limit_key(&self, env: &TenantEnvironment, queue: &str) -> String {
        format!("cl:{}:{}", env.id, sanitize_queue_name(queue))
    }

    fn current_concurrency_key(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        ck: Option<&str>,
    ) -> String {
        let mut key = format!("cc:{}:{}", env.id, sanitize_queue_name(queue));
        if let Some(ck) = ck {
            key.push_str(&format!(
                ":{CONCURRENCY_KEY_PART}:{}",
                sanitize_queue_name(ck)
            ));
        }
        key
    }

    fn env_concurrency_limit_key(&self, env: &TenantEnvironment) -> String {
        format!("el:{}", env.id)
    }

    fn env_current_concurrency_key(&self, env: &TenantEnvironment) -> String {
        format!("ecc:{}", env.id)
    }

    fn org_concurrency_limit_key(&self, env: &TenantEnvironment) -> String {
        format!("ol:{}", env.organization_id)
    }

    fn org_current_concurrency_key(&self, env: &TenantEnvironment) -> String {
        format!("occ:{}", env.organization_id)
    }

    fn env_id_from_queue(&self, queue_key: &str) -> String {
        Self::parse_queue_key(queue_key).env_id.to_string()
    }

    fn org_id_from_queue(&self, queue_key: &str) -> String {
        Self::parse_queue_key(queue_key).org_id.to_string()
    }

    fn queue_name_from_queue(&self, queue_key: &str) -> String {
        Self::parse_queue_key(queue_key).queue.to_string()
    }

    fn concurrency_key_from_queue(&self, queue_key: &str) -> Option<String> {
        Self::parse_queue_key(queue_key)
            .concurrency_key
            .map(str::to_string)
    }

    fn concurrency_limit_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = Self::parse_queue_key(queue_key);
        format!("cl:{}:{}", parsed.env_id, parsed.queue)
    }

    fn current_concurrency_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = Self::parse_queue_key(queue_key);
        let mut key = format!("cc:{}:{}", parsed.env_id, parsed.queue);
        if let Some(ck) = parsed.concurrency_key {
            key.push_str(&format!(":{CONCURRENCY_KEY_PART}:{ck}"));
        }
        key
    }

    fn env_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String {
        format!("el:{}", Self::parse_queue_key(queue_key).env_id)
    }

    fn env_current_concurrency_key_from_queue(&self, queue_key: &str) -> String {
        format!("ecc:{}", Self::parse_queue_key(queue_key).env_id)
    }

    fn org_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String {
        format!("ol:{}", Self::parse_queue_key(queue_key).org_id)
    }

    fn org_current_concurrency_key_from_queue(&self, queue_key: &str) -> String {
        format!("occ:{}", Self::parse_queue_key(queue_key).org_id)
    }

    fn env_shared_queue_key_from_queue(&self, queue_key: &str) -> String {
        format!(
            "env:{}:{SHARED_QUEUE}",
            Self::parse_queue_key(queue_key).env_id
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tenant::EnvironmentType;

    fn env() -> TenantEnvironment {
        TenantEnvironment::new("e_123", "org_456", EnvironmentType::Production, 10, 20)
    }

    #[test]
    fn sanitize_strips_and_truncates() {
        assert_eq!(sanitize_queue_name("my queue!"), "myqueue");
        assert_eq!(sanitize_queue_name("a/b_c-d"), "a/b_c-d");
        assert_eq!(sanitize_queue_name("evil:key"), "evilkey");

        let long = "x".repeat(200);
        assert_eq!(sanitize_queue_name(&long).len(), 128);
    }

    #[test]
    fn queue_key_shapes() {
        let keys = DefaultKeyProducer::default();
        assert_eq!(
            keys.queue_key(&env(), "emails", None),
            "queue:e_123:emails:o:org_456"
        );
        assert_eq!(
            keys.queue_key(&env(), "emails", Some("user-1")),
            "queue:e_123:emails:ck:user-1:o:org_456"
        );
        assert_eq!(keys.env_shared_queue_key(&env()), "env:e_123:sharedQueue");
        assert_eq!(keys.shared_queue_key(), "sharedQueue");
        assert_eq!(keys.message_key("m1"), "message:m1");
        assert_eq!(keys.physical("sharedQueue"), "marqs:sharedQueue");
    }

    #[test]
    fn reconstruction_round_trips() {
        let keys = DefaultKeyProducer::default();
        let child = keys.queue_key(&env(), "emails", Some("user-1"));

        assert_eq!(keys.env_id_from_queue(&child), "e_123");
        assert_eq!(keys.org_id_from_queue(&child), "org_456");
        assert_eq!(keys.queue_name_from_queue(&child), "emails");
        assert_eq!(
            keys.concurrency_key_from_queue(&child),
            Some("user-1".to_string())
        );

        assert_eq!(
            keys.current_concurrency_key_from_queue(&child),
            keys.current_concurrency_key(&env(), "emails", Some("user-1"))
        );
        assert_eq!(
            keys.env_current_concurrency_key_from_queue(&child),
            "ecc:e_123"
        );
        assert_eq!(
            keys.org_current_concurrency_key_from_queue(&child),
            "occ:org_456"
        );
        assert_eq!(
            keys.env_shared_queue_key_from_queue(&child),
            "env:e_123:sharedQueue"
        );
    }

    #[test]
    fn concurrency_keyed_subqueues_share_the_queue_limit() {
        let keys = DefaultKeyProducer::default();
        let plain = keys.queue_key(&env(), "emails", None);
        let keyed = keys.queue_key(&env(), "emails", Some("user-1"));

        assert_eq!(
            keys.concurrency_limit_key_from_queue(&plain),
            keys.concurrency_limit_key_from_queue(&keyed)
        );
        assert_eq!(
            keys.concurrency_limit_key_from_queue(&keyed),
            "cl:e_123:emails"
        );
    }

    #[test]
    fn a_queue_literally_named_ck_parses() {
        let keys = DefaultKeyProducer::default();
        let child = keys.queue_key(&env(), "ck", None);
        assert_eq!(keys.queue_name_from_queue(&child), "ck");
        assert_eq!(keys.concurrency_key_from_queue(&child), None);
        assert_eq!(keys.org_id_from_queue(&child), "org_456");
    }
}
