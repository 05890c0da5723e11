//! Per-payload-type routing rules.
//!
//! The rules table is the session's policy layer, one [`Rule`] per
//! payload type: consulted when a message from the app is about to fan
//! out, when a message from a client is about to reach the app, and
//! when anything is queued for a client that has not finished joining.
//! Cache mutation happens inside the hooks, so the cache and the
//! forwarded stream can never disagree.
//!
//! Unknown types fall through to [`MissingRule`]: identity hooks plus a
//! warning, so new payloads flow before the core learns their names.

use super::cache::SyncCache;
use mremux_proto::{payloads, Message};
use std::collections::HashMap;
use tracing::warn;

/// Verdict from a rule hook.
#[derive(Debug)]
pub enum RuleOutcome {
    /// Forward the (possibly rewritten) message.
    Forward(Message),
    /// Drop it. Drops are silent; an attached reply sink is rejected by
    /// the caller.
    Drop,
}

/// Policy hooks for one payload type. Every hook defaults to identity.
pub trait Rule: Send + Sync {
    /// App → session, before fan-out.
    fn before_receive_from_app(&self, _cache: &mut SyncCache, message: Message) -> RuleOutcome {
        RuleOutcome::Forward(message)
    }

    /// Client → session, before forwarding upstream.
    fn before_receive_from_client(
        &self,
        _cache: &mut SyncCache,
        _client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        RuleOutcome::Forward(message)
    }

    /// Before queueing for a client that has not reached execution.
    /// `snapshot_taken` is false until the client's sync replay snapshot
    /// exists; cache-backed payloads queued before then are covered by
    /// the replay and should be dropped here.
    fn before_queue_for_client(
        &self,
        _cache: &SyncCache,
        _client_user: Option<&str>,
        _snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        RuleOutcome::Forward(message)
    }

    /// Whether fan-out of this payload expects a reply from clients.
    fn expects_client_reply(&self) -> bool {
        false
    }
}

/// Queue verdict shared by every cache-backed payload: covered by the
/// sync replay until the snapshot exists, and never delivered to a
/// client excluded by actor exclusivity.
fn queue_cache_backed(
    cache: &SyncCache,
    client_user: Option<&str>,
    snapshot_taken: bool,
    message: Message,
) -> RuleOutcome {
    if !snapshot_taken {
        return RuleOutcome::Drop;
    }
    if excluded_for(cache, client_user, &message) {
        return RuleOutcome::Drop;
    }
    RuleOutcome::Forward(message)
}

/// Whether the message targets an actor exclusive to a different user.
pub(crate) fn excluded_for(
    cache: &SyncCache,
    client_user: Option<&str>,
    message: &Message,
) -> bool {
    match cache.exclusive_user_for(message) {
        Some(owner) => client_user != Some(owner),
        None => false,
    }
}

// ----------------------------------------------------------------------
// Actor rules
// ----------------------------------------------------------------------

struct ActorInitRule;

impl Rule for ActorInitRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        cache.initialize_actor(&message);
        if message.payload.kind() == payloads::RESERVE_ACTOR {
            // Reservations are session bookkeeping; engines never see them.
            return RuleOutcome::Drop;
        }
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }
}

struct ActorUpdateRule;

impl Rule for ActorUpdateRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        cache.update_actor(&message);
        RuleOutcome::Forward(message)
    }

    fn before_receive_from_client(
        &self,
        cache: &mut SyncCache,
        _client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        // Engine-driven actor motion keeps the cache current too.
        cache.update_actor(&message);
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }
}

struct DestroyActorsRule;

impl Rule for DestroyActorsRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        cache.destroy_actors(&message);
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }
}

struct ActorAttachmentRule;

impl Rule for ActorAttachmentRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        match message.payload.kind() {
            payloads::CREATE_ANIMATION => cache.record_animation(&message),
            payloads::SET_BEHAVIOR => cache.set_behavior(&message),
            payloads::SET_MEDIA_STATE => cache.set_media_state(&message),
            payloads::INTERPOLATE_ACTOR => cache.record_interpolation(&message),
            other => warn!(kind = other, "attachment rule saw unexpected payload"),
        }
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }
}

// ----------------------------------------------------------------------
// Asset rules
// ----------------------------------------------------------------------

struct AssetCreatorRule;

impl Rule for AssetCreatorRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        cache.record_creator(&message);
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }

    fn expects_client_reply(&self) -> bool {
        true
    }
}

struct AssetUpdateRule;

impl Rule for AssetUpdateRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        cache.update_asset(&message);
        RuleOutcome::Forward(message)
    }

    fn before_receive_from_client(
        &self,
        cache: &mut SyncCache,
        _client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        cache.update_asset(&message);
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }
}

struct UnloadAssetsRule;

impl Rule for UnloadAssetsRule {
    fn before_receive_from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        match message.payload.str_field("containerId") {
            Some(container_id) => cache.unload_container(container_id),
            None => warn!("unload-assets without containerId"),
        }
        RuleOutcome::Forward(message)
    }

    fn before_queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        queue_cache_backed(cache, client_user, snapshot_taken, message)
    }
}

// ----------------------------------------------------------------------
// User rules
// ----------------------------------------------------------------------

struct UserJoinedRule;

impl Rule for UserJoinedRule {
    fn before_receive_from_client(
        &self,
        cache: &mut SyncCache,
        _client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        match message
            .payload
            .get("user")
            .and_then(|user| user.get("id"))
            .and_then(serde_json::Value::as_str)
        {
            Some(user_id) => cache.record_user(user_id, &message),
            None => warn!("user-joined without user id"),
        }
        RuleOutcome::Forward(message)
    }
}

struct UserLeftRule;

impl Rule for UserLeftRule {
    fn before_receive_from_client(
        &self,
        cache: &mut SyncCache,
        _client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        match message.payload.str_field("userId") {
            Some(user_id) => cache.remove_user(user_id),
            None => warn!("user-left without userId"),
        }
        RuleOutcome::Forward(message)
    }
}

// ----------------------------------------------------------------------
// Misc rules
// ----------------------------------------------------------------------

struct HeartbeatRule;

impl Rule for HeartbeatRule {
    fn expects_client_reply(&self) -> bool {
        true
    }
}

/// Fallback for payload types without a registered rule.
struct MissingRule;

impl Rule for MissingRule {
    fn before_receive_from_app(&self, _cache: &mut SyncCache, message: Message) -> RuleOutcome {
        warn!(kind = message.payload.kind(), "no rule for payload type from app");
        RuleOutcome::Forward(message)
    }

    fn before_receive_from_client(
        &self,
        _cache: &mut SyncCache,
        _client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        warn!(kind = message.payload.kind(), "no rule for payload type from client");
        RuleOutcome::Forward(message)
    }
}

// ----------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------

/// Registry of payload-type rules with a shared fallback.
pub struct Rules {
    rules: HashMap<&'static str, Box<dyn Rule>>,
    missing: MissingRule,
}

impl Rules {
    /// The standard table: every payload type the core interprets.
    pub fn new() -> Self {
        let mut rules: HashMap<&'static str, Box<dyn Rule>> = HashMap::new();

        for kind in [
            payloads::CREATE_ACTOR,
            payloads::CREATE_FROM_LIBRARY,
            payloads::CREATE_FROM_PREFAB,
            payloads::RESERVE_ACTOR,
        ] {
            rules.insert(kind, Box::new(ActorInitRule));
        }
        rules.insert(payloads::ACTOR_UPDATE, Box::new(ActorUpdateRule));
        rules.insert(payloads::DESTROY_ACTORS, Box::new(DestroyActorsRule));
        for kind in [
            payloads::CREATE_ANIMATION,
            payloads::SET_BEHAVIOR,
            payloads::SET_MEDIA_STATE,
            payloads::INTERPOLATE_ACTOR,
        ] {
            rules.insert(kind, Box::new(ActorAttachmentRule));
        }

        rules.insert(payloads::CREATE_ASSET, Box::new(AssetCreatorRule));
        rules.insert(payloads::LOAD_ASSETS, Box::new(AssetCreatorRule));
        rules.insert(payloads::ASSET_UPDATE, Box::new(AssetUpdateRule));
        rules.insert(payloads::UNLOAD_ASSETS, Box::new(UnloadAssetsRule));

        rules.insert(payloads::USER_JOINED, Box::new(UserJoinedRule));
        rules.insert(payloads::USER_LEFT, Box::new(UserLeftRule));

        rules.insert(payloads::HEARTBEAT, Box::new(HeartbeatRule));

        Self {
            rules,
            missing: MissingRule,
        }
    }

    fn rule_for(&self, kind: &str) -> &dyn Rule {
        match self.rules.get(kind) {
            Some(rule) => rule.as_ref(),
            None => &self.missing,
        }
    }

    /// Run the app-side receive hook.
    pub fn from_app(&self, cache: &mut SyncCache, message: Message) -> RuleOutcome {
        self.rule_for(message.payload.kind())
            .before_receive_from_app(cache, message)
    }

    /// Run the client-side receive hook.
    pub fn from_client(
        &self,
        cache: &mut SyncCache,
        client_user: Option<&str>,
        message: Message,
    ) -> RuleOutcome {
        self.rule_for(message.payload.kind())
            .before_receive_from_client(cache, client_user, message)
    }

    /// Run the queue hook for a not-yet-executing client.
    pub fn queue_for_client(
        &self,
        cache: &SyncCache,
        client_user: Option<&str>,
        snapshot_taken: bool,
        message: Message,
    ) -> RuleOutcome {
        self.rule_for(message.payload.kind()).before_queue_for_client(
            cache,
            client_user,
            snapshot_taken,
            message,
        )
    }

    /// Whether fan-out of this payload type expects client replies.
    pub fn expects_client_reply(&self, kind: &str) -> bool {
        self.rule_for(kind).expects_client_reply()
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self::new()
    }
}
