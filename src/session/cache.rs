//! The sync cache: merged world state for cheap late-joiner catch-up.
//!
//! The session folds every world mutation from the app into this cache
//! so a newly joining client can be brought current by replaying a
//! compact stream instead of asking the app to re-send history. All
//! mutation goes through the session's rule hooks; nothing here touches
//! a transport.

use mremux_proto::{merge_value, payloads, Message};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Cached state of one actor. `initialization.payload["actor"]` is the
/// merged live state; `parentId` inside it defines the actor tree.
#[derive(Debug, Clone)]
pub struct SyncActor {
    /// The actor's id.
    pub actor_id: String,
    /// The (merged) initialize-actor message.
    pub initialization: Message,
    /// Animations attached since creation.
    pub created_animations: Vec<Message>,
    /// Currently running media instances.
    pub active_media_instances: Vec<MediaInstance>,
    /// Interpolations still in flight.
    pub active_interpolations: Vec<Message>,
    /// The actor's behavior, when one is set.
    pub behavior: Option<Message>,
    /// User currently grabbing the actor.
    pub grabbed_by: Option<String>,
    /// Inherited from the parent at insert time; never rewritten.
    pub exclusive_to_user: Option<String>,
}

impl SyncActor {
    /// The parent actor id, when the actor has one.
    pub fn parent_id(&self) -> Option<&str> {
        self.initialization
            .payload
            .get("actor")
            .and_then(|actor| actor.get("parentId"))
            .and_then(Value::as_str)
    }
}

/// One running media instance on an actor.
#[derive(Debug, Clone)]
pub struct MediaInstance {
    /// The media instance id.
    pub id: String,
    /// The set-media-state message that started it, merged with updates.
    pub message: Message,
}

/// Cached state of one asset.
#[derive(Debug, Clone)]
pub struct SyncAsset {
    /// The asset's id.
    pub id: String,
    /// Key of the creating message in the creator table.
    pub creator_message_id: String,
    /// Duration reported by the creation reply, for timed assets.
    pub duration: Option<f64>,
    /// Update buffered while the creation is in flight, or permanently
    /// for batch-loaded assets.
    pub update: Option<Message>,
    /// True until the creating request has been answered.
    pub pending: bool,
}

/// The in-memory merged world state of one session.
#[derive(Debug, Default)]
pub struct SyncCache {
    actors: HashMap<String, SyncActor>,
    assets: HashMap<String, SyncAsset>,
    asset_creators: HashMap<String, Message>,
    creator_order: Vec<String>,
    users: HashMap<String, Message>,
    user_order: Vec<String>,
}

/// The actor id a message operates on, regardless of payload shape.
pub fn target_actor_id(message: &Message) -> Option<&str> {
    message
        .payload
        .get("actor")
        .and_then(|actor| actor.get("id"))
        .and_then(Value::as_str)
        .or_else(|| message.payload.str_field("actorId"))
}

impl SyncCache {
    // ------------------------------------------------------------------
    // Actors
    // ------------------------------------------------------------------

    /// Record an actor initialization (including reservations).
    ///
    /// A real init arriving for a reserved placeholder keeps the
    /// bookkeeping that accumulated on the reservation: the reserved
    /// actor state is overlaid onto the new message's actor state and
    /// the merged message becomes the initialization.
    pub fn initialize_actor(&mut self, message: &Message) {
        let Some(actor) = message.payload.get("actor") else {
            warn!(kind = message.payload.kind(), "actor init without actor state");
            return;
        };
        let Some(actor_id) = actor.get("id").and_then(Value::as_str).map(String::from) else {
            warn!(kind = message.payload.kind(), "actor init without actor id");
            return;
        };

        if let Some(existing) = self.actors.get_mut(&actor_id) {
            let was_reserved =
                existing.initialization.payload.kind() == payloads::RESERVE_ACTOR;
            if was_reserved && message.payload.kind() != payloads::RESERVE_ACTOR {
                let reserved_state = existing
                    .initialization
                    .payload
                    .get("actor")
                    .cloned()
                    .unwrap_or(Value::Null);
                let mut initialization = message.clone();
                if let Some(slot) = initialization.payload.get_mut("actor") {
                    merge_value(slot, &reserved_state);
                }
                existing.initialization = initialization;
            } else {
                warn!(actor = %actor_id, "duplicate actor initialization ignored");
            }
            return;
        }

        let parent_exclusive = actor
            .get("parentId")
            .and_then(Value::as_str)
            .and_then(|parent| self.actors.get(parent))
            .and_then(|parent| parent.exclusive_to_user.clone());
        let exclusive_to_user = parent_exclusive.or_else(|| {
            actor
                .get("exclusiveToUser")
                .and_then(Value::as_str)
                .map(String::from)
        });

        self.actors.insert(
            actor_id.clone(),
            SyncActor {
                actor_id,
                initialization: message.clone(),
                created_animations: Vec::new(),
                active_media_instances: Vec::new(),
                active_interpolations: Vec::new(),
                behavior: None,
                grabbed_by: None,
                exclusive_to_user,
            },
        );
    }

    /// Deep-merge an actor update into the cached actor, then enforce
    /// the transform-space exclusion: at most one of `transform.app` and
    /// `transform.local.position/rotation` survives.
    pub fn update_actor(&mut self, message: &Message) {
        let Some(patch) = message.payload.get("actor") else {
            warn!("actor update without actor state");
            return;
        };
        let Some(actor_id) = patch.get("id").and_then(Value::as_str) else {
            warn!("actor update without actor id");
            return;
        };
        let Some(sync) = self.actors.get_mut(actor_id) else {
            warn!(actor = %actor_id, "update for unknown actor dropped");
            return;
        };

        if let Some(grabbed) = patch.get("grabbedBy") {
            sync.grabbed_by = grabbed.as_str().map(String::from);
        }

        let Some(target) = sync.initialization.payload.get_mut("actor") else {
            return;
        };
        merge_value(target, patch);

        let wrote_app = patch.pointer("/transform/app").is_some();
        let wrote_local = patch.pointer("/transform/local").is_some();
        if wrote_app {
            if let Some(local) = target
                .pointer_mut("/transform/local")
                .and_then(Value::as_object_mut)
            {
                local.remove("position");
                local.remove("rotation");
            }
        } else if wrote_local {
            if let Some(transform) = target
                .pointer_mut("/transform")
                .and_then(Value::as_object_mut)
            {
                transform.remove("app");
            }
        }
    }

    /// Remove the listed actors and their subtrees.
    pub fn destroy_actors(&mut self, message: &Message) {
        let Some(ids) = message.payload.get("actorIds").and_then(Value::as_array) else {
            warn!("destroy-actors without actorIds");
            return;
        };
        let mut doomed: HashSet<String> = ids
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();

        // Children go with their parents.
        loop {
            let mut grew = false;
            for actor in self.actors.values() {
                if doomed.contains(&actor.actor_id) {
                    continue;
                }
                if actor.parent_id().is_some_and(|p| doomed.contains(p)) {
                    doomed.insert(actor.actor_id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        self.actors.retain(|id, _| !doomed.contains(id));
    }

    /// An actor's owner, when the actor is exclusive to one user.
    pub fn exclusive_user_for(&self, message: &Message) -> Option<&str> {
        target_actor_id(message)
            .and_then(|id| self.actors.get(id))
            .and_then(|actor| actor.exclusive_to_user.as_deref())
    }

    /// Whether this actor id is cached.
    pub fn has_actor(&self, actor_id: &str) -> bool {
        self.actors.contains_key(actor_id)
    }

    /// The cached actor record.
    pub fn actor(&self, actor_id: &str) -> Option<&SyncActor> {
        self.actors.get(actor_id)
    }

    /// Number of cached actors.
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    // ------------------------------------------------------------------
    // Actor attachments
    // ------------------------------------------------------------------

    /// Record an animation created on an actor.
    pub fn record_animation(&mut self, message: &Message) {
        if let Some(actor) = self.target_actor_mut(message) {
            actor.created_animations.push(message.clone());
        }
    }

    /// Record an interpolation running on an actor.
    pub fn record_interpolation(&mut self, message: &Message) {
        if let Some(actor) = self.target_actor_mut(message) {
            actor.active_interpolations.push(message.clone());
        }
    }

    /// Set or clear an actor's behavior (`behaviorType: "none"` clears).
    pub fn set_behavior(&mut self, message: &Message) {
        let cleared = message.payload.str_field("behaviorType") == Some("none");
        if let Some(actor) = self.target_actor_mut(message) {
            actor.behavior = if cleared { None } else { Some(message.clone()) };
        }
    }

    /// Apply a media lifecycle message: start adds an instance, update
    /// merges into it, stop removes it.
    pub fn set_media_state(&mut self, message: &Message) {
        let Some(instance_id) = message.payload.str_field("id").map(String::from) else {
            warn!("set-media-state without instance id");
            return;
        };
        let command = message
            .payload
            .str_field("mediaCommand")
            .unwrap_or("start")
            .to_string();
        let Some(actor) = self.target_actor_mut(message) else {
            return;
        };
        match command.as_str() {
            "start" => actor.active_media_instances.push(MediaInstance {
                id: instance_id,
                message: message.clone(),
            }),
            "update" => {
                if let Some(instance) = actor
                    .active_media_instances
                    .iter_mut()
                    .find(|m| m.id == instance_id)
                {
                    // The stored message stays a "start" so replay can
                    // recreate the instance; only the settings merge.
                    for (key, value) in message.payload.fields() {
                        if key == "mediaCommand" {
                            continue;
                        }
                        let mut slot = instance
                            .message
                            .payload
                            .get_mut(key)
                            .map(std::mem::take)
                            .unwrap_or(Value::Null);
                        merge_value(&mut slot, value);
                        instance.message.payload.set(key.clone(), slot);
                    }
                }
            }
            "stop" => actor.active_media_instances.retain(|m| m.id != instance_id),
            other => warn!(command = other, "unknown media command ignored"),
        }
    }

    fn target_actor_mut(&mut self, message: &Message) -> Option<&mut SyncActor> {
        let Some(actor_id) = target_actor_id(message).map(String::from) else {
            warn!(kind = message.payload.kind(), "message names no actor");
            return None;
        };
        let found = self.actors.get_mut(&actor_id);
        if found.is_none() {
            warn!(actor = %actor_id, kind = message.payload.kind(), "message for unknown actor dropped");
        }
        found
    }

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    /// Record an asset-creating request. A `create-asset` names its
    /// asset up front, so a pending stub is installed for it; batch
    /// loads learn their ids from the reply.
    pub fn record_creator(&mut self, message: &Message) {
        if message.id.is_empty() {
            warn!("asset creator without message id dropped");
            return;
        }
        if self.asset_creators.contains_key(&message.id) {
            return;
        }
        self.asset_creators.insert(message.id.clone(), message.clone());
        self.creator_order.push(message.id.clone());

        if message.payload.kind() == payloads::CREATE_ASSET {
            if let Some(asset_id) = message
                .payload
                .get("definition")
                .and_then(|d| d.get("id"))
                .and_then(Value::as_str)
            {
                self.assets.insert(
                    asset_id.to_string(),
                    SyncAsset {
                        id: asset_id.to_string(),
                        creator_message_id: message.id.clone(),
                        duration: None,
                        update: None,
                        pending: true,
                    },
                );
            }
        }
    }

    /// Fold a creation reply back in: each reported asset becomes (or
    /// completes) a record, and an update buffered against a
    /// `create-asset` collapses into the creator's definition.
    pub fn creation_reply(&mut self, creator_id: &str, reply: &Message) {
        if !self.asset_creators.contains_key(creator_id) {
            warn!(creator = %creator_id, "creation reply for unknown creator");
            return;
        }
        let entries = reply
            .payload
            .get("assets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in entries {
            let Some(asset_id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let asset = self
                .assets
                .entry(asset_id.to_string())
                .or_insert_with(|| SyncAsset {
                    id: asset_id.to_string(),
                    creator_message_id: creator_id.to_string(),
                    duration: None,
                    update: None,
                    pending: true,
                });
            asset.duration = entry.get("duration").and_then(Value::as_f64);
            asset.pending = false;

            if let Some(update) = asset.update.take() {
                let creator_message_id = asset.creator_message_id.clone();
                if let Some(creator) = self.asset_creators.get_mut(&creator_message_id) {
                    if creator.payload.kind() == payloads::CREATE_ASSET {
                        if let (Some(definition), Some(patch)) = (
                            creator.payload.get_mut("definition"),
                            update.payload.get("asset"),
                        ) {
                            merge_value(definition, patch);
                            continue;
                        }
                    }
                }
                // Not collapsible; keep it buffered.
                if let Some(asset) = self.assets.get_mut(asset_id) {
                    asset.update = Some(update);
                }
            }
        }
    }

    /// Apply an asset update: merged into a completed `create-asset`
    /// definition, otherwise buffered (and merged with any earlier
    /// buffered update).
    pub fn update_asset(&mut self, message: &Message) {
        let Some(patch) = message.payload.get("asset") else {
            warn!("asset update without asset state");
            return;
        };
        let Some(asset_id) = patch.get("id").and_then(Value::as_str) else {
            warn!("asset update without asset id");
            return;
        };
        let Some(asset) = self.assets.get_mut(asset_id) else {
            warn!(asset = %asset_id, "update for unknown asset dropped");
            return;
        };

        let creator_kind = self
            .asset_creators
            .get(&asset.creator_message_id)
            .map(|creator| creator.payload.kind().to_string());

        if creator_kind.as_deref() == Some(payloads::CREATE_ASSET) && !asset.pending {
            if let Some(creator) = self.asset_creators.get_mut(&asset.creator_message_id) {
                if let Some(definition) = creator.payload.get_mut("definition") {
                    merge_value(definition, patch);
                }
            }
        } else {
            match &mut asset.update {
                Some(buffered) => {
                    if let Some(slot) = buffered.payload.get_mut("asset") {
                        merge_value(slot, patch);
                    }
                }
                None => asset.update = Some(message.clone()),
            }
        }
    }

    /// Drop every creator whose container matches, and every asset those
    /// creators produced.
    pub fn unload_container(&mut self, container_id: &str) {
        let dropped: HashSet<String> = self
            .asset_creators
            .iter()
            .filter(|(_, creator)| {
                creator.payload.str_field("containerId") == Some(container_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        if dropped.is_empty() {
            return;
        }
        self.asset_creators.retain(|id, _| !dropped.contains(id));
        self.creator_order.retain(|id| !dropped.contains(id));
        self.assets
            .retain(|_, asset| !dropped.contains(&asset.creator_message_id));
    }

    /// The cached asset record.
    pub fn asset(&self, asset_id: &str) -> Option<&SyncAsset> {
        self.assets.get(asset_id)
    }

    /// The recorded creator message.
    pub fn creator(&self, message_id: &str) -> Option<&Message> {
        self.asset_creators.get(message_id)
    }

    /// Number of recorded creators.
    pub fn creator_count(&self) -> usize {
        self.asset_creators.len()
    }

    /// Number of cached assets.
    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Record a joined user by their join message.
    pub fn record_user(&mut self, user_id: &str, message: &Message) {
        if self.users.insert(user_id.to_string(), message.clone()).is_none() {
            self.user_order.push(user_id.to_string());
        }
    }

    /// Forget a user.
    pub fn remove_user(&mut self, user_id: &str) {
        if self.users.remove(user_id).is_some() {
            self.user_order.retain(|id| id != user_id);
        }
    }

    /// Number of known users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Build the ordered catch-up stream for a newly joining client:
    /// users, then asset creators, then buffered asset updates, then
    /// actors parent-first — each actor followed by its animations,
    /// media, behavior, and interpolations.
    pub fn replay(&self) -> Vec<Message> {
        let mut out = Vec::new();

        for user_id in &self.user_order {
            if let Some(message) = self.users.get(user_id) {
                out.push(message.clone());
            }
        }

        for creator_id in &self.creator_order {
            if let Some(message) = self.asset_creators.get(creator_id) {
                out.push(message.clone());
            }
        }
        for creator_id in &self.creator_order {
            let mut updates: Vec<&SyncAsset> = self
                .assets
                .values()
                .filter(|a| &a.creator_message_id == creator_id && a.update.is_some())
                .collect();
            updates.sort_by(|a, b| a.id.cmp(&b.id));
            for asset in updates {
                if let Some(update) = &asset.update {
                    out.push(update.clone());
                }
            }
        }

        for actor in self.actors_parent_first() {
            out.push(actor.initialization.clone());
            out.extend(actor.created_animations.iter().cloned());
            out.extend(
                actor
                    .active_media_instances
                    .iter()
                    .map(|instance| instance.message.clone()),
            );
            if let Some(behavior) = &actor.behavior {
                out.push(behavior.clone());
            }
            out.extend(actor.active_interpolations.iter().cloned());
        }

        out
    }

    fn actors_parent_first(&self) -> Vec<&SyncActor> {
        let mut order: Vec<&SyncActor> = Vec::with_capacity(self.actors.len());
        let mut emitted: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&SyncActor> = self.actors.values().collect();
        remaining.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));

        while !remaining.is_empty() {
            let mut progressed = false;
            remaining.retain(|actor| {
                let ready = match actor.parent_id() {
                    Some(parent) => {
                        emitted.contains(parent) || !self.actors.contains_key(parent)
                    }
                    None => true,
                };
                if ready {
                    emitted.insert(actor.actor_id.as_str());
                    order.push(*actor);
                    progressed = true;
                }
                !ready
            });
            if !progressed {
                warn!("actor parent cycle detected during replay");
                order.append(&mut remaining);
                break;
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mremux_proto::Payload;
    use serde_json::json;

    fn message(kind: &str, id: &str, payload_fields: Value) -> Message {
        let mut payload = Payload::new(kind);
        if let Value::Object(map) = payload_fields {
            for (key, value) in map {
                payload.set(key, value);
            }
        }
        let mut msg = Message::request(payload);
        msg.id = id.to_string();
        msg
    }

    fn create_actor(id: &str, actor: Value) -> Message {
        let mut actor = actor;
        actor["id"] = json!(id);
        message(payloads::CREATE_ACTOR, &format!("init-{id}"), json!({"actor": actor}))
    }

    #[test]
    fn reserve_then_initialize_keeps_reserved_state() {
        let mut cache = SyncCache::default();
        cache.initialize_actor(&message(
            payloads::RESERVE_ACTOR,
            "r1",
            json!({"actor": {"id": "A1", "exclusiveToUser": "U1"}}),
        ));

        let init = message(
            payloads::CREATE_ACTOR,
            "c1",
            json!({"actor": {"id": "A1", "name": "door"}}),
        );
        cache.initialize_actor(&init);

        let actor = cache.actor("A1").unwrap();
        assert_eq!(actor.initialization.payload.kind(), payloads::CREATE_ACTOR);
        assert_eq!(actor.initialization.id, "c1");
        let state = actor.initialization.payload.get("actor").unwrap();
        assert_eq!(state["exclusiveToUser"], "U1");
        assert_eq!(state["name"], "door");
        assert_eq!(actor.exclusive_to_user.as_deref(), Some("U1"));
    }

    #[test]
    fn exclusivity_is_inherited_from_parent() {
        let mut cache = SyncCache::default();
        cache.initialize_actor(&create_actor("parent", json!({"exclusiveToUser": "U9"})));
        cache.initialize_actor(&create_actor("child", json!({"parentId": "parent"})));
        assert_eq!(
            cache.actor("child").unwrap().exclusive_to_user.as_deref(),
            Some("U9")
        );
    }

    #[test]
    fn transform_update_keeps_exactly_one_space() {
        let mut cache = SyncCache::default();
        cache.initialize_actor(&create_actor(
            "A1",
            json!({"transform": {"local": {"position": {"x": 1.0}, "rotation": {"y": 0.5}, "scale": {"x": 2.0}}}}),
        ));

        cache.update_actor(&message(
            payloads::ACTOR_UPDATE,
            "u1",
            json!({"actor": {"id": "A1", "transform": {"app": {"position": {"x": 9.0}, "rotation": {"y": 1.0}}}}}),
        ));

        let state = cache
            .actor("A1")
            .unwrap()
            .initialization
            .payload
            .get("actor")
            .unwrap()
            .clone();
        assert_eq!(state.pointer("/transform/app/position/x"), Some(&json!(9.0)));
        assert!(state.pointer("/transform/local/position").is_none());
        assert!(state.pointer("/transform/local/rotation").is_none());
        // Scale is not part of the exclusion rule.
        assert_eq!(state.pointer("/transform/local/scale/x"), Some(&json!(2.0)));

        // And back the other way.
        cache.update_actor(&message(
            payloads::ACTOR_UPDATE,
            "u2",
            json!({"actor": {"id": "A1", "transform": {"local": {"position": {"x": 4.0}}}}}),
        ));
        let state = cache
            .actor("A1")
            .unwrap()
            .initialization
            .payload
            .get("actor")
            .unwrap()
            .clone();
        assert!(state.pointer("/transform/app").is_none());
        assert_eq!(state.pointer("/transform/local/position/x"), Some(&json!(4.0)));
    }

    #[test]
    fn actor_update_is_idempotent() {
        let mut cache = SyncCache::default();
        cache.initialize_actor(&create_actor("A1", json!({"name": "n"})));
        let update = message(
            payloads::ACTOR_UPDATE,
            "u1",
            json!({"actor": {"id": "A1", "tags": ["x"], "transform": {"app": {"position": {"x": 1.0}}}}}),
        );
        cache.update_actor(&update);
        let once = cache.actor("A1").unwrap().initialization.clone();
        cache.update_actor(&update);
        let twice = cache.actor("A1").unwrap().initialization.clone();
        assert_eq!(once, twice);
    }

    #[test]
    fn destroy_removes_subtrees() {
        let mut cache = SyncCache::default();
        cache.initialize_actor(&create_actor("root", json!({})));
        cache.initialize_actor(&create_actor("mid", json!({"parentId": "root"})));
        cache.initialize_actor(&create_actor("leaf", json!({"parentId": "mid"})));
        cache.initialize_actor(&create_actor("other", json!({})));

        cache.destroy_actors(&message(
            payloads::DESTROY_ACTORS,
            "d1",
            json!({"actorIds": ["root"]}),
        ));

        assert!(!cache.has_actor("root"));
        assert!(!cache.has_actor("mid"));
        assert!(!cache.has_actor("leaf"));
        assert!(cache.has_actor("other"));
    }

    #[test]
    fn create_then_update_collapses_on_reply() {
        let mut cache = SyncCache::default();
        let creator = message(
            payloads::CREATE_ASSET,
            "M1",
            json!({"containerId": "CT1", "definition": {"id": "X", "color": {"r": 1.0}}}),
        );
        cache.record_creator(&creator);
        assert!(cache.asset("X").unwrap().pending);

        // Update arrives while the create is in flight: buffered.
        cache.update_asset(&message(
            payloads::ASSET_UPDATE,
            "u1",
            json!({"asset": {"id": "X", "color": {"g": 0.5}}}),
        ));
        assert!(cache.asset("X").unwrap().update.is_some());

        // Reply lands: the buffered update collapses into the definition.
        cache.creation_reply("M1", &message(
            payloads::ASSETS_LOADED,
            "r1",
            json!({"assets": [{"id": "X", "duration": 2.5}]}),
        ));

        let asset = cache.asset("X").unwrap();
        assert!(asset.update.is_none());
        assert!(!asset.pending);
        assert_eq!(asset.duration, Some(2.5));
        let definition = cache.creator("M1").unwrap().payload.get("definition").unwrap();
        assert_eq!(definition["color"]["r"], 1.0);
        assert_eq!(definition["color"]["g"], 0.5);

        // Post-reply updates merge straight into the definition.
        cache.update_asset(&message(
            payloads::ASSET_UPDATE,
            "u2",
            json!({"asset": {"id": "X", "color": {"b": 0.25}}}),
        ));
        let definition = cache.creator("M1").unwrap().payload.get("definition").unwrap();
        assert_eq!(definition["color"]["b"], 0.25);
        assert!(cache.asset("X").unwrap().update.is_none());
    }

    #[test]
    fn create_then_update_equals_create_with_merged_update() {
        let update = json!({"color": {"g": 0.5}});

        let mut stepped = SyncCache::default();
        stepped.record_creator(&message(
            payloads::CREATE_ASSET,
            "M1",
            json!({"definition": {"id": "X", "color": {"r": 1.0}}}),
        ));
        stepped.update_asset(&message(
            payloads::ASSET_UPDATE,
            "u1",
            json!({"asset": {"id": "X", "color": {"g": 0.5}}}),
        ));
        stepped.creation_reply("M1", &message(
            payloads::ASSETS_LOADED,
            "r1",
            json!({"assets": [{"id": "X"}]}),
        ));

        let mut merged_up_front = SyncCache::default();
        let mut definition = json!({"id": "X", "color": {"r": 1.0}});
        merge_value(&mut definition, &update);
        merged_up_front.record_creator(&message(
            payloads::CREATE_ASSET,
            "M1",
            json!({"definition": definition}),
        ));
        merged_up_front.creation_reply("M1", &message(
            payloads::ASSETS_LOADED,
            "r1",
            json!({"assets": [{"id": "X"}]}),
        ));

        assert_eq!(
            stepped.creator("M1").unwrap().payload.get("definition"),
            merged_up_front.creator("M1").unwrap().payload.get("definition"),
        );
    }

    #[test]
    fn load_assets_updates_stay_buffered() {
        let mut cache = SyncCache::default();
        cache.record_creator(&message(
            payloads::LOAD_ASSETS,
            "M2",
            json!({"containerId": "CT1", "source": {"uri": "scene.glb"}}),
        ));
        cache.creation_reply("M2", &message(
            payloads::ASSETS_LOADED,
            "r1",
            json!({"assets": [{"id": "A"}]}),
        ));

        cache.update_asset(&message(
            payloads::ASSET_UPDATE,
            "u1",
            json!({"asset": {"id": "A", "volume": 0.5}}),
        ));
        cache.update_asset(&message(
            payloads::ASSET_UPDATE,
            "u2",
            json!({"asset": {"id": "A", "pitch": 2.0}}),
        ));

        let buffered = cache.asset("A").unwrap().update.as_ref().unwrap();
        let state = buffered.payload.get("asset").unwrap();
        assert_eq!(state["volume"], 0.5);
        assert_eq!(state["pitch"], 2.0);
    }

    #[test]
    fn unload_cascades_through_creators_and_assets() {
        let mut cache = SyncCache::default();
        cache.record_creator(&message(
            payloads::LOAD_ASSETS,
            "M1",
            json!({"containerId": "CT1"}),
        ));
        cache.record_creator(&message(
            payloads::LOAD_ASSETS,
            "M2",
            json!({"containerId": "CT1"}),
        ));
        cache.record_creator(&message(
            payloads::LOAD_ASSETS,
            "M3",
            json!({"containerId": "CT2"}),
        ));
        cache.creation_reply("M1", &message(
            payloads::ASSETS_LOADED,
            "r1",
            json!({"assets": [{"id": "A"}, {"id": "B"}]}),
        ));
        cache.creation_reply("M2", &message(
            payloads::ASSETS_LOADED,
            "r2",
            json!({"assets": [{"id": "C"}]}),
        ));
        cache.creation_reply("M3", &message(
            payloads::ASSETS_LOADED,
            "r3",
            json!({"assets": [{"id": "D"}]}),
        ));

        cache.unload_container("CT1");

        assert!(cache.creator("M1").is_none());
        assert!(cache.creator("M2").is_none());
        assert!(cache.creator("M3").is_some());
        assert!(cache.asset("A").is_none());
        assert!(cache.asset("B").is_none());
        assert!(cache.asset("C").is_none());
        assert!(cache.asset("D").is_some());
    }

    #[test]
    fn replay_orders_users_creators_updates_actors() {
        let mut cache = SyncCache::default();
        cache.record_user("U1", &message(
            payloads::USER_JOINED,
            "j1",
            json!({"user": {"id": "U1"}}),
        ));
        cache.record_creator(&message(
            payloads::LOAD_ASSETS,
            "M1",
            json!({"containerId": "CT1"}),
        ));
        cache.creation_reply("M1", &message(
            payloads::ASSETS_LOADED,
            "r1",
            json!({"assets": [{"id": "A"}]}),
        ));
        cache.update_asset(&message(
            payloads::ASSET_UPDATE,
            "au1",
            json!({"asset": {"id": "A", "volume": 1.0}}),
        ));
        cache.initialize_actor(&create_actor("child", json!({"parentId": "root"})));
        cache.initialize_actor(&create_actor("root", json!({})));
        cache.record_animation(&message(
            payloads::CREATE_ANIMATION,
            "an1",
            json!({"actorId": "root"}),
        ));

        let kinds: Vec<(String, String)> = cache
            .replay()
            .iter()
            .map(|m| (m.payload.kind().to_string(), m.id.clone()))
            .collect();

        let expected: Vec<(String, String)> = vec![
            (payloads::USER_JOINED.into(), "j1".into()),
            (payloads::LOAD_ASSETS.into(), "M1".into()),
            (payloads::ASSET_UPDATE.into(), "au1".into()),
            (payloads::CREATE_ACTOR.into(), "init-root".into()),
            (payloads::CREATE_ANIMATION.into(), "an1".into()),
            (payloads::CREATE_ACTOR.into(), "init-child".into()),
        ];
        assert_eq!(kinds, expected);
    }

    #[test]
    fn media_lifecycle_start_update_stop() {
        let mut cache = SyncCache::default();
        cache.initialize_actor(&create_actor("A1", json!({})));

        cache.set_media_state(&message(
            payloads::SET_MEDIA_STATE,
            "m1",
            json!({"actorId": "A1", "id": "media-1", "mediaCommand": "start", "options": {"volume": 0.3}}),
        ));
        assert_eq!(cache.actor("A1").unwrap().active_media_instances.len(), 1);

        cache.set_media_state(&message(
            payloads::SET_MEDIA_STATE,
            "m2",
            json!({"actorId": "A1", "id": "media-1", "mediaCommand": "update", "options": {"volume": 0.9}}),
        ));
        let instance = &cache.actor("A1").unwrap().active_media_instances[0];
        assert_eq!(
            instance.message.payload.get("options").unwrap()["volume"],
            0.9
        );

        cache.set_media_state(&message(
            payloads::SET_MEDIA_STATE,
            "m3",
            json!({"actorId": "A1", "id": "media-1", "mediaCommand": "stop"}),
        ));
        assert!(cache.actor("A1").unwrap().active_media_instances.is_empty());
    }
}
