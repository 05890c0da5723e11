//! Protocol constants: the payload-type vocabulary, the protocol
//! version, and the transport header naming the session.

/// Protocol version exchanged during handshake. Peers answering with a
/// different version are refused.
pub const PROTOCOL_VERSION: u32 = 1;

/// Transport header carrying the session id on an incoming client
/// connection. Absent header means a fresh session.
pub const SESSION_ID_HEADER: &str = "x-ms-mixed-reality-extension-sid";

/// Payload type names understood by the multiplexer core.
///
/// Anything not listed here is routed through the default rule:
/// forwarded unchanged, never cached.
pub mod payloads {
    /// Phase negotiation: opens every connection.
    pub const HANDSHAKE: &str = "handshake";
    /// Reply to [`HANDSHAKE`]; carries the peer version and, from engine
    /// clients, the user id.
    pub const HANDSHAKE_REPLY: &str = "handshake-reply";
    /// Closes the handshake phase.
    pub const HANDSHAKE_COMPLETE: &str = "handshake-complete";
    /// Ends a sync phase: world replay is complete.
    pub const SYNC_COMPLETE: &str = "sync-complete";
    /// Liveness probe; only the authoritative client's answer matters.
    pub const HEARTBEAT: &str = "heartbeat";

    /// Create an actor from an explicit definition.
    pub const CREATE_ACTOR: &str = "create-actor";
    /// Create an actor from a library resource.
    pub const CREATE_FROM_LIBRARY: &str = "create-from-library";
    /// Create an actor from a prefab.
    pub const CREATE_FROM_PREFAB: &str = "create-from-prefab";
    /// Placeholder for an actor whose real init has not arrived yet.
    pub const RESERVE_ACTOR: &str = "x-reserve-actor";
    /// Patch an existing actor's state.
    pub const ACTOR_UPDATE: &str = "actor-update";
    /// Remove actors (and their subtrees).
    pub const DESTROY_ACTORS: &str = "destroy-actors";

    /// Create a single asset from a definition.
    pub const CREATE_ASSET: &str = "create-asset";
    /// Load a batch of assets from a source.
    pub const LOAD_ASSETS: &str = "load-assets";
    /// Reply to an asset creator: the ids (and durations) that now exist.
    pub const ASSETS_LOADED: &str = "assets-loaded";
    /// Patch an existing asset's state.
    pub const ASSET_UPDATE: &str = "asset-update";
    /// Drop every asset belonging to a container.
    pub const UNLOAD_ASSETS: &str = "unload-assets";

    /// A user joined an engine client.
    pub const USER_JOINED: &str = "user-joined";
    /// A user left (sent upstream when their client disconnects).
    pub const USER_LEFT: &str = "user-left";

    /// Attach an animation to an actor.
    pub const CREATE_ANIMATION: &str = "create-animation";
    /// Set or clear an actor's behavior.
    pub const SET_BEHAVIOR: &str = "set-behavior";
    /// Start, update, or stop a media instance on an actor.
    pub const SET_MEDIA_STATE: &str = "set-media-state";
    /// Run a client-side interpolation on an actor.
    pub const INTERPOLATE_ACTOR: &str = "interpolate-actor";

    /// Generic operation outcome.
    pub const OPERATION_RESULT: &str = "operation-result";
    /// Diagnostic traces.
    pub const TRACES: &str = "traces";
}

/// Whether a payload type creates an actor record when first seen.
pub fn initializes_actor(kind: &str) -> bool {
    matches!(
        kind,
        payloads::CREATE_ACTOR
            | payloads::CREATE_FROM_LIBRARY
            | payloads::CREATE_FROM_PREFAB
            | payloads::RESERVE_ACTOR
    )
}

/// Whether a payload type records an asset creator when first seen.
pub fn creates_assets(kind: &str) -> bool {
    matches!(kind, payloads::CREATE_ASSET | payloads::LOAD_ASSETS)
}
