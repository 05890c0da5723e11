//! Replay semantics: ordering, the create-then-update collapse seen
//! end-to-end, and the replay fixpoint law — feeding a replay into a
//! fresh cache reproduces the same replay.

mod common;

use common::{TestApp, TestEngine};
use mremux::proto::{payloads, Message, Payload};
use mremux::session::cache::SyncCache;
use mremux::session::rules::Rules;
use mremux::{transport, MuxConfig, Session};
use serde_json::{json, Value};
use std::sync::Arc;

fn world_msg(kind: &str, id: &str, fields: Value) -> Message {
    let mut payload = Payload::new(kind);
    if let Value::Object(map) = fields {
        for (key, value) in map {
            payload.set(key, value);
        }
    }
    let mut message = Message::request(payload);
    message.id = id.to_string();
    message
}

fn world() -> Vec<Message> {
    vec![
        world_msg(
            payloads::CREATE_ASSET,
            "M1",
            json!({"containerId": "ct1", "definition": {"id": "X", "color": {"r": 1.0}}}),
        ),
        world_msg(
            payloads::ASSET_UPDATE,
            "au1",
            json!({"asset": {"id": "X", "color": {"g": 0.5}}}),
        ),
        world_msg(
            payloads::CREATE_ACTOR,
            "init-root",
            json!({"actor": {"id": "root"}}),
        ),
        world_msg(
            payloads::CREATE_ACTOR,
            "init-child",
            json!({"actor": {"id": "child", "parentId": "root"}}),
        ),
        world_msg(
            payloads::CREATE_ANIMATION,
            "anim-1",
            json!({"actorId": "root"}),
        ),
    ]
}

async fn start_session() -> (Arc<Session>, TestApp) {
    let (app_side, session_side) = transport::pair();
    let session = Session::spawn("replay-session", session_side, MuxConfig::default());
    let mut app = TestApp::new(app_side);
    app.serve_preamble(world()).await.unwrap();
    (session, app)
}

async fn join(session: &Arc<Session>, user: &str) -> (TestEngine, Vec<Message>) {
    let (engine_side, session_side) = transport::pair();
    let client_id = session.add_client(session_side);
    let mut engine = TestEngine::new(engine_side);
    let replay = engine.join(Some(user)).await.unwrap();
    session.client_settled(&client_id).await;
    (engine, replay)
}

#[tokio::test(start_paused = true)]
async fn replay_orders_creators_before_updates_before_actors() {
    common::init_tracing();
    let (session, _app) = start_session().await;

    let (_engine, replay) = join(&session, "U1").await;
    let ids: Vec<&str> = replay.iter().map(|m| m.id.as_str()).collect();
    // Creator, its buffered update, then actors parent-first with the
    // root's animation right after the root.
    assert_eq!(ids, ["M1", "au1", "init-root", "anim-1", "init-child"]);
}

#[tokio::test(start_paused = true)]
async fn buffered_update_collapses_once_the_authority_loads_the_asset() {
    common::init_tracing();
    let (session, _app) = start_session().await;

    // The first joiner is authoritative; its assets-loaded answer
    // completes the pending asset and collapses the buffered update.
    let (_first, _) = join(&session, "U1").await;

    let (_second, replay) = join(&session, "U2").await;
    // No buffered update left to replay.
    assert!(replay.iter().all(|m| m.payload.kind() != payloads::ASSET_UPDATE));
    let creator = replay
        .iter()
        .find(|m| m.payload.kind() == payloads::CREATE_ASSET)
        .expect("creator must replay");
    let definition = creator.payload.get("definition").unwrap();
    assert_eq!(definition["color"]["r"], 1.0);
    assert_eq!(definition["color"]["g"], 0.5);
}

#[tokio::test(start_paused = true)]
async fn replay_reaches_a_fixpoint_in_a_fresh_cache() {
    common::init_tracing();
    let (session, _app) = start_session().await;
    let (_first, _) = join(&session, "U1").await;
    let (_second, replay) = join(&session, "U2").await;

    // A fresh cache fed the replay reproduces the replay, element for
    // element: syncing a new client from a synced client's view of the
    // world changes nothing.
    let rules = Rules::new();
    let mut cache = SyncCache::default();
    for message in &replay {
        let _ = rules.from_app(&mut cache, message.clone());
    }
    assert_eq!(cache.replay(), replay);
}
