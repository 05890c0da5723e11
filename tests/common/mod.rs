//! Integration test common infrastructure.
//!
//! Provides a scripted upstream app endpoint, a scripted engine client,
//! and small helpers for driving sessions over in-memory transports.

pub mod app;
pub mod engine;

#[allow(unused_imports)]
pub use app::TestApp;
#[allow(unused_imports)]
pub use engine::TestEngine;

use std::time::Duration;

/// Receive timeout for every scripted endpoint. Tests run with a paused
/// clock, so this bounds hangs without slowing anything down.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test subscriber once so failures come with context.
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or the attempt budget runs out.
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
