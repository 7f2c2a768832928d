//! Presence timeline with production timings, driven on a paused clock.

use chat_presence::{PresenceConfig, PresenceTracker};
use std::time::Duration;
use tokio::time::advance;

// Heartbeats stop with a 15s interval and a 3x threshold: still online at
// 20s of silence, offline only after 45s, with exactly one transition.
#[tokio::test(start_paused = true)]
async fn heartbeat_silence_goes_offline_once_after_threshold() {
    let tracker = PresenceTracker::new(PresenceConfig::default());
    let mut updates = tracker.subscribe();
    tracker.start();

    tracker.record_heartbeat("alice");
    let online = updates.recv().await.unwrap();
    assert!(online.online);
    let last_seen = tracker.status("alice").unwrap().last_seen_at;

    // 20s of silence: one missed heartbeat is not offline
    advance(Duration::from_secs(20)).await;
    assert!(tracker.is_online("alice"));
    assert!(updates.try_recv().is_err());

    // Cross the 45s threshold (plus a sweep interval of slack)
    advance(Duration::from_secs(40)).await;
    assert!(!tracker.is_online("alice"));

    let offline = updates.recv().await.unwrap();
    assert!(!offline.online);
    assert_eq!(offline.last_seen_at, last_seen);

    // Further sweeps never re-emit the transition
    advance(Duration::from_secs(60)).await;
    assert!(updates.try_recv().is_err());

    // last_seen_at stayed frozen at the final heartbeat
    assert_eq!(tracker.status("alice").unwrap().last_seen_at, last_seen);
}

// A heartbeat arriving after the offline transition brings the peer back
// with a fresh online event.
#[tokio::test(start_paused = true)]
async fn heartbeat_after_silence_reconnects() {
    let tracker = PresenceTracker::new(PresenceConfig::default());
    let mut updates = tracker.subscribe();
    tracker.start();

    tracker.record_heartbeat("alice");
    let _ = updates.recv().await.unwrap();

    advance(Duration::from_secs(60)).await;
    let offline = updates.recv().await.unwrap();
    assert!(!offline.online);

    tracker.record_heartbeat("alice");
    let back = updates.recv().await.unwrap();
    assert!(back.online);
    assert!(back.last_seen_at >= offline.last_seen_at);
}
