mod common;

use common::{seeded_store, wait_for_event, wait_for_flag, wait_for_state, Harness};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tenten_lib::continuity::{KeepAlivePlayer, LeaseRole};
use tenten_lib::session::{CallEvent, ConnectionState, PublishState, ScenePhase};

#[tokio::test]
async fn test_peer_a_calls_peer_b() {
    let store = seeded_store(&["alice", "bob"]);
    let alice = Harness::start("alice", store.clone()).await;
    let bob = Harness::start("bob", store.clone()).await;

    let selection = alice.client.select_peer("bob").await.unwrap();
    assert_eq!(selection.delivery_address, "apns-bob");
    alice.client.connect_selected().await.unwrap();

    assert_eq!(alice.snapshot().connection_state, ConnectionState::Connected);
    assert_eq!(alice.tokens.fetches.load(Ordering::SeqCst), 1);

    // Bob sieht das Flag und verbindet automatisch
    let snapshot = wait_for_state(&bob.client, |s| s.connection_state == ConnectionState::Connected).await;
    assert_eq!(snapshot.peer_id.as_deref(), Some("alice"));
    assert!(store.get("bob").unwrap().has_incoming_call_request);

    // Bobs Signal an Alice ändert nichts an ihrer Verbindung
    wait_for_flag(&store, "alice", true).await;
    assert_eq!(alice.snapshot().connection_state, ConnectionState::Connected);
    assert_eq!(alice.tokens.fetches.load(Ordering::SeqCst), 1);

    // Auflegen konvergiert auf beiden Seiten
    alice.client.disconnect().await.unwrap();
    wait_for_state(&bob.client, |s| s.is_idle()).await;
    assert!(alice.snapshot().is_idle());

    wait_for_flag(&store, "alice", false).await;
    assert!(!store.get("bob").unwrap().has_incoming_call_request);
}

#[tokio::test]
async fn test_publish_failure_keeps_call_alive() {
    let store = seeded_store(&["alice", "bob"]);
    let alice = Harness::start("alice", store.clone()).await;
    let bob = Harness::start("bob", store).await;
    let mut events = alice.client.subscribe();

    alice.client.connect("bob").await.unwrap();
    wait_for_state(&bob.client, |s| s.connection_state == ConnectionState::Connected).await;

    alice.relay.fail_publish.store(true, Ordering::SeqCst);
    alice.client.publish().await.unwrap();

    let snapshot = alice.snapshot();
    assert_eq!(snapshot.publish_state, PublishState::NotPublished);
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    wait_for_event(&mut events, |e| matches!(e, CallEvent::PublishFailed { .. })).await;

    // Erneuter Versuch nach Behebung
    alice.relay.fail_publish.store(false, Ordering::SeqCst);
    alice.client.publish().await.unwrap();
    assert_eq!(alice.snapshot().publish_state, PublishState::Published);
    assert_eq!(bob.snapshot().connection_state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_background_call_renews_lease_without_gap() {
    let store = seeded_store(&["alice", "bob"]);
    let alice = Harness::start("alice", store.clone()).await;
    let bob = Harness::start("bob", store).await;

    alice.client.connect("bob").await.unwrap();
    wait_for_state(&bob.client, |s| s.connection_state == ConnectionState::Connected).await;

    alice
        .client
        .scene_phase_changed(ScenePhase::Background)
        .await
        .unwrap();
    assert!(alice.client.leases().is_active(LeaseRole::CallContinuity));
    assert!(alice.client.leases().is_keep_alive_running());

    // 30 Ticks, danach transparente Erneuerung
    tokio::time::sleep(Duration::from_millis(30_500)).await;

    let audio_leases = alice.lease_api.begins(LeaseRole::AudioKeepAlive);
    assert_eq!(audio_leases.len(), 2);
    assert_eq!(alice.lease_api.end_count(audio_leases[0]), 1);
    assert_eq!(alice.lease_api.max_outstanding_per_role(), 1);
    assert_eq!(alice.lease_api.begins(LeaseRole::CallContinuity).len(), 1);

    let lease = alice.client.leases().lease(LeaseRole::AudioKeepAlive).unwrap();
    assert!(lease.is_active);
    assert_eq!(lease.renewal_attempt, 1);

    assert_eq!(alice.player.plays.load(Ordering::SeqCst), 1);
    assert_eq!(alice.player.stops.load(Ordering::SeqCst), 0);
    assert_eq!(alice.snapshot().connection_state, ConnectionState::Connected);

    // Zurück im Vordergrund: alles freigegeben, nichts doppelt beendet
    alice
        .client
        .scene_phase_changed(ScenePhase::Active)
        .await
        .unwrap();
    assert_eq!(alice.lease_api.outstanding(LeaseRole::AudioKeepAlive), 0);
    assert_eq!(alice.lease_api.outstanding(LeaseRole::CallContinuity), 0);
    assert_eq!(alice.lease_api.end_count(audio_leases[1]), 1);
    assert!(!alice.player.is_playing());
}

#[tokio::test(start_paused = true)]
async fn test_revoked_keep_alive_lease_stops_loop() {
    let store = seeded_store(&["alice", "bob"]);
    let alice = Harness::start("alice", store).await;

    alice.client.connect("bob").await.unwrap();
    alice
        .client
        .scene_phase_changed(ScenePhase::Background)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let handle = alice.client.leases().lease(LeaseRole::AudioKeepAlive).unwrap().handle;
    alice.lease_api.expire(handle);
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert!(!alice.client.leases().is_keep_alive_running());
    assert_eq!(alice.lease_api.end_count(handle), 1);
    assert_eq!(alice.lease_api.begins(LeaseRole::AudioKeepAlive).len(), 1);
    // Der Call selbst läuft weiter
    assert!(alice.client.leases().is_active(LeaseRole::CallContinuity));
    assert_eq!(alice.snapshot().connection_state, ConnectionState::Connected);
}
