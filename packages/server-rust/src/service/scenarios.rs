//! Multi-daemon scenarios over real mutual TLS on loopback.
//!
//! Every daemon runs its background loops for real; only the wall clock used
//! for fail-over arithmetic is manual, so no member fails over unless a test
//! advances its clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pulseha_core::messages::{CreateRequest, JoinClusterRequest};
use pulseha_core::{ClockSource, ErrorCode, MemberStatus};

use super::testing::TestDaemon;
use crate::error::DaemonError;
use crate::plugins::host::testing::{IpCall, SwitchCheck};

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn local_status(t: &TestDaemon) -> Option<MemberStatus> {
    t.daemon.cluster().members().local().map(|m| m.status())
}

fn view_of(t: &TestDaemon, hostname: &str) -> Option<MemberStatus> {
    t.daemon.cluster().members().get(hostname).map(|m| m.status())
}

async fn founder(hostname: &str) -> (TestDaemon, String) {
    let t = TestDaemon::new(hostname, None);
    let token = t
        .daemon
        .create(CreateRequest {
            bind_ip: "127.0.0.1".to_string(),
            bind_port: 0,
        })
        .await
        .unwrap();
    (t, token)
}

fn join_request(founder: &TestDaemon, token: &str) -> JoinClusterRequest {
    JoinClusterRequest {
        peer_ip: "127.0.0.1".to_string(),
        peer_port: founder.daemon.peer_addr().unwrap().port(),
        bind_ip: "127.0.0.1".to_string(),
        bind_port: 0,
        token: token.to_string(),
    }
}

async fn joiner(hostname: &str, founder: &TestDaemon, token: &str) -> TestDaemon {
    let t = TestDaemon::new(hostname, None);
    t.daemon.join(join_request(founder, token)).await.unwrap();
    t
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_join_leave() {
    let (n1, token) = founder("n1").await;
    assert_eq!(local_status(&n1), Some(MemberStatus::Active));

    let n2 = joiner("n2", &n1, &token).await;
    assert_eq!(n1.daemon.config().node_count(), 2);
    assert_eq!(n2.daemon.config().node_count(), 2);
    assert_eq!(local_status(&n2), Some(MemberStatus::Passive));
    assert!(n2
        .daemon
        .cluster()
        .tasks()
        .is_running(crate::cluster::TaskKind::FailOverMonitor));
    // Both nodes share the founder's node map and settings.
    assert_eq!(
        n1.daemon.config().get().nodes,
        n2.daemon.config().get().nodes
    );

    // Heart-beats replicate the founder's view to the joiner.
    eventually("n2 to learn n1 is active", || {
        view_of(&n2, "n1") == Some(MemberStatus::Active)
    })
    .await;
    eventually("n1 to see n2 passive", || {
        view_of(&n1, "n2") == Some(MemberStatus::Passive)
    })
    .await;
    assert_eq!(
        n2.daemon.cluster().members().local().unwrap().last_hc_response(),
        Some(n2.clock.now_millis())
    );

    n2.daemon.leave().await.unwrap();
    assert!(!n2.daemon.config().cluster_check());
    assert!(n2.daemon.cluster().members().is_empty());
    eventually("n1 to forget n2", || n1.daemon.config().node_count() == 1).await;
    assert!(n1.daemon.cluster().members().get("n2").is_none());
    assert_eq!(local_status(&n1), Some(MemberStatus::Active));

    n1.daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn token_rotation_invalidates_the_old_token() {
    let (n1, old) = founder("n1").await;
    let new = n1.daemon.rotate_token().await.unwrap();

    let n3 = TestDaemon::new("n3", None);
    let err = n3.daemon.join(join_request(&n1, &old)).await.unwrap_err();
    assert_eq!(err, DaemonError::InvalidToken);
    assert_eq!(err.code(), ErrorCode::InvalidToken);
    assert_eq!(err.code().code(), 9);
    assert!(!n3.daemon.config().cluster_check());
    assert!(n3.daemon.peer_addr().is_none());
    assert_eq!(n1.daemon.config().node_count(), 1);

    n3.daemon.join(join_request(&n1, &new)).await.unwrap();
    assert_eq!(n1.daemon.config().node_count(), 2);

    n3.daemon.stop().await;
    n1.daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_add_replicates_and_brings_up_on_active_once() {
    let (n1, token) = founder("n1").await;
    let n2 = joiner("n2", &n1, &token).await;

    let group = n1.daemon.group_new(Some("G")).await.unwrap();
    n1.daemon.group_assign(&group, None, "eth0").await.unwrap();
    let batch = vec!["192.0.2.10/24".to_string(), "192.0.2.11/24".to_string()];
    n1.daemon.group_add(&group, &batch).await.unwrap();

    assert_eq!(
        n1.net.ups(),
        vec![IpCall::Up("eth0".to_string(), batch.clone())]
    );
    assert!(n2.net.ups().is_empty());
    assert_eq!(
        n2.daemon.config().get().floating_ip_groups.get("G"),
        Some(&batch)
    );

    n2.daemon.stop().await;
    n1.daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_brain_converges_to_one_active() {
    let (n1, token) = founder("n1").await;
    let n2 = joiner("n2", &n1, &token).await;
    eventually("heart-beats to flow", || {
        view_of(&n2, "n1") == Some(MemberStatus::Active)
    })
    .await;

    n2.daemon.cluster().make_local_active().await.unwrap();
    assert_eq!(local_status(&n2), Some(MemberStatus::Active));

    eventually("exactly one active member", || {
        let n1_active = local_status(&n1) == Some(MemberStatus::Active);
        let n2_active = local_status(&n2) == Some(MemberStatus::Active);
        let n1_view = n1.daemon.cluster().members().count_with(MemberStatus::Active);
        let n2_view = n2.daemon.cluster().members().count_with(MemberStatus::Active);
        n1_active != n2_active && n1_view == 1 && n2_view == 1
    })
    .await;

    n2.daemon.stop().await;
    n1.daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_hands_over_to_a_higher_scoring_passive() {
    let (n1, token) = founder("n1").await;
    let n2 = joiner("n2", &n1, &token).await;
    n1.daemon.group_new(Some("G")).await.unwrap();
    n1.daemon.group_assign("G", Some("n2"), "eth1").await.unwrap();
    n1.daemon
        .group_add("G", &["10.30.0.5/24".to_string()])
        .await
        .unwrap();

    n2.daemon
        .plugins()
        .register_health_check(Arc::new(SwitchCheck::new(5, true)));
    assert_eq!(n2.daemon.cluster().health_checks_tick().await, 5);
    eventually("n1 to learn n2's score", || {
        let n2_view = n1.daemon.cluster().members().get("n2");
        n2_view.is_some_and(|m| m.score() == 5) || local_status(&n2) == Some(MemberStatus::Active)
    })
    .await;
    n1.daemon.cluster().connection_monitor_tick().await;

    eventually("n2 to take over", || {
        local_status(&n2) == Some(MemberStatus::Active)
            && local_status(&n1) == Some(MemberStatus::Passive)
    })
    .await;
    assert_eq!(view_of(&n1, "n2"), Some(MemberStatus::Active));
    assert!(n2
        .net
        .ups()
        .contains(&IpCall::Up("eth1".to_string(), vec!["10.30.0.5/24".to_string()])));

    n2.daemon.stop().await;
    n1.daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passive_takes_over_when_active_goes_silent() {
    let (n1, token) = founder("n1").await;
    let n2 = joiner("n2", &n1, &token).await;

    n1.daemon.group_new(Some("G")).await.unwrap();
    n1.daemon
        .group_add("G", &["10.20.0.5/24".to_string()])
        .await
        .unwrap();
    n1.daemon.group_assign("G", Some("n2"), "eth1").await.unwrap();
    eventually("n2 to learn n1 is active", || {
        view_of(&n2, "n1") == Some(MemberStatus::Active)
    })
    .await;

    n1.daemon.stop().await;
    n2.clock.advance(21_000);
    n2.daemon
        .cluster()
        .failover_tick(n2.clock.now_millis())
        .await;

    eventually("n2 to become active", || {
        local_status(&n2) == Some(MemberStatus::Active)
    })
    .await;
    assert_eq!(view_of(&n2, "n1"), Some(MemberStatus::Unavailable));
    assert!(n2
        .net
        .ups()
        .contains(&IpCall::Up("eth1".to_string(), vec!["10.20.0.5/24".to_string()])));

    n2.daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_member_shuts_down_and_disappears_everywhere() {
    let (n1, token) = founder("n1").await;
    let n2 = joiner("n2", &n1, &token).await;
    let n3 = joiner("n3", &n1, &token).await;
    eventually("n2 to know about n3", || {
        n2.daemon.config().node_by_hostname("n3").is_some()
    })
    .await;

    n1.daemon.remove("n3").await.unwrap();

    assert!(n1.daemon.config().node_by_hostname("n3").is_none());
    assert!(n2.daemon.config().node_by_hostname("n3").is_none());
    assert!(n2.daemon.cluster().members().get("n3").is_none());
    eventually("n3 to shut down", || {
        n3.daemon.shutdown_controller().is_triggered() && !n3.daemon.config().cluster_check()
    })
    .await;

    n2.daemon.stop().await;
    n1.daemon.stop().await;
}
