//! Sentinel master discovery and switch-over

mod common;

use common::{ep, eventually, test_config, MockNetwork, Role};
use redis_mux::{ReconfigureOutcome, RedisError, SentinelController, SentinelState, ServerType};
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "mymaster";

fn sentinel_network(sentinel: u16, master: u16, replica: u16) -> Arc<MockNetwork> {
    let network = MockNetwork::new();
    network
        .sentinel(sentinel)
        .monitor(SERVICE, ep(master), vec![ep(replica)]);
    network.master(master);
    network.replica(replica, master);
    network
}

async fn controller(network: &Arc<MockNetwork>, sentinel: u16) -> SentinelController {
    SentinelController::connect_with(test_config(&[ep(sentinel)]), network.clone())
        .await
        .expect("Failed to connect to sentinel")
}

#[tokio::test]
async fn test_sentinel_reports_master_and_replicas() {
    common::init_tracing();
    let network = sentinel_network(7601, 7602, 7603);
    let sentinel = controller(&network, 7601).await;

    assert_eq!(sentinel.sentinels().status().server_type, ServerType::Sentinel);

    let master = sentinel
        .get_master_address(SERVICE)
        .await
        .expect("lookup failed");
    assert_eq!(master, Some(ep(7602)));

    let replicas = sentinel.replicas(SERVICE).await.expect("lookup failed");
    assert_eq!(replicas, vec![ep(7603)]);

    let unknown = sentinel
        .get_master_address("nosuchservice")
        .await
        .expect("lookup failed");
    assert_eq!(unknown, None);
}

#[tokio::test]
async fn test_get_master_connects_service() {
    let network = sentinel_network(7611, 7612, 7613);
    let sentinel = controller(&network, 7611).await;
    assert_eq!(sentinel.state(SERVICE), SentinelState::Disconnected);

    let mux = sentinel.get_master(SERVICE).await.expect("get_master failed");
    assert_eq!(sentinel.state(SERVICE), SentinelState::Connected);
    assert_eq!(sentinel.current_master(SERVICE), Some(ep(7612)));

    mux.database(None).set("k", "v").await.expect("SET failed");
    assert_eq!(network.server(7612).value(0, "k").as_deref(), Some("v"));

    // the same multiplexer is handed out again
    let again = sentinel.get_master(SERVICE).await.expect("get_master failed");
    assert!(Arc::ptr_eq(&mux, &again));
}

#[tokio::test]
async fn test_get_master_for_unknown_service() {
    let network = sentinel_network(7621, 7622, 7623);
    let sentinel = controller(&network, 7621).await;

    let result = sentinel.get_master("nosuchservice").await;
    assert!(matches!(result, Err(RedisError::Sentinel(_))));
    assert_eq!(sentinel.state("nosuchservice"), SentinelState::Disconnected);
}

#[tokio::test]
async fn test_switch_master_announcement_moves_writes() {
    common::init_tracing();
    let network = sentinel_network(7631, 7632, 7633);
    let sentinel_server = network.server(7631);
    let sentinel = controller(&network, 7631).await;

    let mux = sentinel.get_master(SERVICE).await.expect("get_master failed");
    mux.database(None).set("before", "1").await.expect("SET failed");
    assert_eq!(network.server(7632).value(0, "before").as_deref(), Some("1"));

    // sentinel promotes the replica and demotes the old master
    network.server(7633).set_role(Role::Master);
    network.server(7632).set_role(Role::Replica(ep(7633)));
    sentinel_server.monitor(SERVICE, ep(7633), vec![ep(7632)]);
    let receivers = sentinel_server.publish(
        "+switch-master",
        "mymaster 127.0.0.1 7632 127.0.0.1 7633",
    );
    assert_eq!(receivers, 1);

    eventually("the switch to complete", || {
        sentinel.current_master(SERVICE) == Some(ep(7633))
            && sentinel.state(SERVICE) == SentinelState::Connected
    })
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        mux.database(None).set("after", "2").await.expect("SET failed");
        if network.server(7633).value(0, "after").is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "writes never moved");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_explicit_switch_master() {
    let network = sentinel_network(7641, 7642, 7643);
    let sentinel = controller(&network, 7641).await;
    let mux = sentinel.get_master(SERVICE).await.expect("get_master failed");

    network.server(7643).set_role(Role::Master);
    network.server(7642).set_role(Role::Replica(ep(7643)));
    sentinel
        .switch_master(SERVICE, ep(7643))
        .await
        .expect("switch failed");

    assert_eq!(sentinel.current_master(SERVICE), Some(ep(7643)));
    assert_eq!(sentinel.state(SERVICE), SentinelState::Connected);
    mux.database(None).set("k", "v").await.expect("SET failed");
    assert_eq!(network.server(7643).value(0, "k").as_deref(), Some("v"));
}

#[tokio::test]
async fn test_switch_master_while_old_master_still_claims_role() {
    let network = sentinel_network(7661, 7662, 7663);
    let sentinel = controller(&network, 7661).await;
    let mux = sentinel.get_master(SERVICE).await.expect("get_master failed");

    // partitioned old master never learns it was replaced
    network.server(7663).set_role(Role::Master);
    network
        .server(7661)
        .monitor(SERVICE, ep(7663), vec![ep(7662)]);
    sentinel
        .switch_master(SERVICE, ep(7663))
        .await
        .expect("switch failed");

    assert_eq!(sentinel.current_master(SERVICE), Some(ep(7663)));
    assert_eq!(sentinel.state(SERVICE), SentinelState::Connected);
    for i in 0..20 {
        let key = format!("k{i}");
        mux.database(None).set(key.clone(), "v").await.expect("SET failed");
        assert_eq!(network.server(7663).value(0, &key).as_deref(), Some("v"));
        assert_eq!(network.server(7662).value(0, &key), None);
    }
}

#[tokio::test]
async fn test_switch_master_waits_for_running_reconfiguration() {
    let network = MockNetwork::new();
    network
        .sentinel(7671)
        .monitor(SERVICE, ep(7672), vec![ep(7673), ep(7674)]);
    network.master(7672);
    network.replica(7673, 7672);
    network.replica(7674, 7672);
    let sentinel = controller(&network, 7671).await;
    let mux = sentinel.get_master(SERVICE).await.expect("get_master failed");

    // keeps the next run busy until its probe deadline
    network.server(7674).set_hang(true);
    network.server(7673).set_role(Role::Master);
    network
        .server(7671)
        .monitor(SERVICE, ep(7673), vec![ep(7672)]);

    let (running, switched) = tokio::join!(
        mux.reconfigure(),
        sentinel.switch_master(SERVICE, ep(7673))
    );
    assert!(matches!(running, Ok(ReconfigureOutcome::Completed { .. })));
    switched.expect("switch failed");

    assert_eq!(sentinel.state(SERVICE), SentinelState::Connected);
    assert_eq!(sentinel.current_master(SERVICE), Some(ep(7673)));
    assert!(!mux.endpoints().contains(&ep(7674)));
    mux.database(None).set("k", "v").await.expect("SET failed");
    assert_eq!(network.server(7673).value(0, "k").as_deref(), Some("v"));
    assert_eq!(network.server(7672).value(0, "k"), None);
}

#[tokio::test]
async fn test_new_sentinel_announcement_is_added() {
    let network = sentinel_network(7651, 7652, 7653);
    network.sentinel(7654).monitor(SERVICE, ep(7652), vec![ep(7653)]);
    let sentinel = controller(&network, 7651).await;
    assert_eq!(sentinel.sentinels().endpoints(), vec![ep(7651)]);

    network.server(7651).publish(
        "+sentinel",
        "sentinel 6b1d 127.0.0.1 7654 @ mymaster 127.0.0.1 7652",
    );

    eventually("the new sentinel to join", || {
        sentinel
            .sentinels()
            .get_server(&ep(7654))
            .is_some_and(|server| server.is_connected())
    })
    .await;
}

#[tokio::test]
async fn test_no_sentinels_configured() {
    let network = MockNetwork::new();
    let result = SentinelController::connect_with(test_config(&[]), network.clone()).await;
    assert!(matches!(result, Err(RedisError::Config(_))));
}
