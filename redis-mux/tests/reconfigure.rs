//! Master election, failover and reconfiguration runs

mod common;

use common::{ep, eventually, test_config, MockNetwork, Role};
use redis_mux::{
    Multiplexer, MuxEvent, ReconfigureOutcome, RedisError, ServerType, UnselectableFlags,
};
use std::time::Duration;

const TIE_BREAKER: &str = "__Booksleeve_TieBreak";

fn redundant(mux: &Multiplexer, port: u16) -> bool {
    mux.get_server(&ep(port))
        .expect("server not registered")
        .unselectable()
        .contains(UnselectableFlags::REDUNDANT_MASTER)
}

#[tokio::test]
async fn test_tie_breaker_picks_one_of_three_masters() {
    common::init_tracing();
    let network = MockNetwork::new();
    for port in [7201, 7202, 7203] {
        network.master(port).insert(TIE_BREAKER, "127.0.0.1:7202");
    }

    let mux = Multiplexer::connect_with(
        test_config(&[ep(7201), ep(7202), ep(7203)]),
        network.clone(),
    )
    .await
    .expect("Failed to connect");

    assert!(redundant(&mux, 7201));
    assert!(!redundant(&mux, 7202));
    assert!(redundant(&mux, 7203));

    mux.database(None).set("k", "v").await.expect("SET failed");
    assert_eq!(network.server(7202).value(0, "k").as_deref(), Some("v"));
    assert_eq!(network.server(7201).value(0, "k"), None);
    assert_eq!(network.server(7203).value(0, "k"), None);
}

#[tokio::test]
async fn test_exactly_one_master_wins_without_votes() {
    let network = MockNetwork::new();
    for port in [7211, 7212, 7213] {
        network.master(port);
    }

    let mux = Multiplexer::connect_with(
        test_config(&[ep(7211), ep(7212), ep(7213)]).with_tie_breaker(""),
        network.clone(),
    )
    .await
    .expect("Failed to connect");

    let winners: Vec<u16> = [7211, 7212, 7213]
        .into_iter()
        .filter(|&port| !redundant(&mux, port))
        .collect();
    assert_eq!(winners.len(), 1, "expected one winner, got {winners:?}");

    mux.database(None).set("k", "v").await.expect("SET failed");
    let holders: Vec<u16> = [7211, 7212, 7213]
        .into_iter()
        .filter(|&port| network.server(port).value(0, "k").is_some())
        .collect();
    assert_eq!(holders, winners);
    for port in [7211, 7212, 7213] {
        assert_eq!(network.server(port).received("GET"), 0);
    }
}

#[tokio::test]
async fn test_unanimous_vote_including_replicas() {
    let network = MockNetwork::new();
    network.master(7221).insert(TIE_BREAKER, "127.0.0.1:7222");
    network.master(7222).insert(TIE_BREAKER, "127.0.0.1:7222");
    network.replica(7223, 7222).insert(TIE_BREAKER, "127.0.0.1:7222");

    let mux = Multiplexer::connect_with(
        test_config(&[ep(7221), ep(7222), ep(7223)]),
        network.clone(),
    )
    .await
    .expect("Failed to connect");

    assert!(redundant(&mux, 7221));
    assert!(!redundant(&mux, 7222));
    assert!(!redundant(&mux, 7223));

    let hits = mux.database(None).incr("hits").await.expect("INCR failed");
    assert_eq!(hits, 1);
    assert_eq!(network.server(7222).value(0, "hits").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_plurality_vote_wins() {
    let network = MockNetwork::new();
    network.master(7231).insert(TIE_BREAKER, "127.0.0.1:7232");
    network.master(7232).insert(TIE_BREAKER, "127.0.0.1:7232");
    network.master(7233).insert(TIE_BREAKER, "127.0.0.1:7233");

    let mux = Multiplexer::connect_with(
        test_config(&[ep(7231), ep(7232), ep(7233)]),
        network.clone(),
    )
    .await
    .expect("Failed to connect");

    assert!(!redundant(&mux, 7232));
    assert!(redundant(&mux, 7231));
    assert!(redundant(&mux, 7233));
}

#[tokio::test]
async fn test_only_one_reconfiguration_runs_at_a_time() {
    let network = MockNetwork::new();
    network.master(7241);

    let mux = Multiplexer::connect_with(test_config(&[ep(7241)]), network.clone())
        .await
        .expect("Failed to connect");

    let (first, second) = tokio::join!(mux.reconfigure(), mux.reconfigure());
    let outcomes = [
        first.expect("first run failed"),
        second.expect("second run failed"),
    ];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ReconfigureOutcome::Completed { healthy: true }))
        .count();
    let declined = outcomes
        .iter()
        .filter(|o| matches!(o, ReconfigureOutcome::AlreadyRunning { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(declined, 1);
    assert!(mux.status().reconfiguring.is_none());
}

#[tokio::test]
async fn test_connect_aborts_when_nothing_responds() {
    let network = MockNetwork::new();
    network.master(7251).set_down(true);

    let result = Multiplexer::connect_with(test_config(&[ep(7251)]), network.clone()).await;
    match result {
        Err(RedisError::UnableToConnect(message)) => {
            assert!(message.contains("127.0.0.1:7251"), "{message}");
        }
        other => panic!("expected UnableToConnect, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_aborts_when_only_proxies_respond() {
    let network = MockNetwork::new();
    network.master(7256).set_mode("proxy");

    let result = Multiplexer::connect_with(test_config(&[ep(7256)]), network.clone()).await;
    assert!(
        matches!(result, Err(RedisError::UnableToConnect(_))),
        "expected UnableToConnect, got {result:?}"
    );
    assert!(network.server(7256).received("INFO") >= 1);
}

#[tokio::test]
async fn test_proxy_alongside_master_is_healthy() {
    let network = MockNetwork::new();
    network.master(7257).set_mode("proxy");
    network.master(7258);

    let mux = Multiplexer::connect_with(test_config(&[ep(7257), ep(7258)]), network.clone())
        .await
        .expect("Failed to connect");
    assert!(mux.is_connected());
}

#[tokio::test]
async fn test_connect_without_abort_recovers_later() {
    let network = MockNetwork::new();
    let master = network.master(7261);
    master.set_down(true);

    let config = test_config(&[ep(7261)])
        .with_abort_on_connect_fail(false)
        .with_heartbeat_interval(Duration::from_millis(50));
    let mux = Multiplexer::connect_with(config, network.clone())
        .await
        .expect("connect should not abort");

    assert!(!mux.is_connected());
    assert!(mux.last_error().is_some());
    let result = mux.database(None).get("k").await;
    assert!(matches!(result, Err(RedisError::NoConnectionAvailable(_))));

    master.set_down(false);
    eventually("the heartbeat to reconnect", || mux.is_connected()).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mux.database(None).set("k", "v").await.is_err() {
        assert!(tokio::time::Instant::now() < deadline, "master never became routable");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(master.value(0, "k").as_deref(), Some("v"));
}

#[tokio::test]
async fn test_connect_retries_before_giving_up() {
    let network = MockNetwork::new();
    let master = network.master(7271);
    master.set_down(true);

    let config = test_config(&[ep(7271)]).with_connect_retry(2);
    let result = Multiplexer::connect_with(config, network.clone()).await;
    assert!(matches!(result, Err(RedisError::UnableToConnect(_))));
    assert_eq!(master.connections_accepted(), 0);
}

#[tokio::test]
async fn test_failover_to_promoted_replica() {
    common::init_tracing();
    let network = MockNetwork::new();
    let old_master = network.master(7281);
    let replica = network.replica(7282, 7281);

    let config = test_config(&[ep(7281), ep(7282)]).with_heartbeat_interval(Duration::from_millis(50));
    let mux = Multiplexer::connect_with(config, network.clone())
        .await
        .expect("Failed to connect");
    let mut events = mux.subscribe_events();

    replica.set_role(Role::Master);
    old_master.set_down(true);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if mux.database(None).set("after", "failover").await.is_ok()
            && replica.value(0, "after").is_some()
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "writes never moved");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(old_master.value(0, "after"), None);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MuxEvent::ConnectionFailed { ref endpoint, .. } if *endpoint == ep(7281)) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn test_configuration_broadcast_reaches_other_clients() {
    let network = MockNetwork::new();
    network.master(7291);

    let first = Multiplexer::connect_with(test_config(&[ep(7291)]), network.clone())
        .await
        .expect("Failed to connect");
    let second = Multiplexer::connect_with(test_config(&[ep(7291)]), network.clone())
        .await
        .expect("Failed to connect");
    let mut events = second.subscribe_events();

    let receivers = first.publish_reconfigure().await.expect("broadcast failed");
    assert_eq!(receivers, 2);

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(MuxEvent::ConfigurationChangedBroadcast { endpoint }) => break endpoint,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("no broadcast received");
    assert_eq!(received, ep(7291));
}

#[tokio::test]
async fn test_reconfigure_after_close_is_disposed() {
    let network = MockNetwork::new();
    network.master(7299);

    let mux = Multiplexer::connect_with(test_config(&[ep(7299)]), network.clone())
        .await
        .expect("Failed to connect");
    assert_eq!(mux.status().server_type, ServerType::Standalone);

    mux.close(Duration::from_millis(100)).await;
    assert!(matches!(mux.reconfigure().await, Err(RedisError::Disposed)));
    assert!(matches!(
        mux.database(None).get("k").await,
        Err(RedisError::Disposed)
    ));
}
