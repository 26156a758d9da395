//! Topology discovery and command routing against in-memory servers

mod common;

use common::{ep, test_config, MockNetwork, Role};
use redis_mux::{
    Command, CommandCode, CommandFlags, Multiplexer, RedisError, ServerType, UnselectableFlags,
};

fn slot_owner(slot: u16, ports: &[u16]) -> u16 {
    let count = ports.len();
    let index = (0..count)
        .find(|&i| usize::from(slot) < 16384 * (i + 1) / count)
        .expect("slot out of range");
    ports[index]
}

#[tokio::test]
async fn test_standalone_writes_go_to_master() {
    common::init_tracing();
    let network = MockNetwork::new();
    let master = network.master(7001);
    let replica = network.replica(7002, 7001);

    let mux = Multiplexer::connect_with(test_config(&[ep(7001), ep(7002)]), network.clone())
        .await
        .expect("Failed to connect");

    let status = mux.status();
    assert_eq!(status.server_type, ServerType::Standalone);
    assert!(status.connected);

    let db = mux.database(None);
    db.set("test:key", "value").await.expect("SET failed");
    assert_eq!(master.value(0, "test:key").as_deref(), Some("value"));
    assert_eq!(replica.value(0, "test:key"), None);

    let value = db.get("test:key").await.expect("GET failed");
    assert_eq!(value.as_deref(), Some("value"));

    let server = mux.get_server(&ep(7002)).expect("replica not registered");
    assert!(server.is_replica());
}

#[tokio::test]
async fn test_replica_preference_reads_from_replica() {
    let network = MockNetwork::new();
    network.master(7011).insert("shared", "from-master");
    network.replica(7012, 7011).insert("shared", "from-replica");

    let mux = Multiplexer::connect_with(test_config(&[ep(7011), ep(7012)]), network.clone())
        .await
        .expect("Failed to connect");

    let demanded = mux
        .execute(
            Command::new(CommandCode::Get)
                .key("shared")
                .with_flags(CommandFlags::DEMAND_REPLICA),
        )
        .await
        .expect("GET on replica failed");
    assert_eq!(demanded.as_string().expect("not a string"), "from-replica");

    let preferred = mux
        .execute(
            Command::new(CommandCode::Get)
                .key("shared")
                .with_flags(CommandFlags::PREFER_REPLICA),
        )
        .await
        .expect("GET failed");
    assert_eq!(preferred.as_string().expect("not a string"), "from-replica");

    // master-only commands ignore the replica preference
    mux.execute(
        Command::new(CommandCode::Set)
            .key("written")
            .arg("1")
            .with_flags(CommandFlags::PREFER_REPLICA),
    )
    .await
    .expect("SET failed");
    assert_eq!(network.server(7011).value(0, "written").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_write_pinned_to_replica_is_rejected() {
    let network = MockNetwork::new();
    network.master(7021);
    let replica = network.replica(7022, 7021);

    let mux = Multiplexer::connect_with(test_config(&[ep(7021), ep(7022)]), network.clone())
        .await
        .expect("Failed to connect");

    let result = mux
        .execute_on(Command::new(CommandCode::Set).key("k").arg("v"), &ep(7022))
        .await;
    assert!(matches!(result, Err(RedisError::MasterOnly(_))));
    assert_eq!(replica.received("SET"), 0);

    // reads may be pinned anywhere; the tie-breaker probe already read once
    let probe_reads = replica.received("GET");
    let reply = mux
        .execute_on(Command::new(CommandCode::Get).key("k"), &ep(7022))
        .await
        .expect("GET failed");
    assert!(reply.is_null());
    assert_eq!(replica.received("GET"), probe_reads + 1);
}

#[tokio::test]
async fn test_replica_only_deployment_serves_reads() {
    let network = MockNetwork::new();
    let replica = network.replica(7031, 7039);
    replica.insert("k", "v");

    let mux = Multiplexer::connect_with(test_config(&[ep(7031)]), network.clone())
        .await
        .expect("Failed to connect");

    let value = mux.database(None).get("k").await.expect("GET failed");
    assert_eq!(value.as_deref(), Some("v"));

    let result = mux.database(None).set("k", "w").await;
    assert!(matches!(result, Err(RedisError::NoConnectionAvailable(_))));
}

#[tokio::test]
async fn test_cluster_discovery_from_single_seed() {
    common::init_tracing();
    let ports = [7101, 7102, 7103];
    let network = MockNetwork::new();
    let nodes = network.cluster(&ports);

    let mux = Multiplexer::connect_with(test_config(&[ep(7101)]), network.clone())
        .await
        .expect("Failed to connect");

    let status = mux.status();
    assert_eq!(status.server_type, ServerType::Cluster);
    assert_eq!(status.covered_slots, 16384);

    let mut endpoints = mux.endpoints();
    endpoints.sort_by_key(|e| e.port);
    assert_eq!(endpoints, vec![ep(7101), ep(7102), ep(7103)]);

    for key in ["alpha", "beta", "gamma", "delta", "{user}.name"] {
        let slot = mux.hash_slot(key);
        mux.database(None).set(key, key).await.expect("SET failed");

        let owner = slot_owner(slot, &ports);
        for node in &nodes {
            let stored = node.value(0, key);
            if node.endpoint().port == owner {
                assert_eq!(stored.as_deref(), Some(key), "{key} missing on owner");
            } else {
                assert_eq!(stored, None, "{key} written to non-owner");
            }
        }
    }
}

#[tokio::test]
async fn test_cluster_rejects_cross_slot_commands() {
    let network = MockNetwork::new();
    let nodes = network.cluster(&[7111, 7112]);

    let mux = Multiplexer::connect_with(test_config(&[ep(7111)]), network.clone())
        .await
        .expect("Failed to connect");

    assert_ne!(mux.hash_slot("foo"), mux.hash_slot("bar"));
    let result = mux.database(None).mget(["foo", "bar"]).await;
    assert!(matches!(result, Err(RedisError::MultipleSlots(_))));
    assert!(nodes.iter().all(|node| node.received("MGET") == 0));

    let values = mux
        .database(None)
        .mget(["{tag}.a", "{tag}.b"])
        .await
        .expect("same-slot MGET failed");
    assert_eq!(values, vec![None, None]);
}

#[tokio::test]
async fn test_standalone_allows_cross_slot_commands() {
    let network = MockNetwork::new();
    let master = network.master(7121);
    master.insert("foo", "1");
    master.insert("bar", "2");

    let mux = Multiplexer::connect_with(test_config(&[ep(7121)]), network.clone())
        .await
        .expect("Failed to connect");

    let values = mux
        .database(None)
        .mget(["foo", "bar"])
        .await
        .expect("MGET failed");
    assert_eq!(values, vec![Some("1".to_string()), Some("2".to_string())]);
}

#[tokio::test]
async fn test_non_cluster_server_marked_wrong_type() {
    let network = MockNetwork::new();
    network.cluster(&[7131]);
    network.master(7132);

    let mux = Multiplexer::connect_with(test_config(&[ep(7131), ep(7132)]), network.clone())
        .await
        .expect("Failed to connect");

    assert_eq!(mux.status().server_type, ServerType::Cluster);
    let stray = mux.get_server(&ep(7132)).expect("server not registered");
    assert!(stray
        .unselectable()
        .contains(UnselectableFlags::WRONG_SERVER_TYPE));

    mux.database(None).set("k", "v").await.expect("SET failed");
    assert_eq!(network.server(7132).received("SET"), 0);
}

#[tokio::test]
async fn test_database_selection() {
    let network = MockNetwork::new();
    let master = network.master(7141);
    let config = test_config(&[ep(7141)]).with_allow_admin(true);

    let mux = Multiplexer::connect_with(config, network.clone())
        .await
        .expect("Failed to connect");

    mux.database(Some(3))
        .set("scoped", "three")
        .await
        .expect("SET failed");
    assert_eq!(master.value(3, "scoped").as_deref(), Some("three"));
    assert_eq!(master.value(0, "scoped"), None);

    let from_zero = mux.database(Some(0)).get("scoped").await.expect("GET failed");
    assert_eq!(from_zero, None);
    let from_three = mux.database(Some(3)).get("scoped").await.expect("GET failed");
    assert_eq!(from_three.as_deref(), Some("three"));

    let result = mux.database(Some(20)).get("scoped").await;
    assert!(matches!(
        result,
        Err(RedisError::DatabaseOutOfRange {
            database: 20,
            available: 16
        })
    ));
}

#[tokio::test]
async fn test_admin_commands_need_admin_mode() {
    let network = MockNetwork::new();
    let master = network.master(7151);

    let mux = Multiplexer::connect_with(test_config(&[ep(7151)]), network.clone())
        .await
        .expect("Failed to connect");

    let result = mux.execute(Command::new(CommandCode::Flushall)).await;
    assert!(matches!(result, Err(RedisError::AdminModeRequired(_))));
    assert_eq!(master.received("FLUSHALL"), 0);
}

#[tokio::test]
async fn test_server_roles_reported_in_status() {
    let network = MockNetwork::new();
    network.master(7161);
    network.add(7162, Role::Replica(ep(7161)));

    let mux = Multiplexer::connect_with(test_config(&[ep(7161), ep(7162)]), network.clone())
        .await
        .expect("Failed to connect");

    let status = mux.status();
    assert_eq!(status.servers.len(), 2);
    for server in &status.servers {
        assert!(server.connected);
        assert_eq!(server.is_replica, server.endpoint == ep(7162));
        assert_eq!(server.version.as_deref(), Some("7.2.4"));
    }
    assert!(status.to_string().contains("127.0.0.1:7161"));
}
