//! Tests against a real Redis server in Docker
//!
//! Run with `cargo test -- --ignored` on a machine with Docker available.

use redis_mux::{
    Command, CommandCode, ConnectionConfig, Multiplexer, ProtocolVersion, ServerType,
};
use std::time::Duration;
use testcontainers::{clients::Cli, images::redis::Redis};

fn config_for(port: u16, protocol: ProtocolVersion) -> ConnectionConfig {
    let config: ConnectionConfig = format!("127.0.0.1:{port},allowAdmin=true")
        .parse()
        .expect("invalid connection string");
    config.with_protocol_version(protocol)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_live_standalone_roundtrip() {
    let docker = Cli::default();
    let container = docker.run(Redis::default());
    let port = container.get_host_port_ipv4(6379);

    for protocol in [ProtocolVersion::Resp2, ProtocolVersion::Resp3] {
        let mux = Multiplexer::connect(config_for(port, protocol))
            .await
            .expect("Failed to connect");
        assert_eq!(mux.status().server_type, ServerType::Standalone);

        let db = mux.database(Some(1));
        db.set("live:key", "value").await.expect("SET failed");
        assert_eq!(
            db.get("live:key").await.expect("GET failed").as_deref(),
            Some("value")
        );
        assert_eq!(db.incr("live:counter").await.expect("INCR failed"), 1);
        assert_eq!(
            db.del(["live:key", "live:counter"]).await.expect("DEL failed"),
            2
        );

        let info = mux
            .execute(Command::new(CommandCode::Info).arg("server"))
            .await
            .expect("INFO failed")
            .as_string()
            .expect("INFO is not text");
        assert!(info.contains("redis_version"));

        mux.close(Duration::from_secs(1)).await;
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_live_pubsub() {
    let docker = Cli::default();
    let container = docker.run(Redis::default());
    let port = container.get_host_port_ipv4(6379);

    let mux = Multiplexer::connect(config_for(port, ProtocolVersion::Resp2))
        .await
        .expect("Failed to connect");
    let mut events = mux.subscribe_events();
    mux.subscribe("live:channel").await.expect("SUBSCRIBE failed");

    let receivers = mux
        .database(None)
        .publish("live:channel", "ping")
        .await
        .expect("PUBLISH failed");
    assert_eq!(receivers, 1);

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(redis_mux::MuxEvent::Message { channel, .. }) = events.recv().await {
                break channel;
            }
        }
    })
    .await
    .expect("no message received");
    assert_eq!(event, "live:channel");
}
