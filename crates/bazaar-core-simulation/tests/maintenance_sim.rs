use anyhow::Result;
use bazaar_core_overlay::{DelayRange, NodeAddress, OverlayConfig, Transport, WireMessage};
use bazaar_core_simulation::{fast_config, OverlaySimulation};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn addr(name: &str) -> NodeAddress {
    NodeAddress::new(format!("{name}.sim"), 4000)
}

fn no_seeds() -> HashSet<NodeAddress> {
    HashSet::new()
}

fn quiet_config() -> OverlayConfig {
    let mut config = fast_config();
    config.ping_interval = DelayRange::new(Duration::from_secs(10), Duration::from_secs(20));
    config.get_peers_interval = DelayRange::new(Duration::from_secs(10), Duration::from_secs(20));
    config
}

#[tokio::test]
async fn test_passive_connections_drain_to_low_cap() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let x = addr("x");

    let mut config = quiet_config();
    config.max_connections_low_prio = 2;
    config.max_connections_normal_prio = 3;
    config.max_connections_high_prio = 4;
    // Capacity checks fire often; pings never do.
    config.ping_interval = DelayRange::new(Duration::from_millis(50), Duration::from_millis(100));
    config.ping_after_inactivity = Duration::from_secs(3600);
    sim.add_node(x.clone(), no_seeds(), config);

    let peers: Vec<NodeAddress> = (0..4).map(|i| addr(&format!("p{i}"))).collect();
    for peer in &peers {
        sim.add_node(peer.clone(), no_seeds(), quiet_config());
    }
    for peer in &peers {
        sim.node(peer)
            .group
            .authenticate_to_direct_message_peer(x.clone())
            .await??;
    }

    // The four inbound connections are passive on x; eviction drains the
    // excess down to the low-priority cap and no further.
    sim.wait_for(&x, Duration::from_secs(3), |s| s.authenticated.len() == 2)
        .await?;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.snapshot(&x).await?.authenticated.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_pong_nonce_mismatch_evicts_peer() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let (x, y) = (addr("x"), addr("y"));
    sim.add_node(x.clone(), no_seeds(), quiet_config());
    sim.add_node(y.clone(), no_seeds(), quiet_config());

    sim.node(&x)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;

    // A pong with the wrong nonce is a protocol violation: the peer is
    // dropped and its connection shut down.
    let y_conn = sim
        .network
        .connection_between(&y, &x)
        .expect("y holds a connection to x");
    drop(
        sim.node(&y)
            .transport
            .send_on_connection(&y_conn, WireMessage::Pong { nonce: 7 }),
    );

    sim.wait_for(&x, Duration::from_secs(2), |s| s.authenticated.is_empty())
        .await?;
    sim.wait_for(&y, Duration::from_secs(2), |s| s.authenticated.is_empty())
        .await?;

    // Subsequent broadcasts skip the evicted peer entirely.
    sim.node(&x).group.broadcast(b"offer".to_vec(), None);
    sleep(Duration::from_millis(150)).await;
    let broadcasts = sim
        .network
        .message_log()
        .iter()
        .filter(|r| r.from == x && matches!(r.message, WireMessage::DataBroadcast { .. }))
        .count();
    assert_eq!(broadcasts, 0);
    Ok(())
}

#[tokio::test]
async fn test_ping_send_failure_evicts_peer() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let (x, y) = (addr("x"), addr("y"));

    let mut config = quiet_config();
    config.ping_interval = DelayRange::new(Duration::from_millis(40), Duration::from_millis(80));
    config.ping_after_inactivity = Duration::ZERO;
    sim.add_node(x.clone(), no_seeds(), config);
    sim.add_node(y.clone(), no_seeds(), quiet_config());

    sim.node(&x)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;

    sim.network.set_offline(&y, true);
    sim.wait_for(&x, Duration::from_secs(3), |s| s.authenticated.is_empty())
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_timers_stop_after_shutdown() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let (x, y) = (addr("x"), addr("y"));

    let mut config = fast_config();
    config.ping_interval = DelayRange::new(Duration::from_millis(40), Duration::from_millis(80));
    config.get_peers_interval =
        DelayRange::new(Duration::from_millis(40), Duration::from_millis(80));
    config.ping_after_inactivity = Duration::ZERO;
    sim.add_node(x.clone(), no_seeds(), config);
    sim.add_node(y.clone(), no_seeds(), quiet_config());

    sim.node(&x)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;

    let maintenance_from_x = |sim: &OverlaySimulation| {
        sim.network
            .message_log()
            .iter()
            .filter(|r| {
                r.from == x
                    && matches!(
                        r.message,
                        WireMessage::Ping { .. } | WireMessage::GetPeersRequest { .. }
                    )
            })
            .count()
    };

    // Both timers are running.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if maintenance_from_x(&sim) >= 2 {
            break;
        }
        assert!(Instant::now() < deadline, "maintenance timers never fired");
        sleep(Duration::from_millis(20)).await;
    }

    // After shutdown neither the ping timer nor the get-peers timer fires
    // again.
    sim.node(&x).group.shut_down();
    sleep(Duration::from_millis(150)).await;
    let before = maintenance_from_x(&sim);
    sleep(Duration::from_millis(400)).await;
    assert_eq!(maintenance_from_x(&sim), before);
    Ok(())
}
