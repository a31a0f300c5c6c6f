use anyhow::Result;
use bazaar_core_overlay::{DelayRange, NodeAddress, OverlayConfig, Transport, WireMessage};
use bazaar_core_simulation::{assert_table_invariants, fast_config, OverlaySimulation};
use std::collections::HashSet;
use std::time::Duration;

fn addr(name: &str) -> NodeAddress {
    NodeAddress::new(format!("{name}.sim"), 4000)
}

fn fake(i: usize) -> NodeAddress {
    NodeAddress::new(format!("fake{i}.sim"), 5000)
}

fn no_seeds() -> HashSet<NodeAddress> {
    HashSet::new()
}

/// Config with gossip and maintenance timers parked, so tests fully control
/// which peer lists flow.
fn quiet_config() -> OverlayConfig {
    let mut config = fast_config();
    config.ping_interval = DelayRange::new(Duration::from_secs(10), Duration::from_secs(20));
    config.get_peers_interval = DelayRange::new(Duration::from_secs(10), Duration::from_secs(20));
    config
}

#[tokio::test]
async fn test_reported_overflow_purges_preexisting_at_random() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let (x, y) = (addr("x"), addr("y"));
    sim.add_node(x.clone(), no_seeds(), quiet_config());
    sim.add_node(y.clone(), no_seeds(), quiet_config());

    sim.node(&x)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;
    let y_conn = sim
        .network
        .connection_between(&y, &x)
        .expect("y holds a connection to x");
    let y_transport = sim.node(&y).transport.clone();

    // Fill the reported set to its cap.
    let old: HashSet<NodeAddress> = (0..1000).map(fake).collect();
    drop(y_transport.send_on_connection(
        &y_conn,
        WireMessage::GetPeersResponse {
            known_peers: old.clone(),
        },
    ));
    sim.wait_for(&x, Duration::from_secs(2), |s| s.reported.len() == 1000)
        .await?;

    // 50 new addresses arrive; the purge removes 50 pre-existing ones and
    // every new address survives.
    let fresh: HashSet<NodeAddress> = (1000..1050).map(fake).collect();
    drop(y_transport.send_on_connection(
        &y_conn,
        WireMessage::GetPeersResponse {
            known_peers: fresh.clone(),
        },
    ));
    let snapshot = sim
        .wait_for(&x, Duration::from_secs(2), |s| {
            s.reported.len() == 1000 && fresh.iter().all(|f| s.reported.contains(f))
        })
        .await?;

    let surviving_old = snapshot.reported.iter().filter(|r| old.contains(*r)).count();
    assert_eq!(surviving_old, 950);
    assert_table_invariants(&snapshot, &x, 1000);
    Ok(())
}

#[tokio::test]
async fn test_oversized_peer_list_disconnects_sender() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let (x, y) = (addr("x"), addr("y"));
    sim.add_node(x.clone(), no_seeds(), quiet_config());
    sim.add_node(y.clone(), no_seeds(), quiet_config());

    sim.node(&x)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;
    let y_conn = sim
        .network
        .connection_between(&y, &x)
        .expect("y holds a connection to x");
    let y_transport = sim.node(&y).transport.clone();

    let base: HashSet<NodeAddress> = (0..100).map(fake).collect();
    drop(y_transport.send_on_connection(
        &y_conn,
        WireMessage::GetPeersResponse {
            known_peers: base,
        },
    ));
    sim.wait_for(&x, Duration::from_secs(2), |s| s.reported.len() == 100)
        .await?;

    // A list above the policy limit gets the sender disconnected; the
    // reported set does not change.
    let huge: HashSet<NodeAddress> = (0..1101).map(fake).collect();
    drop(y_transport.send_on_connection(
        &y_conn,
        WireMessage::GetPeersResponse { known_peers: huge },
    ));

    let snapshot = sim
        .wait_for(&x, Duration::from_secs(2), |s| s.authenticated.is_empty())
        .await?;
    assert_eq!(snapshot.reported.len(), 100);
    assert!(sim.network.connection_between(&x, &y).is_none());

    // The remote side observed the close as well.
    sim.wait_for(&y, Duration::from_secs(2), |s| s.authenticated.is_empty())
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_peer_exchange_spreads_addresses() -> Result<()> {
    let mut sim = OverlaySimulation::new();
    let (x, y, z) = (addr("x"), addr("y"), addr("z"));

    // Fast gossip; x and z only know y.
    let config = fast_config();
    sim.add_node(x.clone(), no_seeds(), config.clone());
    sim.add_node(y.clone(), no_seeds(), config.clone());
    sim.add_node(z.clone(), no_seeds(), config.clone());

    sim.node(&x)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;
    sim.node(&z)
        .group
        .authenticate_to_direct_message_peer(y.clone())
        .await??;

    // The periodic exchange with y teaches x about z and z about x.
    let snapshot = sim
        .wait_for(&x, Duration::from_secs(3), |s| {
            s.reported.contains(&z) || s.authenticated.contains(&z)
        })
        .await?;
    assert_table_invariants(&snapshot, &x, 1000);

    sim.wait_for(&z, Duration::from_secs(3), |s| {
        s.reported.contains(&x) || s.authenticated.contains(&x)
    })
    .await?;
    Ok(())
}
