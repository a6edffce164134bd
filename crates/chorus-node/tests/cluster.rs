//! A registry and four peers on loopback TCP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_node::{
    ListenAddr, PeerCommand, PeerConfig, PeerNode, RegistryCommand, RegistryConfig, RegistryNode,
};
use chorus_protocols::{QueryType, UNLIMITED_HOPS};
use chorus_topology::PeerAddress;
use uuid::Uuid;

fn loopback() -> ListenAddr {
    ListenAddr {
        host: "127.0.0.1".into(),
        port: 0,
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn cluster(device_counts: &[usize]) -> (Arc<RegistryNode>, Vec<Arc<PeerNode>>) {
    let registry = RegistryNode::start(RegistryConfig { listen: loopback() })
        .await
        .unwrap();

    let mut peers = Vec::new();
    for &device_count in device_counts {
        let config = PeerConfig {
            listen: loopback(),
            registry: registry.identity().clone(),
            device_count,
            cache_size: 400,
            query_cache_size: 40,
            gossip_interval: Duration::from_millis(200),
            skip_probability: 0.01,
        };
        peers.push(PeerNode::start(config).await.unwrap());
    }

    eventually("registrations", || registry.peers().len() == device_counts.len()).await;
    (registry, peers)
}

fn answered(registry: &RegistryNode, id: &Uuid) -> bool {
    registry
        .results()
        .get(id)
        .map_or(false, |r| r.last_updated_at.is_some())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlay_queries_and_shutdown() {
    let (registry, peers) = cluster(&[5, 8, 11, 14]).await;

    registry
        .execute(RegistryCommand::BuildOverlay {
            min_degree: 2,
            max_degree: 2,
        })
        .unwrap();
    registry.execute(RegistryCommand::ConnectPeers).unwrap();
    eventually("overlay links", || {
        peers.iter().all(|p| p.neighbors().len() == 2)
    })
    .await;

    // Registered inventories survive because the overlay was built from them
    let mut counts: Vec<usize> = peers.iter().map(|p| p.inventory().device_count()).collect();
    counts.sort();
    assert_eq!(counts, vec![5, 8, 11, 14]);
    assert!(peers[0].execute(PeerCommand::Neighbors).starts_with("2 neighbours"));

    registry.execute(RegistryCommand::CheckPeers).unwrap();
    eventually("overlay check", || registry.overlay_check().successes == 4).await;

    // Every device reports power consumption
    let (flood, _) = registry
        .inject(QueryType::Flood, "POWER_CONSUMPTION", UNLIMITED_HOPS)
        .unwrap();
    eventually("flood totals", || {
        registry
            .results()
            .get(&flood)
            .map_or(false, |r| r.total_devices_checked >= 38)
    })
    .await;
    let r = registry.results().get(&flood).unwrap();
    assert!(r.total_devices_with_metric >= 38);

    let (walk, _) = registry
        .inject(QueryType::RandomWalk, "POWER_CONSUMPTION", 3)
        .unwrap();
    eventually("random walk reply", || answered(&registry, &walk)).await;
    assert!(registry.results().get(&walk).unwrap().max_hop <= 3);

    // Wait for anti-entropy to spread every peer's own metrics
    eventually("gossip convergence", || {
        peers.iter().all(|p| {
            p.engine()
                .location_snapshot()
                .iter()
                .filter(|l| l.name == "POWER_CONSUMPTION")
                .count()
                == 4
        })
    })
    .await;
    let (gossip, _) = registry
        .inject(QueryType::GossipLocation, "POWER_CONSUMPTION", 4)
        .unwrap();
    eventually("gossip reply", || answered(&registry, &gossip)).await;
    let (distance, _) = registry
        .inject(QueryType::GossipDistance, "POWER_CONSUMPTION", 4)
        .unwrap();
    eventually("distance gossip reply", || answered(&registry, &distance)).await;

    // Gossip jumps to distant holders leave the overlay as built
    let map = registry.overlay().unwrap();
    for p in &peers {
        let mut expected: Vec<PeerAddress> = map
            .neighbors(p.identity())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        expected.sort();
        assert_eq!(p.neighbors(), expected);
    }

    let json = registry.execute(RegistryCommand::PrintResults).unwrap();
    assert!(json.contains(&flood.to_string()));
    assert!(json.contains("\"query_type\": \"RandomWalk\""));

    registry.execute(RegistryCommand::Shutdown).unwrap();
    eventually("peers stopped", || peers.iter().all(|p| p.is_stopped())).await;
    assert!(registry.is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn imported_overlay_reassigns_devices() {
    let (registry, peers) = cluster(&[3, 3, 3]).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("triangle.csv");
    std::fs::write(
        &path,
        "2,2\n\
         0,vertex:1025,20,1,vertex:1026,20,4\n\
         0,vertex:1025,20,2,vertex:1027,20,3\n\
         1,vertex:1026,20,2,vertex:1027,20,6\n",
    )
    .unwrap();

    registry
        .execute(RegistryCommand::ImportOverlay(path))
        .unwrap();
    registry.execute(RegistryCommand::ConnectPeers).unwrap();

    eventually("triangle links", || {
        peers.iter().all(|p| p.neighbors().len() == 2)
    })
    .await;
    eventually("device swap", || {
        peers.iter().all(|p| p.inventory().device_count() == 20)
    })
    .await;

    registry.stop();
    for p in &peers {
        p.stop();
    }
}
