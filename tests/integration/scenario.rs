use crate::*;

use parley_core::Presence;
use parley_services::{Registration, RouteOutcome};

/// The full register / chat / go offline / store-and-forward / come back cycle.
#[tokio::test(start_paused = true)]
async fn test_end_to_end_store_and_forward() -> Result<()> {
    let cluster = Cluster::start()?;
    let mut a = cluster.peer(51000)?;
    let mut b = cluster.peer(52000)?;

    // A registers → {A}
    assert_eq!(a.node.register("alice").await?, Registration::Registered);
    let snap = a.next_snapshot().await?;
    assert_eq!(presences(&snap), vec![("alice".into(), Presence::Online)]);

    // B registers → both see {A, B}
    assert_eq!(b.node.register("bob").await?, Registration::Registered);
    let both = vec![
        ("alice".to_string(), Presence::Online),
        ("bob".to_string(), Presence::Online),
    ];
    assert_eq!(presences(&a.next_snapshot().await?), both);
    assert_eq!(presences(&b.next_snapshot().await?), both);

    // B → A directly; the server never sees the message.
    assert_eq!(b.node.send_message("alice", "hi alice").await?, RouteOutcome::Delivered);
    assert_eq!(a.next_message().await?, ("bob".into(), "hi alice".into()));
    assert!(cluster
        .delivered_commands(addr(52000), cluster.server_addr())
        .iter()
        .all(|(command, _)| !command.starts_with("MSG:")));

    // B deregisters → A sees {A: online, B: offline}
    b.node.deregister("bob").await?;
    let snap = a.next_snapshot().await?;
    assert_eq!(
        presences(&snap),
        vec![
            ("alice".into(), Presence::Online),
            ("bob".into(), Presence::Offline),
        ]
    );
    settle().await;
    assert!(b.pending_events().is_empty(), "offline nickname received a broadcast");

    // A → B is queued by the server.
    assert_eq!(a.node.send_message("bob", "see you later").await?, RouteOutcome::Queued);
    assert_eq!(cluster.directory.queued_for("bob").await, 1);

    // B comes back: the queued message arrives before the new snapshot.
    assert_eq!(b.node.register("bob").await?, Registration::Reactivated);
    match b.next_event().await? {
        PeerEvent::Message { from, text } => {
            assert_eq!((from.as_str(), text.as_str()), ("alice", "see you later"));
        }
        other => panic!("expected the queued message first, got {other:?}"),
    }
    let snap = b.next_snapshot().await?;
    assert_eq!(presences(&snap), both);
    assert_eq!(cluster.directory.queued_for("bob").await, 0);

    // Same order on the wire.
    let to_b: Vec<_> = cluster
        .delivered_commands(cluster.server_addr(), addr(52000))
        .into_iter()
        .map(|(command, _)| command)
        .collect();
    let msg = to_b.iter().rposition(|c| c == "MSG:bob").context("no MSG:bob sent")?;
    let update = to_b.iter().rposition(|c| c == "update:").context("no update sent")?;
    assert!(msg < update, "snapshot overtook queued message: {to_b:?}");
    Ok(())
}

/// Registering an online nickname twice fails; after going offline the same
/// nickname can come back from a different endpoint.
#[tokio::test(start_paused = true)]
async fn test_name_taken_then_reactivated_elsewhere() -> Result<()> {
    let cluster = Cluster::start()?;
    let alice = cluster.peer(51000)?;
    let laptop = cluster.peer(51001)?;

    alice.node.register("alice").await?;
    let err = laptop.node.register("alice").await.unwrap_err();
    assert!(matches!(err, parley_services::PeerError::NameTaken(ref n) if n == "alice"));

    alice.node.deregister("alice").await?;
    assert_eq!(laptop.node.register("alice").await?, Registration::Reactivated);

    let entry = cluster.directory.lookup("alice").await.context("alice missing")?;
    assert_eq!(entry.endpoint, addr(51001));
    assert_eq!(entry.presence, Presence::Online);
    Ok(())
}

/// Every online peer converges on the same directory version.
#[tokio::test(start_paused = true)]
async fn test_all_peers_converge_on_latest_snapshot() -> Result<()> {
    let cluster = Cluster::start()?;
    let names = ["alice", "bob", "carol", "dave"];
    let mut peers = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let peer = cluster.peer(51000 + i as u16)?;
        peer.node.register(name).await?;
        peers.push(peer);
    }
    peers[1].node.deregister("bob").await?;
    settle().await;

    let authoritative = cluster.directory.snapshot().await;
    for (name, peer) in names.iter().zip(&peers) {
        if *name == "bob" {
            continue;
        }
        assert_eq!(peer.node.directory().await, authoritative, "{name} is out of date");
    }
    Ok(())
}
