use crate::*;

use parley_core::Presence;
use parley_services::{FaultRule, PeerError, RouteOutcome};

async fn alice_and_bob(cluster: &Cluster) -> Result<(Peer, Peer)> {
    let a = cluster.peer(51000)?;
    let b = cluster.peer(52000)?;
    a.node.register("alice").await?;
    b.node.register("bob").await?;
    settle().await;
    Ok((a, b))
}

/// Four consecutive losses of the data unit are absorbed by retransmission.
#[tokio::test(start_paused = true)]
async fn test_message_survives_four_losses() -> Result<()> {
    let cluster = Cluster::start()?;
    let (a, mut b) = alice_and_bob(&cluster).await?;
    b.pending_events();

    cluster
        .net
        .inject(FaultRule::drop(4).from(addr(51000)).to(addr(52000)).only(UnitKind::Data));

    assert_eq!(a.node.send_message("bob", "lossy").await?, RouteOutcome::Delivered);
    assert_eq!(b.next_message().await?, ("alice".into(), "lossy".into()));
    assert_eq!(cluster.net.count(addr(51000), addr(52000), UnitKind::Data), 5);
    Ok(())
}

/// Corrupted units are discarded without an ACK and retransmitted intact.
#[tokio::test(start_paused = true)]
async fn test_corrupted_units_are_retransmitted() -> Result<()> {
    let cluster = Cluster::start()?;
    let (a, mut b) = alice_and_bob(&cluster).await?;
    b.pending_events();

    cluster.net.inject(FaultRule::corrupt(2).to(addr(52000)).only(UnitKind::Data));

    assert_eq!(a.node.send_message("bob", "bits intact").await?, RouteOutcome::Delivered);
    assert_eq!(b.next_message().await?, ("alice".into(), "bits intact".into()));
    settle().await;
    assert!(b.pending_events().is_empty());
    Ok(())
}

/// Lost ACKs make the sender retransmit; the receiver shows the message once.
#[tokio::test(start_paused = true)]
async fn test_lost_acks_do_not_duplicate_messages() -> Result<()> {
    let cluster = Cluster::start()?;
    let (a, mut b) = alice_and_bob(&cluster).await?;
    b.pending_events();

    cluster
        .net
        .inject(FaultRule::drop(3).from(addr(52000)).to(addr(51000)).only(UnitKind::Ack));

    assert_eq!(a.node.send_message("bob", "just once").await?, RouteOutcome::Delivered);
    assert_eq!(b.next_message().await?, ("alice".into(), "just once".into()));
    settle().await;
    assert!(b.pending_events().is_empty(), "duplicate delivered");
    Ok(())
}

/// ACKs slower than the timeout trigger retransmissions but still one delivery.
#[tokio::test(start_paused = true)]
async fn test_slow_network_retransmits_without_duplicates() -> Result<()> {
    let cluster = Cluster::start()?;
    let (a, mut b) = alice_and_bob(&cluster).await?;
    b.pending_events();

    // 300ms each way: the first ACK lands after the 500ms timeout.
    cluster.net.set_delay(Some(Duration::from_millis(300)));
    assert_eq!(a.node.send_message("bob", "slow").await?, RouteOutcome::Delivered);
    assert!(cluster.net.count(addr(51000), addr(52000), UnitKind::Data) >= 2);

    assert_eq!(b.next_message().await?, ("alice".into(), "slow".into()));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(b.pending_events().is_empty(), "duplicate delivered");
    Ok(())
}

/// A crashed recipient: the sender falls back to the server, the message is
/// queued, and delivered once the recipient registers again.
#[tokio::test(start_paused = true)]
async fn test_crashed_peer_gets_mail_after_restart() -> Result<()> {
    let cluster = Cluster::start()?;
    let (mut a, mut b) = alice_and_bob(&cluster).await?;
    a.pending_events();
    b.pending_events();

    cluster.net.set_down(addr(52000), true);
    assert_eq!(a.node.send_message("bob", "are you there?").await?, RouteOutcome::Queued);

    let entry = cluster.directory.lookup("bob").await.context("bob missing")?;
    assert_eq!(entry.presence, Presence::Offline);
    let snap = a.next_snapshot().await?;
    assert_eq!(snap.get("bob").map(|e| e.presence), Some(Presence::Offline));

    cluster.net.set_down(addr(52000), false);
    b.node.register("bob").await?;
    assert_eq!(b.next_message().await?, ("alice".into(), "are you there?".into()));
    Ok(())
}

/// A peer that cannot reach the server is told so.
#[tokio::test(start_paused = true)]
async fn test_unreachable_server_is_reported() -> Result<()> {
    let cluster = Cluster::start()?;
    let a = cluster.peer(51000)?;

    cluster.net.set_down(cluster.server_addr(), true);
    let err = a.node.register("alice").await.unwrap_err();
    assert!(matches!(err, PeerError::ServerUnreachable(s) if s == cluster.server_addr()));
    Ok(())
}

/// A peer that misses a broadcast stays online in the directory.
#[tokio::test(start_paused = true)]
async fn test_missed_broadcast_does_not_change_presence() -> Result<()> {
    let cluster = Cluster::start()?;
    let (mut a, _b) = alice_and_bob(&cluster).await?;
    a.pending_events();

    cluster.net.set_down(addr(51000), true);
    let carol = cluster.peer(53000)?;
    carol.node.register("carol").await?;

    let entry = cluster.directory.lookup("alice").await.context("alice missing")?;
    assert_eq!(entry.presence, Presence::Online);
    settle().await;
    assert!(a.pending_events().is_empty());
    Ok(())
}
