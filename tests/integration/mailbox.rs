use crate::*;

use parley_services::RouteOutcome;

/// Queued messages arrive in send order, and only the owner's mail is drained.
#[tokio::test(start_paused = true)]
async fn test_mailbox_is_fifo_per_nickname() -> Result<()> {
    let cluster = Cluster::start()?;
    let a = cluster.peer(51000)?;
    let mut b = cluster.peer(52000)?;
    let d = cluster.peer(54000)?;

    a.node.register("alice").await?;
    b.node.register("bob").await?;
    d.node.register("dave").await?;
    settle().await;

    b.node.deregister("bob").await?;
    d.node.deregister("dave").await?;
    settle().await;
    b.pending_events();

    for (to, text) in [
        ("bob", "M1"),
        ("dave", "X1"),
        ("bob", "M2"),
        ("dave", "X2"),
        ("bob", "M3"),
    ] {
        assert_eq!(a.node.send_message(to, text).await?, RouteOutcome::Queued);
    }
    assert_eq!(cluster.directory.queued_for("bob").await, 3);
    assert_eq!(cluster.directory.queued_for("dave").await, 2);

    b.node.register("bob").await?;

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(b.next_message().await?.1);
    }
    assert_eq!(received, vec!["M1", "M2", "M3"]);

    let wire: Vec<_> = cluster
        .delivered_commands(cluster.server_addr(), addr(52000))
        .into_iter()
        .filter(|(command, _)| command.starts_with("MSG:"))
        .map(|(_, payload)| payload)
        .collect();
    assert_eq!(
        wire,
        vec![
            serde_json::json!("alice: M1"),
            serde_json::json!("alice: M2"),
            serde_json::json!("alice: M3"),
        ]
    );
    assert_eq!(cluster.directory.queued_for("dave").await, 2);
    Ok(())
}

/// Several senders queue for one recipient; each is shown with its own name.
#[tokio::test(start_paused = true)]
async fn test_mailbox_keeps_sender_names() -> Result<()> {
    let cluster = Cluster::start()?;
    let a = cluster.peer(51000)?;
    let mut b = cluster.peer(52000)?;
    let c = cluster.peer(53000)?;

    a.node.register("alice").await?;
    b.node.register("bob").await?;
    c.node.register("carol").await?;
    settle().await;
    b.node.deregister("bob").await?;
    settle().await;

    a.node.send_message("bob", "from alice").await?;
    c.node.send_message("bob", "from carol").await?;
    b.node.register("bob").await?;

    assert_eq!(b.next_message().await?, ("alice".into(), "from alice".into()));
    assert_eq!(b.next_message().await?, ("carol".into(), "from carol".into()));
    Ok(())
}

/// Sending to a nickname that never registered is an error, not a queue.
#[tokio::test(start_paused = true)]
async fn test_unknown_recipient_is_not_queued() -> Result<()> {
    let cluster = Cluster::start()?;
    let a = cluster.peer(51000)?;
    a.node.register("alice").await?;
    settle().await;

    let err = a.node.send_message("zed", "hello?").await.unwrap_err();
    assert!(matches!(err, parley_services::PeerError::UnknownRecipient(ref n) if n == "zed"));
    assert_eq!(cluster.directory.queued_for("zed").await, 0);
    Ok(())
}
