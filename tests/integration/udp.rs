use crate::*;

use parley_services::RouteOutcome;

async fn bind(config: &TransportConfig) -> Result<Arc<ReliableChannel>> {
    let channel = ReliableChannel::bind(addr(0), config.clone())
        .await
        .context("bind loopback UDP socket")?;
    Ok(Arc::new(channel))
}

/// Register and chat over real loopback UDP sockets.
#[tokio::test]
async fn test_chat_over_loopback_udp() -> Result<()> {
    let transport = TransportConfig {
        ack_timeout_ms: 200,
        poll_interval_ms: 20,
        ..TransportConfig::default()
    };
    let (shutdown, _) = broadcast::channel::<()>(1);

    let server_channel = bind(&transport).await?;
    let server_addr = server_channel.local_addr();
    let (directory, dispatcher) = server(server_channel, DispatchConfig::default(), shutdown.subscribe());
    tokio::spawn(dispatcher.run());

    let mut peers = Vec::new();
    for _ in 0..2 {
        let (node, dispatcher, events) = PeerNode::start(
            bind(&transport).await?,
            server_addr,
            &ClientConfig::default(),
            DispatchConfig::default(),
            shutdown.subscribe(),
        );
        tokio::spawn(dispatcher.run());
        peers.push(Peer { node, events });
    }
    let (a, b) = (&peers[0], &peers[1]);

    a.node.register("alice").await?;
    b.node.register("bob").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.node.send_message("bob", "over udp").await?, RouteOutcome::Delivered);
    let mut b = peers.remove(1);
    assert_eq!(b.next_message().await?, ("alice".into(), "over udp".into()));

    let entry = directory.lookup("bob").await.context("bob missing")?;
    assert_eq!(entry.endpoint, b.node.local_addr());

    let _ = shutdown.send(());
    Ok(())
}
