#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use showlink_core::tcp::{
        ConnectionEvent, ServerEvent, TcpConnection, TcpConnectionConfig, TcpServer,
        TcpServerConfig,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Event channel closed")
    }

    fn loopback_server(max_connections: usize) -> TcpServerConfig {
        TcpServerConfig {
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            max_connections,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_connection_rejected_when_full() {
        // 1. Server that admits a single connection
        let (server, mut events) = TcpServer::new(loopback_server(1));
        let addr = server.start().await.unwrap();
        assert_eq!(next(&mut events).await, ServerEvent::Listening(addr));

        // 2. First client is admitted
        let _first = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            next(&mut events).await,
            ServerEvent::NewConnection { .. }
        ));

        // 3. Second client is shut down without being counted
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("Rejected socket should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.connections_count(), 1);
        assert!(
            timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err(),
            "Rejected connection must not raise events"
        );

        server.dispose().await;
    }

    #[tokio::test]
    async fn test_client_and_server_exchange_frames() {
        let (server, mut server_events) = TcpServer::new(loopback_server(8));
        let addr = server.start().await.unwrap();
        let _ = next(&mut server_events).await;

        let (client, mut client_events) = TcpConnection::new(TcpConnectionConfig::default());
        client.connect("127.0.0.1", addr.port()).unwrap();
        assert_eq!(next(&mut client_events).await, ConnectionEvent::Open);

        let id = match next(&mut server_events).await {
            ServerEvent::NewConnection { id, .. } => id,
            other => panic!("Expected NewConnection, got {:?}", other),
        };

        // Two frames in quick succession stay separate.
        client.send_text("cue:intro").await.unwrap();
        client.send_text("cue:loop").await.unwrap();
        assert_eq!(
            next(&mut server_events).await,
            ServerEvent::Message {
                id,
                data: Bytes::from_static(b"cue:intro")
            }
        );
        assert_eq!(
            next(&mut server_events).await,
            ServerEvent::Message {
                id,
                data: Bytes::from_static(b"cue:loop")
            }
        );

        assert_eq!(server.distribute(b"ack").await, 1);
        assert_eq!(
            next(&mut client_events).await,
            ConnectionEvent::Message(Bytes::from_static(b"ack"))
        );

        // Server shutdown is seen by the client as an unexpected loss.
        server.stop().await;
        loop {
            match next(&mut client_events).await {
                ConnectionEvent::Close => break,
                ConnectionEvent::Error { .. } => continue,
                other => panic!("Expected Close, got {:?}", other),
            }
        }
        client.dispose().await;
    }
}
