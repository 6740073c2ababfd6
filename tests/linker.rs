//! End-to-end linker behaviour over loopback sockets

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use linkwire::config::NetworkConfig;
use linkwire::error::ProtocolError;
use linkwire::protocol::message::{Message, NetworkPacket};
use linkwire::protocol::middleware::CompressionMiddleware;
use linkwire::transport::{LinkContext, Linker, LinkerListener, LinkerState, Transport};
use linkwire::utils::compression::CompressionKind;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    text: String,
}

impl Message for Chat {
    const TYPE_NAME: &'static str = "tests.linker.Chat";
}

fn chat_context(config: NetworkConfig) -> Arc<LinkContext> {
    LinkContext::builder(config)
        .formatters(|builder| {
            builder.register_serde::<Chat>()?;
            Ok(())
        })
        .build()
        .unwrap()
}

/// Forward every received `Chat` into a channel
fn collect_chats(context: &LinkContext) -> mpsc::UnboundedReceiver<Chat> {
    let (tx, rx) = mpsc::unbounded_channel();
    context
        .dispatcher()
        .register::<Chat, _>(move |chat, _| {
            let _ = tx.send(chat);
            Ok(())
        })
        .unwrap();
    rx
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn tcp_request_reply_through_handlers() {
    let server_ctx = chat_context(NetworkConfig::default());
    server_ctx
        .dispatcher()
        .register::<Chat, _>(|chat, linker| {
            linker.send_blocking(&Chat {
                text: chat.text.to_uppercase(),
            })
        })
        .unwrap();

    let client_ctx = chat_context(NetworkConfig::default());
    let mut replies = collect_chats(&client_ctx);

    let listener = LinkerListener::bind(server_ctx, "127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();
    let (client, server) = tokio::join!(Linker::connect(client_ctx, &addr), listener.accept());
    let client = client.unwrap();
    let server = server.unwrap();

    assert_eq!(client.transport(), Transport::Tcp);
    assert_eq!(client.remote_addr(), Some(listener.local_addr()));
    assert_eq!(server.remote_addr(), client.local_addr());
    assert_eq!(listener.active_connections().await, 1);

    for word in ["alpha", "beta", "gamma"] {
        client
            .send(&Chat {
                text: word.to_string(),
            })
            .await
            .unwrap();
    }
    for word in ["ALPHA", "BETA", "GAMMA"] {
        assert_eq!(recv(&mut replies).await.text, word);
    }

    client.close().await;
    tokio::time::timeout(WAIT, server.disconnected()).await.unwrap();
    wait_until(|| server.state() == LinkerState::Unconnected).await;
}

#[tokio::test]
async fn dropping_last_handle_closes_link() {
    let server_ctx = chat_context(NetworkConfig::default());
    let listener = LinkerListener::bind(Arc::clone(&server_ctx), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();
    let (client, server) = tokio::join!(
        Linker::connect(chat_context(NetworkConfig::default()), &addr),
        listener.accept()
    );
    let client = client.unwrap();
    let server = server.unwrap();

    // A clone keeps the link open
    let spare = client.clone();
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(spare.is_connected());
    let mut states = spare.subscribe();

    drop(spare);
    tokio::time::timeout(WAIT, server.disconnected())
        .await
        .expect("server saw the close");
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == LinkerState::Closed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.state(), LinkerState::Unconnected);
}

#[tokio::test]
async fn udp_linkers_exchange_messages() {
    let context = chat_context(NetworkConfig::default());
    let mut inbox = collect_chats(&context);

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (addr_a, addr_b) = (a.local_addr().unwrap(), b.local_addr().unwrap());

    let left = Linker::from_udp_socket(Arc::clone(&context), a, addr_b).unwrap();
    let right = Linker::from_udp_socket(Arc::clone(&context), b, addr_a).unwrap();
    assert_eq!(left.transport(), Transport::Udp);
    assert!(left.is_connected() && right.is_connected());

    left.send(&Chat { text: "ping".into() }).await.unwrap();
    assert_eq!(recv(&mut inbox).await.text, "ping");
    right.send(&Chat { text: "pong".into() }).await.unwrap();
    assert_eq!(recv(&mut inbox).await.text, "pong");

    let too_big = NetworkPacket {
        type_code: 77,
        bytes: Bytes::from(vec![0u8; 70_000]),
    };
    assert!(matches!(
        left.send(&too_big).await,
        Err(ProtocolError::OversizedPacket(_))
    ));

    left.close().await;
    right.close().await;
    assert_eq!(left.state(), LinkerState::Closed);
}

// Runs on the current-thread runtime so a reader stuck on one datagram
// would also starve the sender below.
#[tokio::test]
async fn udp_malformed_datagram_does_not_stall_link() {
    let context = chat_context(NetworkConfig::default());
    let mut inbox = collect_chats(&context);

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (addr_a, addr_b) = (a.local_addr().unwrap(), b.local_addr().unwrap());
    let left = Linker::from_udp_socket(Arc::clone(&context), a, addr_b).unwrap();
    let right = Linker::from_udp_socket(Arc::clone(&context), b, addr_a).unwrap();

    // Valid magic, negative payload length
    let mut bad = b"LWK1".to_vec();
    bad.extend_from_slice(&5i32.to_le_bytes());
    bad.extend_from_slice(&(-1i32).to_le_bytes());
    let right_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    right_socket.send_to(&bad, addr_a).await.unwrap();
    wait_until(|| context.metrics().snapshot().protocol_errors >= 1).await;

    right.send(&Chat { text: "after".into() }).await.unwrap();
    assert_eq!(recv(&mut inbox).await.text, "after");
    assert!(left.is_connected());

    left.close().await;
    right.close().await;
}

#[tokio::test]
async fn heartbeat_negotiated_from_one_side() {
    let client_ctx = chat_context(NetworkConfig::default_with_overrides(|c| {
        c.linker.need_heartbeat = true;
        c.linker.heartbeat_interval = Duration::from_millis(50);
        c.linker.heartbeat_timeout = Duration::from_millis(200);
    }));
    let server_ctx = chat_context(NetworkConfig::default());

    let listener = LinkerListener::bind(Arc::clone(&server_ctx), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();
    let (client, server) = tokio::join!(
        Linker::connect(Arc::clone(&client_ctx), &addr),
        listener.accept()
    );
    let client = client.unwrap();
    let server = server.unwrap();

    assert!(client.heartbeat_enabled());
    wait_until(|| server.heartbeat_enabled()).await;

    // Well past the client's silence limit, kept alive by the server's heartbeats
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.is_connected());
    assert!(server.is_connected());
    assert!(client_ctx.metrics().snapshot().heartbeats_sent > 0);
    assert!(server_ctx.metrics().snapshot().heartbeats_sent > 0);

    client.close().await;
}

#[tokio::test]
async fn silent_peer_is_dropped_by_heartbeat_timeout() {
    let server_ctx = chat_context(NetworkConfig::default_with_overrides(|c| {
        c.linker.need_heartbeat = true;
        c.linker.heartbeat_interval = Duration::from_millis(50);
        c.linker.heartbeat_timeout = Duration::from_millis(200);
    }));
    let listener = LinkerListener::bind(Arc::clone(&server_ctx), "127.0.0.1:0")
        .await
        .unwrap();

    // A raw socket never sends a single byte
    let (raw, server) = tokio::join!(
        tokio::net::TcpStream::connect(listener.local_addr()),
        listener.accept()
    );
    let _raw = raw.unwrap();
    let server = server.unwrap();
    assert!(server.is_connected());

    tokio::time::timeout(WAIT, server.disconnected())
        .await
        .expect("silent peer dropped");
    assert_eq!(server.state(), LinkerState::Unconnected);
    assert!(server_ctx.metrics().snapshot().connection_errors >= 1);
}

#[tokio::test]
async fn compression_middleware_shrinks_wire_traffic() {
    let build = || {
        LinkContext::builder(NetworkConfig::default())
            .middleware(CompressionMiddleware::new(CompressionKind::Lz4, 64))
            .build()
            .unwrap()
    };
    let client_ctx = build();
    let server_ctx = build();

    let (tx, mut rx) = mpsc::unbounded_channel();
    server_ctx
        .dispatcher()
        .register::<NetworkPacket, _>(move |packet, _| {
            let _ = tx.send(packet);
            Ok(())
        })
        .unwrap();

    let listener = LinkerListener::bind(server_ctx, "127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();
    let (client, _server) = tokio::join!(
        Linker::connect(Arc::clone(&client_ctx), &addr),
        listener.accept()
    );
    let client = client.unwrap();

    let packet = NetworkPacket {
        type_code: 42,
        bytes: Bytes::from(b"linkwire ".repeat(8 * 1024)),
    };
    client.send(&packet).await.unwrap();
    assert_eq!(recv(&mut rx).await, packet);
    assert!(client_ctx.metrics().snapshot().bytes_sent < (packet.bytes.len() / 4) as u64);

    client.close().await;
}

#[tokio::test]
async fn connections_beyond_limit_are_dropped() {
    let server_ctx = chat_context(NetworkConfig::default_with_overrides(|c| {
        c.server.max_connections = 1;
    }));
    let listener = Arc::new(
        LinkerListener::bind(Arc::clone(&server_ctx), "127.0.0.1:0")
            .await
            .unwrap(),
    );
    let addr = listener.local_addr().to_string();

    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    let acceptor = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            while let Ok(linker) = listener.accept().await {
                if accepted_tx.send(linker).is_err() {
                    break;
                }
            }
        })
    };

    let client_ctx = chat_context(NetworkConfig::default());
    let first = Linker::connect(Arc::clone(&client_ctx), &addr).await.unwrap();
    let _held = recv(&mut accepted).await;

    let second = Linker::connect(Arc::clone(&client_ctx), &addr).await.unwrap();
    tokio::time::timeout(WAIT, second.disconnected())
        .await
        .expect("over-limit connection dropped");
    assert!(first.is_connected());
    assert_eq!(listener.active_connections().await, 1);

    acceptor.abort();
    first.close().await;
}

#[tokio::test]
async fn dialer_reconnects_after_remote_close() {
    let server_ctx = chat_context(NetworkConfig::default());
    let listener = Arc::new(
        LinkerListener::bind(server_ctx, "127.0.0.1:0")
            .await
            .unwrap(),
    );
    let addr = listener.local_addr().to_string();

    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    let acceptor = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            while let Ok(linker) = listener.accept().await {
                if accepted_tx.send(linker).is_err() {
                    break;
                }
            }
        })
    };

    let client_ctx = chat_context(NetworkConfig::default_with_overrides(|c| {
        c.client.auto_reconnect = true;
        c.client.max_reconnect_attempts = 5;
        c.client.reconnect_delay = Duration::from_millis(50);
    }));
    let client = Linker::connect(client_ctx, &addr).await.unwrap();
    let mut states = client.subscribe();

    let first = recv(&mut accepted).await;
    first.close().await;

    // The redial shows up as a second accepted connection
    let _second = recv(&mut accepted).await;
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == LinkerState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert!(client.is_connected());

    acceptor.abort();
    client.close().await;
}

#[tokio::test]
async fn serve_closes_remaining_links_on_shutdown() {
    let server_ctx = chat_context(NetworkConfig::default_with_overrides(|c| {
        c.server.shutdown_timeout = Duration::from_secs(1);
    }));
    let listener = LinkerListener::bind(server_ctx, "127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (link_tx, mut links) = mpsc::unbounded_channel();
    let server = tokio::spawn(listener.serve_with_shutdown(shutdown_rx, move |linker| {
        let _ = link_tx.send(linker.id());
    }));

    let client = Linker::connect(chat_context(NetworkConfig::default()), &addr)
        .await
        .unwrap();
    recv(&mut links).await;

    shutdown_tx.send(()).await.unwrap();
    tokio::time::timeout(WAIT, server)
        .await
        .expect("serve returned")
        .unwrap()
        .unwrap();
    tokio::time::timeout(WAIT, client.disconnected())
        .await
        .expect("client saw the close");
}

#[tokio::test]
async fn try_send_reports_full_queue() {
    let server_ctx = chat_context(NetworkConfig::default());
    let client_ctx = chat_context(NetworkConfig::default_with_overrides(|c| {
        c.linker.send_queue_depth = 1;
    }));
    let listener = LinkerListener::bind(server_ctx, "127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();
    let (client, _server) = tokio::join!(Linker::connect(client_ctx, &addr), listener.accept());
    let client = client.unwrap();

    let chat = Chat {
        text: "x".repeat(1024),
    };
    let mut busy = false;
    for _ in 0..10_000 {
        match client.try_send(&chat) {
            Ok(()) => {}
            Err(ProtocolError::ResourceBusy(_)) => {
                busy = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(busy);
    client.close().await;
}
