#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary conditions and error paths across the public surface

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use linkwire::config::{NetworkConfig, HEADER_LEN, MAGIC_BYTES};
use linkwire::core::packet::{find_head, Frame, PacketHeader, HEARTBEAT_TYPE_CODE};
use linkwire::error::{ProtocolError, Result};
use linkwire::protocol::message::{type_code_of, Message, NetworkPacket};
use linkwire::protocol::middleware::{
    CompressionMiddleware, Direction, Middleware, MiddlewareContext, Next, Pipeline,
};
use linkwire::protocol::peer::{PeerAddress, PeerId};
use linkwire::transport::{LinkContext, Linker, LinkerListener, LinkerState};
use linkwire::utils::compression::CompressionKind;

// ============================================================================
// HEADER EDGE CASES
// ============================================================================

#[test]
fn test_header_needs_all_twelve_bytes() {
    let mut bytes = MAGIC_BYTES.to_vec();
    bytes.extend_from_slice(&5i32.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    assert_eq!(bytes.len(), HEADER_LEN);

    assert!(PacketHeader::parse(&bytes[..HEADER_LEN - 1]).unwrap().is_none());
    let header = PacketHeader::parse(&bytes).unwrap().expect("complete header");
    assert_eq!(header.type_code, 5);
    assert_eq!(header.payload_len(1024).unwrap(), 0);
}

#[test]
fn test_header_without_magic_is_invalid() {
    let bytes = [0u8; HEADER_LEN];
    assert!(matches!(
        PacketHeader::parse(&bytes),
        Err(ProtocolError::InvalidHeader)
    ));
}

#[test]
fn test_negative_length_rejected() {
    let header = PacketHeader {
        type_code: 9,
        length: -1,
    };
    assert!(matches!(
        header.payload_len(1024),
        Err(ProtocolError::InvalidHeader)
    ));
}

#[test]
fn test_length_above_limit_rejected() {
    let header = PacketHeader {
        type_code: 9,
        length: 2048,
    };
    assert!(matches!(
        header.payload_len(1024),
        Err(ProtocolError::OversizedPacket(2048))
    ));
    assert_eq!(header.payload_len(2048).unwrap(), 2048);
}

#[test]
fn test_find_head_edges() {
    assert_eq!(find_head(&[]), None);
    assert_eq!(find_head(&MAGIC_BYTES[..3]), None);
    assert_eq!(find_head(&MAGIC_BYTES), Some(0));

    let mut noisy = vec![MAGIC_BYTES[0], MAGIC_BYTES[1], 0xFF];
    noisy.extend_from_slice(&MAGIC_BYTES);
    assert_eq!(find_head(&noisy), Some(3));
}

#[test]
fn test_empty_frame_wire_form() {
    let frame = Frame::empty(HEARTBEAT_TYPE_CODE);
    assert!(frame.is_heartbeat());
    assert_eq!(frame.wire_len(), HEADER_LEN);

    let bytes = frame.to_bytes().unwrap();
    assert_eq!(&bytes[..4], &MAGIC_BYTES);
    assert_eq!(&bytes[4..], &[0u8; 8]);
}

// ============================================================================
// TYPE CODES
// ============================================================================

#[test]
fn test_type_codes_avoid_control_codes() {
    for name in ["", "a", "linkwire.NetworkPacket", "app.Chat", "app.Chat2"] {
        let code = type_code_of(name);
        assert_ne!(code, 0, "{name}");
        assert_ne!(code, 1, "{name}");
    }
    assert_eq!(type_code_of("app.Chat"), type_code_of("app.Chat"));
    assert_ne!(type_code_of("app.Chat"), type_code_of("app.Chat2"));
}

// ============================================================================
// PEER IDENTITY
// ============================================================================

#[test]
fn test_peer_id_length_enforced() {
    assert!(PeerId::from_slice(&[1; 20]).is_ok());
    assert!(matches!(
        PeerId::from_slice(&[1; 19]),
        Err(ProtocolError::InvalidData(_))
    ));
    assert!(PeerId::from_slice(&[1; 21]).is_err());
}

#[test]
fn test_peer_id_display_is_hex() {
    let id = PeerId::new([0xAB; 20]);
    let rendered = id.to_string();
    assert_eq!(rendered.len(), 40);
    assert!(rendered.chars().all(|c| c == 'a' || c == 'b'));
    assert_ne!(PeerId::random(), PeerId::random());
}

#[test]
fn test_peer_address_socket_form() {
    let address = PeerAddress::new([192, 168, 1, 20].into(), 0);
    assert_eq!(address.port(), 0);
    assert_eq!(address.to_socket_addr().to_string(), "192.168.1.20:0");
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

struct Tag(&'static [u8]);

impl Middleware for Tag {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
        match ctx.direction {
            Direction::Outbound => {
                let mut tagged = ctx.payload().to_vec();
                tagged.extend_from_slice(self.0);
                ctx.set_output(&tagged[..]);
            }
            Direction::Inbound => {
                let payload = ctx.payload();
                let Some(body) = payload.strip_suffix(self.0) else {
                    ctx.terminate_with(ProtocolError::InvalidData("missing tag".into()));
                    return Ok(());
                };
                let body = body.to_vec();
                ctx.set_output(&body[..]);
            }
        }
        next.run(ctx)
    }
}

struct DropAll;

impl Middleware for DropAll {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn handle(&self, ctx: &mut MiddlewareContext, _next: Next<'_>) -> Result<()> {
        ctx.terminate();
        Ok(())
    }
}

#[test]
fn test_layered_middleware_unwraps_in_reverse() {
    let pipeline = Pipeline::new().with(Tag(b"-a")).with(Tag(b"-b"));
    let wire = pipeline
        .process(Direction::Outbound, 7, Bytes::from_static(b"body"))
        .unwrap()
        .expect("not terminated");
    assert_eq!(&wire[..], b"body-a-b");

    let back = pipeline
        .process(Direction::Inbound, 7, wire)
        .unwrap()
        .expect("not terminated");
    assert_eq!(&back[..], b"body");
}

#[test]
fn test_terminate_with_error_surfaces() {
    let pipeline = Pipeline::new().with(Tag(b"-a"));
    assert!(matches!(
        pipeline.process(Direction::Inbound, 7, Bytes::from_static(b"untagged")),
        Err(ProtocolError::InvalidData(_))
    ));
}

#[test]
fn test_terminate_drops_frame_and_skips_rest() {
    let pipeline = Pipeline::new().with(DropAll).with(Tag(b"-never"));
    assert!(pipeline
        .process(Direction::Outbound, 7, Bytes::from_static(b"x"))
        .unwrap()
        .is_none());
}

#[test]
fn test_empty_pipeline_passes_payload_through() {
    let pipeline = Pipeline::new();
    assert!(pipeline.is_empty());
    let out = pipeline
        .process(Direction::Inbound, 7, Bytes::from_static(b"same"))
        .unwrap();
    assert_eq!(out.as_deref(), Some(&b"same"[..]));
}

#[test]
fn test_compression_middleware_rejects_corrupt_input() {
    let pipeline = Pipeline::new().with(CompressionMiddleware::new(CompressionKind::Zstd, 0));
    let compressed = pipeline
        .process(Direction::Outbound, 7, Bytes::from(vec![42u8; 4096]))
        .unwrap()
        .unwrap();
    assert!(compressed.len() < 4096);

    let mut corrupt = compressed.to_vec();
    corrupt[0] = 0x7F;
    assert!(pipeline
        .process(Direction::Inbound, 7, Bytes::from(corrupt))
        .is_err());
}

// ============================================================================
// DISPATCHER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Ping(u32);

impl Message for Ping {
    const TYPE_NAME: &'static str = "tests.edge.Ping";
}

fn context() -> Arc<LinkContext> {
    LinkContext::builder(NetworkConfig::default())
        .formatters(|builder| {
            builder.register_formatter::<Ping, _>(PingFormatter)?;
            Ok(())
        })
        .build()
        .unwrap()
}

struct PingFormatter;

impl linkwire::formatter::Formatter<Ping> for PingFormatter {
    fn serialize(&self, value: &Ping, buf: &mut linkwire::utils::PooledBuffer) -> Result<()> {
        buf.write_slice(&value.0.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &mut linkwire::utils::PooledBuffer) -> Result<Ping> {
        Ok(Ping(u32::from_le_bytes(
            linkwire::formatter::builtin::read_array(buf)?,
        )))
    }
}

#[test]
fn test_dispatcher_rejects_duplicates_and_control_codes() {
    let context = context();
    let dispatcher = context.dispatcher();
    dispatcher.register::<Ping, _>(|_, _| Ok(())).unwrap();
    assert!(matches!(
        dispatcher.register::<Ping, _>(|_, _| Ok(())),
        Err(ProtocolError::DuplicateTypeCode(code)) if code == Ping::TYPE_CODE
    ));
    assert!(dispatcher.register_raw(HEARTBEAT_TYPE_CODE, |_, _| Ok(())).is_err());
}

// ============================================================================
// LINKER LIFECYCLE
// ============================================================================

async fn pair(context: Arc<LinkContext>) -> (Linker, Linker, LinkerListener) {
    let listener = LinkerListener::bind(Arc::clone(&context), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();
    let (client, server) = tokio::join!(Linker::connect(context, &addr), listener.accept());
    (client.unwrap(), server.unwrap(), listener)
}

#[tokio::test]
async fn test_operations_after_close_are_disposed() {
    let (client, _server, _listener) = pair(context()).await;
    assert_eq!(client.state(), LinkerState::Connected);

    client.close().await;
    assert_eq!(client.state(), LinkerState::Closed);

    assert!(matches!(
        client.send(&Ping(1)).await,
        Err(ProtocolError::Disposed(_))
    ));
    assert!(matches!(
        client.try_send(&Ping(1)),
        Err(ProtocolError::Disposed(_))
    ));
    assert!(matches!(
        client.reconnect().await,
        Err(ProtocolError::Disposed(_))
    ));

    // A second close is a no-op
    client.close().await;
    assert_eq!(client.state(), LinkerState::Closed);
}

#[tokio::test]
async fn test_remote_close_moves_peer_to_unconnected() {
    let (client, server, _listener) = pair(context()).await;
    client.close().await;

    tokio::time::timeout(Duration::from_secs(5), server.disconnected())
        .await
        .expect("server noticed the close");
    assert_eq!(server.state(), LinkerState::Unconnected);
    assert!(matches!(
        server.send(&Ping(2)).await,
        Err(ProtocolError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_reconnect_requires_dropped_link() {
    let (client, server, _listener) = pair(context()).await;
    assert!(matches!(
        client.reconnect().await,
        Err(ProtocolError::InvalidState { .. })
    ));

    // Accepted links never redial
    client.close().await;
    server.disconnected().await;
    assert!(matches!(
        server.reconnect().await,
        Err(ProtocolError::TransportError(_))
    ));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let context = context();
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    let result = Linker::connect(Arc::clone(&context), &addr).await;
    assert!(result.is_err());
    assert!(context.metrics().snapshot().connection_errors >= 1);
}

#[tokio::test]
async fn test_oversized_message_rejected_before_queueing() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.linker.max_frame_size = 64 * 1024;
        c.splitter.chunk_size = 32 * 1024;
    });
    let context = LinkContext::builder(config).build().unwrap();
    let (client, _server, _listener) = pair(context).await;

    let packet = NetworkPacket {
        type_code: 99,
        bytes: Bytes::from(vec![0u8; 64 * 1024]),
    };
    assert!(matches!(
        client.send(&packet).await,
        Err(ProtocolError::OversizedPacket(_))
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_unhandled_type_code_counts_as_dispatch_failure() {
    let context = context();
    let (client, _server, _listener) = pair(Arc::clone(&context)).await;

    client.send(&Ping(5)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while context.metrics().snapshot().dispatch_failures == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dispatch failure recorded");
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_dropping_middleware_short_circuits_send() {
    let context = LinkContext::builder(NetworkConfig::default())
        .middleware(DropAll)
        .build()
        .unwrap();
    let (client, _server, _listener) = pair(Arc::clone(&context)).await;

    let packet = NetworkPacket {
        type_code: 3,
        bytes: Bytes::from_static(b"dropped"),
    };
    client.send(&packet).await.unwrap();
    assert_eq!(context.metrics().snapshot().frames_short_circuited, 1);
}
