#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use linkwire::config::NetworkConfig;
use linkwire::core::codec::FrameCodec;
use linkwire::core::packet::Frame;
use linkwire::protocol::message::Message;
use linkwire::transport::{LinkContext, Linker, LinkerListener};
use linkwire::utils::buffer_pool::BufferPool;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Seq {
    sender: u32,
    seq: u32,
    filler: Vec<u8>,
}

impl Message for Seq {
    const TYPE_NAME: &'static str = "tests.stress.Seq";
}

#[test]
fn stress_frame_encode_decode_large_series() {
    let pool = BufferPool::default();
    let mut codec = FrameCodec::new(pool.clone(), 2 << 20);
    let mut buf = BytesMut::new();

    for size in [0usize, 1, 64, 512, 4096, 65536, 1_048_576] {
        let payload = vec![0xA5u8; size];
        for _ in 0..200 {
            codec
                .encode(Frame::new(9, pool.rent_from(&payload)), &mut buf)
                .unwrap();
            let decoded = codec.decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(decoded.payload.remaining(), size);
            assert!(buf.is_empty());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_many_senders_share_one_linker() {
    const SENDERS: u32 = 16;
    const PER_SENDER: u32 = 500;

    let received = Arc::new(AtomicUsize::new(0));
    let last_seen: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let out_of_order = Arc::new(AtomicUsize::new(0));

    let context = LinkContext::builder(NetworkConfig::default_with_overrides(|c| {
        c.linker.send_queue_depth = 8;
    }))
    .formatters(|builder| {
        builder.register_serde::<Seq>()?;
        Ok(())
    })
    .build()
    .unwrap();

    {
        let received = Arc::clone(&received);
        let last_seen = Arc::clone(&last_seen);
        let out_of_order = Arc::clone(&out_of_order);
        context
            .dispatcher()
            .register::<Seq, _>(move |msg, _| {
                let mut last = last_seen.lock().unwrap();
                let expected = last.get(&msg.sender).map_or(0, |s| s + 1);
                if msg.seq != expected {
                    out_of_order.fetch_add(1, Ordering::SeqCst);
                }
                last.insert(msg.sender, msg.seq);
                received.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    let listener = LinkerListener::bind(Arc::clone(&context), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();
    let (client, server) = tokio::join!(
        Linker::connect(Arc::clone(&context), &addr),
        listener.accept()
    );
    let client = client.unwrap();
    let _server = server.unwrap();

    let mut tasks = JoinSet::new();
    for sender in 0..SENDERS {
        let client = client.clone();
        tasks.spawn(async move {
            for seq in 0..PER_SENDER {
                let msg = Seq {
                    sender,
                    seq,
                    filler: vec![sender as u8; (seq % 128) as usize],
                };
                client.send(&msg).await.unwrap();
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    let total = (SENDERS * PER_SENDER) as usize;
    tokio::time::timeout(Duration::from_secs(30), async {
        while received.load(Ordering::SeqCst) < total {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all frames delivered");

    assert_eq!(received.load(Ordering::SeqCst), total);
    assert_eq!(out_of_order.load(Ordering::SeqCst), 0);
    assert_eq!(context.metrics().snapshot().dispatch_failures, 0);
    client.close().await;
}
