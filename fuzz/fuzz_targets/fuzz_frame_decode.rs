#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use linkwire::core::codec::FrameCodec;
use linkwire::utils::buffer_pool::BufferPool;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes never panic or loop; every frame fits the limit
    let mut codec = FrameCodec::new(BufferPool::default(), 64 * 1024);
    let mut src = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut src) {
        assert!(frame.payload.remaining() <= 64 * 1024);
    }
    let _ = codec.decode_eof(&mut src);
});
