#![no_main]

use libfuzzer_sys::fuzz_target;
use linkwire::config::MAX_FRAME_SIZE;
use linkwire::utils::compression::{compress, decode_tagged, decompress, encode_tagged, CompressionKind};

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(compressed) = compress(data, kind) {
            let restored = decompress(&compressed, kind, MAX_FRAME_SIZE).expect("own output decodes");
            assert_eq!(restored, data);
        }
        // Malformed input must fail cleanly within the limit
        let _ = decompress(data, kind, 64 * 1024);
    }

    if let Ok(tagged) = encode_tagged(data, CompressionKind::Lz4, 64) {
        assert_eq!(decode_tagged(&tagged).expect("own output decodes"), data);
    }
    let _ = decode_tagged(data);
});
