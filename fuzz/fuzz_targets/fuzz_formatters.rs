#![no_main]

use std::collections::HashMap;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use linkwire::formatter::{ResolverBuilder, VersionData};
use linkwire::protocol::message::NetworkPacket;
use linkwire::protocol::parser::BinaryParser;
use linkwire::protocol::peer::PeerAddress;
use linkwire::splitter::{SplitterAnnounce, SplitterDto};
use linkwire::utils::buffer_pool::BufferPool;

fuzz_target!(|data: &[u8]| {
    let mut builder = ResolverBuilder::with_builtins().expect("builtins");
    linkwire::protocol::register_formatters(&mut builder).expect("protocol formatters");
    linkwire::splitter::register_formatters(&mut builder).expect("splitter formatters");
    builder
        .register_vec::<PeerAddress>()
        .and_then(|b| b.register_map::<String, Vec<PeerAddress>>())
        .and_then(|b| b.register_version::<String, _>(1, linkwire::formatter::builtin::StringFormatter))
        .expect("composite formatters");
    let parser = BinaryParser::new(Arc::new(builder.build().expect("resolver")), BufferPool::default());

    // Hostile input only ever produces errors
    let _ = parser.deserialize::<String>(data);
    let _ = parser.deserialize::<Vec<PeerAddress>>(data);
    let _ = parser.deserialize::<HashMap<String, Vec<PeerAddress>>>(data);
    let _ = parser.deserialize::<VersionData<String>>(data);
    let _ = parser.deserialize::<NetworkPacket>(data);
    let _ = parser.deserialize::<SplitterAnnounce>(data);
    let _ = parser.deserialize::<SplitterDto>(data);
});
