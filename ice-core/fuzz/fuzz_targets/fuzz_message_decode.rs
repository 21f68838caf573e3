#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use ice_core::MessageCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = MessageCodec::with_max_size(64 * 1024);
    let mut buf = BytesMut::from(data);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(msg)) => {
                let _ = msg.message_type();
                let _ = msg.wire_size();
                let _ = msg.header.body_size();
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
});
