//! Fuzz target for the length-delimited JSON frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decode
//!
//! Decodes arbitrary bytes as a sequence of `StreamResult` frames, the way
//! the log bridge reads a handler's output. Decoding must fail cleanly and
//! never panic or loop.

#![no_main]

use allocfs_core::rpc::codec::JsonFrameCodec;
use allocfs_core::rpc::{LogsRequest, StreamResult};
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec: JsonFrameCodec<StreamResult, LogsRequest> = JsonFrameCodec::new();
    let mut buf = BytesMut::from(data);
    loop {
        let before = buf.len();
        match codec.decode(&mut buf) {
            Ok(Some(_)) => assert!(buf.len() < before),
            Ok(None) | Err(_) => break,
        }
    }
});
