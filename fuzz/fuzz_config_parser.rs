//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`, covering both TOML
//! deserialization and the stream tunable validation.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = allocfs_config::AppConfig::parse(s) {
            assert!(config.stream.batch_window_ms <= config.stream.heartbeat_ms);
            assert!(config.http.listen_port != 0);
        }
    }
});
