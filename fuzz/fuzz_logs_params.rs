//! Fuzz target for the `logs` endpoint query validator.
//!
//! Run with: cargo +nightly fuzz run fuzz_logs_params
//!
//! Treats the input as `<alloc id>?<query string>` and runs it through
//! `params::logs_request`. Whatever is accepted must satisfy the request
//! invariants the log handlers rely on.

#![no_main]

use allocfs_core::http::params::{self, QueryParams};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (alloc, query) = input.split_once('?').unwrap_or((input, ""));
    let query: QueryParams = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if let Ok(req) = params::logs_request(alloc, &query, Some("token")) {
        assert!(!req.alloc_id.is_empty());
        assert!(!req.task.is_empty());
        assert_eq!(req.auth_token, "token");
    }
});
