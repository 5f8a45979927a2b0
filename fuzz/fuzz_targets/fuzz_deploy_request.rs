//! Fuzz target for device request decoding.
//!
//! Arbitrary bytes must decode to a request or an error, and any request
//! that decodes must encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use gg_deploy::daemon::{decode_request, encode_request, DEFAULT_MAX_MESSAGE_SIZE};

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = decode_request(data, DEFAULT_MAX_MESSAGE_SIZE) {
        let _ = encode_request(&request, DEFAULT_MAX_MESSAGE_SIZE);
    }
});
