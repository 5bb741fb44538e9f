//! Fuzz target for GenerateResponse::decode
//!
//! Focuses on the image geometry invariant: width/height/channels
//! combinations whose product overflows 32 bits, or that disagree with
//! the declared or actual pixel length, must be rejected without
//! allocating from the forged claim.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weave_proto::GenerateResponse;

fuzz_target!(|data: &[u8]| {
    let _ = GenerateResponse::decode(data);
});
