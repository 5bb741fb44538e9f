//! Fuzz target for GenerateRequest::decode
//!
//! Focuses on the prompt slice table: overlapping pairs, offsets near
//! u32::MAX, lengths that disagree with the trailing data. Bounds
//! arithmetic must never wrap and slicing must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weave_proto::GenerateRequest;

fuzz_target!(|data: &[u8]| {
    let _ = GenerateRequest::decode(data);
});
