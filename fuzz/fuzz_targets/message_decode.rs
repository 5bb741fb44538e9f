//! Fuzz target for Message::decode
//!
//! Hits the dispatch path: the 16-byte header (magic "WEVE", version
//! bounds, type field, 10 MiB payload cap) followed by whichever of the
//! three payload decoders the type selects. The interesting territory
//! is the boundary between them — headers whose claimed payload length
//! disagrees with the bytes actually present, and type/payload
//! mismatches that must land in a typed error rather than the wrong
//! decoder's slicing.
//!
//! Every input must come back as `Ok` or a typed `ProtocolError`;
//! a panic or an allocation driven by an unvalidated length is a bug.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weave_proto::Message;

fuzz_target!(|data: &[u8]| {
    let _ = Message::decode(data);
});
