#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = lineport::Header::parse(data) {
        // Re-encoding zeroes the reserved byte but must keep every field.
        let reparsed = lineport::Header::parse(&header.encode()).expect("re-encoded header parses");
        assert_eq!(reparsed, header);
    }
    let _ = lineport::Packet::parse(data);
});
