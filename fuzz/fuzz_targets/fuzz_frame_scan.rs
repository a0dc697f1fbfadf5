#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(span) = lineport::find_frame(data) {
        let frame = &data[span.start + 1..span.end()];
        let packet = lineport::Packet::parse(frame).expect("scanned frame must parse");
        assert_eq!(packet.header, span.header);
    }
});
