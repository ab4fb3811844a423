#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use dgramport::Datagram;

fuzz_target!(|input: (&[u8], u16)| {
    let (data, segment_size) = input;
    let payload = Bytes::copy_from_slice(data);
    let total = payload.len();

    let mut out = Vec::new();
    Datagram {
        payload,
        sender: None,
        recipient: None,
        segment_size: Some(segment_size),
    }
    .fan_out(&mut out);

    let reassembled: usize = out.iter().map(|d| d.payload.len()).sum();
    assert_eq!(reassembled, total);
    for datagram in &out {
        assert!(datagram.segment_size.is_none());
        assert!(datagram.payload.len() <= usize::from(segment_size).max(1));
    }
});
