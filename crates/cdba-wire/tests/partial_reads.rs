use cdba_wire::{FillOutcome, Msg, MsgType, RingBuffer, encode, try_decode};

/// Feeds `bytes` into a fresh ring in `chunk`-sized pieces, decoding after
/// every fill, and returns the byte offsets at which a frame came out.
fn decode_offsets(bytes: &[u8], chunk: usize) -> (Vec<usize>, Vec<Msg>) {
    let mut ring = RingBuffer::new();
    let mut offsets = Vec::new();
    let mut msgs = Vec::new();
    let mut fed = 0;

    for piece in bytes.chunks(chunk) {
        let mut src = piece;
        match ring.fill(&mut src).unwrap() {
            FillOutcome::Filled(n) => fed += n,
            other => panic!("unexpected fill outcome {other:?}"),
        }
        while let Some(msg) = try_decode(&mut ring) {
            offsets.push(fed);
            msgs.push(msg);
        }
    }
    (offsets, msgs)
}

#[test]
fn frame_appears_exactly_at_its_final_byte() {
    let frame = encode(MsgType::Console, b"console bytes").unwrap();

    for chunk in 1..=frame.len() {
        let (offsets, msgs) = decode_offsets(&frame, chunk);
        assert_eq!(msgs, vec![Msg::new(MsgType::Console, &b"console bytes"[..])]);

        // The frame must decode on the fill that delivered its last byte and
        // never earlier: the completing offset is the first fed total that
        // reaches the frame length.
        assert_eq!(offsets.len(), 1);
        assert!(offsets[0] >= frame.len(), "chunk {chunk}: decoded early at {}", offsets[0]);
        assert!(offsets[0] - frame.len() < chunk, "chunk {chunk}: decoded late at {}", offsets[0]);
    }
}

#[test]
fn interleaved_frames_split_across_arbitrary_chunks() {
    let mut bytes = Vec::new();
    bytes.extend(encode(MsgType::SelectBoard, b"b1").unwrap());
    bytes.extend(encode(MsgType::Console, &[b'~'; 300]).unwrap());
    bytes.extend(encode(MsgType::FastbootPresent, &[1]).unwrap());
    bytes.extend(encode(MsgType::FastbootDownload, b"").unwrap());

    for chunk in [1, 2, 3, 5, 7, 64, 1024] {
        let (_, msgs) = decode_offsets(&bytes, chunk);
        assert_eq!(msgs.len(), 4, "chunk size {chunk}");
        assert_eq!(msgs[0], Msg::new(MsgType::SelectBoard, &b"b1"[..]));
        assert_eq!(msgs[1].payload.len(), 300);
        assert_eq!(msgs[2], Msg::new(MsgType::FastbootPresent, vec![1]));
        assert_eq!(msgs[3], Msg::empty(MsgType::FastbootDownload));
    }
}
