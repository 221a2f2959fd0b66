//! Unit tests for notification reassembly across chunk boundaries.

use liftlink::measurement::{Frame, FrameReassembler};
use liftlink::sensors::protocol::payload_size;

/// A realistic run: companion reply, interleaved samples, noise, END.
fn session_stream() -> String {
    let mut stream = String::from("SLAVE_OK\n");
    for idx in 0..12u32 {
        stream.push_str(&format!(
            r#"{{"id":"MASTER","idx":{},"angle":{:.2},"time":{}}}"#,
            idx,
            idx as f64 * 7.5,
            idx * 20
        ));
        stream.push_str(&format!(
            r#"{{"id":"SLAVE","idx":{},"angle":{:.2},"time":{}}}"#,
            idx,
            idx as f64 * 3.25,
            idx * 20 + 1
        ));
    }
    stream.push_str(r#"{"id":"MASTER","note":"brace } inside"}"#);
    stream.push_str("END");
    stream
}

fn feed_chunks(bytes: &[u8], chunk_len: usize) -> Vec<Frame> {
    let mut reassembler = FrameReassembler::default();
    bytes
        .chunks(chunk_len)
        .flat_map(|chunk| reassembler.feed(chunk))
        .collect()
}

#[test]
fn test_chunk_size_does_not_change_messages() {
    let stream = session_stream();
    let expected = FrameReassembler::default().feed(stream.as_bytes());
    assert_eq!(expected.len(), 1 + 24 + 1 + 1);

    for chunk_len in [1, 2, 3, 7, 19, payload_size(23), payload_size(185), payload_size(517)] {
        assert_eq!(feed_chunks(stream.as_bytes(), chunk_len), expected, "chunks of {}", chunk_len);
    }
}

#[test]
fn test_every_three_way_split_matches() {
    let stream = br#"{"id":"MASTER","idx":0}SLAVE_ERROR{"id":"SLAVE","idx":"1"}END"#;
    let expected = FrameReassembler::default().feed(stream);

    for first in 0..stream.len() {
        for second in first..=stream.len() {
            let mut reassembler = FrameReassembler::default();
            let mut frames = reassembler.feed(&stream[..first]);
            frames.extend(reassembler.feed(&stream[first..second]));
            frames.extend(reassembler.feed(&stream[second..]));
            assert_eq!(frames, expected, "split at {} and {}", first, second);
        }
    }
}

#[test]
fn test_unterminated_block_is_never_emitted() {
    let mut reassembler = FrameReassembler::default();
    let frames = reassembler.feed(br#"{"id":"MASTER","idx":3,"meta":{"a":1}"#);
    assert!(frames.is_empty());
    assert!(reassembler.has_partial());
    assert!(reassembler.pending_len() > 0);
}

#[test]
fn test_end_terminates_and_reset_resumes() {
    let mut reassembler = FrameReassembler::default();
    let frames = reassembler.feed(br#"{"idx":0}END{"idx":1}"#);
    assert!(frames.last().is_some_and(Frame::is_end));
    assert_eq!(frames.len(), 2);
    assert!(reassembler.is_terminated());

    reassembler.reset();
    let frames = reassembler.feed(br#"{"idx":1}"#);
    assert_eq!(frames, vec![Frame::Record(r#"{"idx":1}"#.to_string())]);
}
