//! Tests for resumable WINDOW_UPDATE parsing

use bytes::BytesMut;
use h2_completion::{
    create_window_update, frame_type, write_window_update, H2FrameHeader, H2FrameParser,
    WindowUpdateFrame, FRAME_HEADER_LENGTH, MAX_WINDOW_DELTA, WINDOW_UPDATE_LENGTH,
};

use super::{init_tracing, Events};

#[test]
fn test_generate_parse_byte_by_byte_twice() {
    init_tracing();
    let stream_id = 13;
    let window_delta = 17;

    let mut parser = H2FrameParser::new(Vec::new());
    for _ in 0..2 {
        let mut buf = BytesMut::new();
        let written = write_window_update(&mut buf, stream_id, window_delta).unwrap();
        assert_eq!(written, FRAME_HEADER_LENGTH + WINDOW_UPDATE_LENGTH);

        for byte in buf.iter() {
            assert_eq!(parser.parse(std::slice::from_ref(byte)), 1);
        }
    }

    let frames = parser.into_listener();
    assert_eq!(frames.len(), 2);
    for frame in frames {
        assert_eq!(frame.stream_id, stream_id);
        assert_eq!(frame.window_delta, window_delta);
        assert!(frame.is_stream_window_update());
    }
}

#[test]
fn test_generate_parse_one_frame_per_cycle() {
    let mut parser = H2FrameParser::new(Vec::new());
    for _ in 0..2 {
        parser.listener_mut().clear();
        let frame = create_window_update(13, 17).unwrap();
        assert_eq!(parser.parse(&frame), frame.len());
        assert_eq!(parser.listener(), &vec![WindowUpdateFrame::new(13, 17)]);

        parser.listener_mut().clear();
        for byte in frame.iter() {
            parser.parse(std::slice::from_ref(byte));
        }
        assert_eq!(parser.listener(), &vec![WindowUpdateFrame::new(13, 17)]);
    }
}

#[test]
fn test_parse_at_every_split_point() {
    let mut input = BytesMut::new();
    write_window_update(&mut input, 1, 100).unwrap();
    write_window_update(&mut input, 0, 65_535).unwrap();
    write_window_update(&mut input, 3, MAX_WINDOW_DELTA).unwrap();
    let expected = vec![
        WindowUpdateFrame::new(1, 100),
        WindowUpdateFrame::new(0, 65_535),
        WindowUpdateFrame::new(3, MAX_WINDOW_DELTA),
    ];

    for split in 0..=input.len() {
        let mut parser = H2FrameParser::new(Vec::new());
        let (head, tail) = input.split_at(split);
        assert_eq!(parser.parse(head), head.len());
        assert_eq!(parser.parse(tail), tail.len());
        assert_eq!(parser.listener(), &expected, "split at {split}");
    }
}

#[test]
fn test_skips_interleaved_frames() {
    // DATA on stream 1 with 3 bytes, then a WINDOW_UPDATE, then a PING
    let mut input = BytesMut::new();
    H2FrameHeader {
        length: 3,
        frame_type: frame_type::DATA,
        flags: 0x1,
        stream_id: 1,
    }
    .encode(&mut input);
    input.extend_from_slice(b"abc");
    write_window_update(&mut input, 1, 3).unwrap();
    H2FrameHeader {
        length: 8,
        frame_type: frame_type::PING,
        flags: 0,
        stream_id: 0,
    }
    .encode(&mut input);
    input.extend_from_slice(&[0; 8]);

    let mut parser = H2FrameParser::new(Events::default());
    for chunk in input.chunks(5) {
        assert_eq!(parser.parse(chunk), chunk.len());
    }
    let events = parser.listener();
    assert_eq!(events.frames, vec![WindowUpdateFrame::new(1, 3)]);
    let skipped: Vec<u8> = events.skipped.iter().map(|h| h.frame_type).collect();
    assert_eq!(skipped, vec![frame_type::DATA, frame_type::PING]);
    assert!(events.stream_failures.is_empty());
    assert!(events.connection_failures.is_empty());
}
