use ctmirror_proto::codec::{decode_payload, encode_flow, FrameIter};
use ctmirror_proto::{Flow, MsgType, NetFlags, NetHdr, ProtoError, SeqNum, NETHDR_SIZ};
use std::net::Ipv4Addr;

fn sample_frame() -> Vec<u8> {
    let flow = Flow::tcp_v4(
        Ipv4Addr::new(1, 2, 3, 4),
        1000,
        Ipv4Addr::new(5, 6, 7, 8),
        80,
    );
    encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(1), &flow)
}

#[test]
fn truncated_header_is_rejected() {
    let frame = sample_frame();
    for cut in 0..NETHDR_SIZ {
        assert!(matches!(
            NetHdr::parse(&frame[..cut]),
            Err(ProtoError::TruncatedHeader(_))
        ));
    }
}

#[test]
fn truncated_payload_is_rejected() {
    let frame = sample_frame();
    let cut = &frame[..frame.len() - 1];
    assert!(matches!(
        NetHdr::parse(cut),
        Err(ProtoError::TruncatedPacket { .. })
    ));
}

#[test]
fn attribute_id_beyond_table_fails_the_message() {
    let mut frame = sample_frame();
    // First attribute starts right after the base header; stamp a bad id.
    frame[NETHDR_SIZ] = 0xff;
    frame[NETHDR_SIZ + 1] = 0xff;
    let hdr = NetHdr::parse(&frame).unwrap();
    assert!(matches!(
        decode_payload(&hdr, &frame),
        Err(ProtoError::MalformedPayload(_))
    ));
}

#[test]
fn attribute_size_mismatch_fails_the_message() {
    let mut frame = sample_frame();
    // Shrink the declared length of the first attribute (the 8-octet
    // address group) without moving any bytes.
    frame[NETHDR_SIZ + 2] = 0;
    frame[NETHDR_SIZ + 3] = 5;
    let hdr = NetHdr::parse(&frame).unwrap();
    assert!(matches!(
        decode_payload(&hdr, &frame),
        Err(ProtoError::MalformedPayload(_))
    ));
}

#[test]
fn oversized_helper_name_fails_the_message() {
    let mut flow = Flow::tcp_v4(
        Ipv4Addr::new(1, 2, 3, 4),
        1000,
        Ipv4Addr::new(5, 6, 7, 8),
        80,
    );
    flow.helper = Some("x".repeat(20));
    let frame = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(1), &flow);
    let hdr = NetHdr::parse(&frame).unwrap();
    assert!(matches!(
        decode_payload(&hdr, &frame),
        Err(ProtoError::AttrTooLong { .. })
    ));
}

#[test]
fn frame_iter_walks_back_to_back_messages() {
    let mut buf = sample_frame();
    let second = encode_flow(MsgType::CtUpd, NetFlags::empty(), SeqNum(2), &Flow::tcp_v4(
        Ipv4Addr::new(9, 9, 9, 9),
        5,
        Ipv4Addr::new(8, 8, 8, 8),
        6,
    ));
    buf.extend_from_slice(&second);

    let frames: Vec<_> = FrameIter::new(&buf).collect::<Result<_, _>>().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0.seq, SeqNum(1));
    assert_eq!(frames[1].0.seq, SeqNum(2));
    assert_eq!(frames[1].0.typ(), Some(MsgType::CtUpd));
}

#[test]
fn frame_iter_stops_at_first_framing_error() {
    let mut buf = sample_frame();
    let good = buf.len();
    buf.extend_from_slice(&[1, 0, 0, 0]); // truncated second header

    let mut iter = FrameIter::new(&buf);
    assert!(iter.next().unwrap().is_ok());
    assert!(iter.next().unwrap().is_err());
    assert!(iter.next().is_none());
    assert!(good > 0);
}
