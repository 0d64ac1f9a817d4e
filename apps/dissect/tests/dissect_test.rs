//! Whole-capture dissection against synthetic packets.

use ctmirror_dissect::{dissect_capture, pcap};
use ctmirror_proto::codec::{encode_ctl, encode_flow};
use ctmirror_proto::{AckBounds, Flow, MsgType, NetFlags, SeqNum, SYNC_PORT};
use std::net::Ipv4Addr;

/// Wraps a sync payload in Ethernet + IPv4 + UDP headers, padding the frame
/// to the 60-byte Ethernet minimum as the wire would.
fn udp_frame(payload: &[u8], sport: u16, dport: u16) -> Vec<u8> {
    let mut out = Vec::new();
    // Ethernet
    out.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    out.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    out.extend_from_slice(&0x0800u16.to_be_bytes());
    // IPv4
    let tot_len = 20 + 8 + payload.len();
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&(tot_len as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // id, frag
    out.push(64); // ttl
    out.push(17); // udp
    out.extend_from_slice(&[0, 0]); // checksum
    out.extend_from_slice(&Ipv4Addr::new(192, 168, 100, 1).octets());
    out.extend_from_slice(&Ipv4Addr::new(192, 168, 100, 2).octets());
    // UDP
    out.extend_from_slice(&sport.to_be_bytes());
    out.extend_from_slice(&dport.to_be_bytes());
    out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    // Ethernet minimum-size padding
    while out.len() < 60 {
        out.push(0);
    }
    out
}

fn sample_flow() -> Flow {
    let mut flow = Flow::tcp_v4(
        Ipv4Addr::new(1, 2, 3, 4),
        1000,
        Ipv4Addr::new(5, 6, 7, 8),
        80,
    );
    flow.tcp_state = Some(3);
    flow.mark = Some(7);
    flow
}

#[test]
fn two_messages_in_one_packet_are_both_printed() {
    let mut payload = encode_flow(MsgType::CtUpd, NetFlags::empty(), SeqNum(8), &sample_flow());
    payload.extend_from_slice(&encode_ctl(
        NetFlags::ACK | NetFlags::ALIVE,
        SeqNum(9),
        Some(AckBounds {
            from: SeqNum(3),
            to: SeqNum(8),
        }),
    ));
    let capture = pcap::build_capture(&[&udp_frame(&payload, 40000, SYNC_PORT)]);

    let mut out = Vec::new();
    let stats = dissect_capture(&capture, SYNC_PORT, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(stats.pkts, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.skip, 0);
    assert!(text.contains("CT-UPD"), "missing CT-UPD in:\n{}", text);
    assert!(text.contains("seq:8"));
    assert!(text.contains("ACK"));
    assert!(text.contains("ALIVE"));
    assert!(text.contains("from: 3 to: 8"));
    // The attribute list was parsed: the address group and the mark.
    assert!(text.contains("1.2.3.4->5.6.7.8"));
    assert!(text.contains("1000->80"));
}

#[test]
fn short_frames_are_trimmed_before_framing() {
    // A lone control message is well below the Ethernet minimum; the
    // padding must not be parsed as a second message.
    let payload = encode_ctl(NetFlags::HELLO, SeqNum(1), None);
    let capture = pcap::build_capture(&[&udp_frame(&payload, SYNC_PORT, 40000)]);

    let mut out = Vec::new();
    let stats = dissect_capture(&capture, SYNC_PORT, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(stats.errors, 0);
    assert!(text.contains("HELLO"));
    assert!(!text.contains("warning"));
    assert_eq!(text.lines().count(), 1, "padding produced extra lines:\n{}", text);
}

#[test]
fn other_ports_are_skipped() {
    let payload = encode_ctl(NetFlags::HELLO, SeqNum(1), None);
    let capture = pcap::build_capture(&[&udp_frame(&payload, 1234, 5678)]);

    let mut out = Vec::new();
    let stats = dissect_capture(&capture, SYNC_PORT, &mut out).unwrap();
    assert_eq!(stats.skip, 1);
    assert!(out.is_empty());
}

#[test]
fn old_version_is_counted_but_dissection_continues() {
    let mut payload = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(1), &sample_flow());
    payload[0] = 0; // ancient peer
    let capture = pcap::build_capture(&[&udp_frame(&payload, SYNC_PORT, SYNC_PORT)]);

    let mut out = Vec::new();
    let stats = dissect_capture(&capture, SYNC_PORT, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(stats.sync_version_old, 1);
    assert_eq!(stats.errors, 1);
    assert!(text.contains("[warning: old version]"));
    assert!(text.contains("CT-NEW"));
}

#[test]
fn truncated_message_aborts_only_its_packet() {
    let good = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(1), &sample_flow());
    let mut bad = good.clone();
    bad[5] = 200; // header claims more bytes than the packet holds

    let capture = pcap::build_capture(&[
        &udp_frame(&bad, SYNC_PORT, 40000),
        &udp_frame(&good, SYNC_PORT, 40000),
    ]);

    let mut out = Vec::new();
    let stats = dissect_capture(&capture, SYNC_PORT, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(stats.pkts, 2);
    assert!(text.contains("warning"));
    assert!(text.contains("CT-NEW"), "second packet still dissected");
}
