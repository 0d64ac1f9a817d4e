use ctmirror_proto::codec::{decode_payload, encode_expectation, encode_flow, Payload};
use ctmirror_proto::flow::{Flow, IpPair, L4Info, MasterTuple, NatSeqAdj, PortPair, StatusFlags};
use ctmirror_proto::{Expectation, MsgType, NetFlags, NetHdr, SeqNum, Tuple};
use proptest::prelude::*;
use std::net::Ipv4Addr;

fn decode_one_flow(frame: &[u8]) -> Flow {
    let hdr = NetHdr::parse(frame).unwrap();
    match decode_payload(&hdr, frame).unwrap() {
        Some(Payload::Flow(flow)) => flow,
        other => panic!("expected flow payload, got {:?}", other),
    }
}

#[test]
fn tcp_flow_round_trips() {
    let mut flow = Flow::tcp_v4(
        Ipv4Addr::new(1, 2, 3, 4),
        1000,
        Ipv4Addr::new(5, 6, 7, 8),
        80,
    );
    flow.tcp_state = Some(3); // established
    flow.status = StatusFlags::SEEN_REPLY | StatusFlags::ASSURED;
    flow.mark = Some(0xdeadbeef);
    flow.helper = Some("ftp".to_owned());
    flow.snat_ipv4 = Some(Ipv4Addr::new(10, 0, 0, 1));
    flow.spat_port = Some(61000);
    flow.nat_seq_adj = Some(NatSeqAdj {
        orig_correction_pos: 1,
        orig_offset_before: 2,
        orig_offset_after: 3,
        repl_correction_pos: 4,
        repl_offset_before: 5,
        repl_offset_after: 6,
    });

    let frame = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(42), &flow);
    let hdr = NetHdr::parse(&frame).unwrap();
    assert_eq!(hdr.seq, SeqNum(42));
    assert_eq!(hdr.typ(), Some(MsgType::CtNew));
    assert_eq!(hdr.len as usize, frame.len());
    assert_eq!(decode_one_flow(&frame), flow);
}

#[test]
fn icmp_flow_round_trips() {
    let mut flow = Flow::default();
    flow.orig = Some(IpPair::V4 {
        src: Ipv4Addr::new(192, 168, 0, 1),
        dst: Ipv4Addr::new(192, 168, 0, 2),
    });
    flow.proto = 1;
    flow.l4 = Some(L4Info::Icmp {
        id: 0x1234,
        typ: 8,
        code: 0,
    });

    let frame = encode_flow(MsgType::CtUpd, NetFlags::empty(), SeqNum(1), &flow);
    assert_eq!(decode_one_flow(&frame), flow);
}

#[test]
fn flow_with_master_round_trips() {
    let mut flow = Flow::tcp_v4(
        Ipv4Addr::new(10, 0, 0, 2),
        40000,
        Ipv4Addr::new(10, 0, 0, 3),
        20,
    );
    flow.master = Some(MasterTuple {
        ip: IpPair::V4 {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 3),
        },
        proto: 6,
        ports: Some(PortPair {
            sport: 39999,
            dport: 21,
        }),
    });

    let frame = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(7), &flow);
    assert_eq!(decode_one_flow(&frame), flow);
}

#[test]
fn expectation_round_trips() {
    let master = Tuple {
        ip: IpPair::V4 {
            src: Ipv4Addr::new(1, 1, 1, 1),
            dst: Ipv4Addr::new(2, 2, 2, 2),
        },
        proto: 6,
        ports: Some(PortPair {
            sport: 3333,
            dport: 21,
        }),
    };
    let expected = Tuple {
        ip: IpPair::V4 {
            src: Ipv4Addr::new(2, 2, 2, 2),
            dst: Ipv4Addr::new(1, 1, 1, 1),
        },
        proto: 6,
        ports: Some(PortPair {
            sport: 0,
            dport: 40001,
        }),
    };
    let mask = Tuple {
        ip: IpPair::V4 {
            src: Ipv4Addr::new(255, 255, 255, 255),
            dst: Ipv4Addr::new(255, 255, 255, 255),
        },
        proto: 255,
        ports: Some(PortPair {
            sport: 0,
            dport: 0xffff,
        }),
    };
    let mut exp = Expectation::new(master, expected, mask);
    exp.timeout = Some(300);
    exp.class = Some(0);
    exp.helper = Some("ftp".to_owned());
    exp.expectfn = Some("nat-follow-master".to_owned());

    let frame = encode_expectation(MsgType::ExpNew, NetFlags::empty(), SeqNum(9), &exp);
    let hdr = NetHdr::parse(&frame).unwrap();
    match decode_payload(&hdr, &frame).unwrap() {
        Some(Payload::Expectation(got)) => assert_eq!(got, exp),
        other => panic!("expected expectation payload, got {:?}", other),
    }
}

prop_compose! {
    fn arb_ipv4_pair()(src in any::<u32>(), dst in any::<u32>()) -> IpPair {
        IpPair::V4 { src: Ipv4Addr::from(src), dst: Ipv4Addr::from(dst) }
    }
}

prop_compose! {
    fn arb_flow()(
        pair in arb_ipv4_pair(),
        sport in any::<u16>(),
        dport in any::<u16>(),
        tcp_state in proptest::option::of(0u8..=10),
        mark in proptest::option::of(any::<u32>()),
        timeout in proptest::option::of(any::<u32>()),
        status_bits in 0u32..=0x7ff,
        helper in proptest::option::of("[a-z]{1,15}"),
    ) -> Flow {
        let mut flow = Flow::default();
        flow.orig = Some(pair);
        flow.proto = 6;
        flow.l4 = Some(L4Info::Ports(PortPair { sport, dport }));
        flow.tcp_state = tcp_state;
        flow.mark = mark;
        flow.timeout = timeout;
        flow.status = StatusFlags::from_bits_truncate(status_bits);
        flow.helper = helper;
        flow
    }
}

proptest! {
    #[test]
    fn decode_inverts_encode(flow in arb_flow(), seq in any::<u32>()) {
        let frame = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(seq), &flow);
        prop_assert_eq!(decode_one_flow(&frame), flow);
    }
}
