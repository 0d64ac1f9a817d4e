//! Loss-recovery scenarios driven with real encoded frames.

use ctmirror_proto::codec::{decode_payload, encode_flow, Payload};
use ctmirror_proto::{Flow, MsgType, NetFlags, NetHdr, SeqNum};
use ctmirror_sequenced::{Action, FtFw, SyncStrategy};
use std::collections::HashMap;
use std::net::Ipv4Addr;

fn flow(n: u8) -> Flow {
    Flow::tcp_v4(
        Ipv4Addr::new(10, 0, 0, n),
        1000 + n as u16,
        Ipv4Addr::new(10, 0, 1, n),
        80,
    )
}

/// A minimal receiver applying data frames idempotently, the way the
/// external cache does.
#[derive(Default)]
struct MiniReceiver {
    strategy_actions: Vec<Action>,
    applied: HashMap<u32, Flow>,
}

impl MiniReceiver {
    fn feed(&mut self, strategy: &mut dyn SyncStrategy, frame: &[u8]) {
        let hdr = NetHdr::parse(frame).unwrap();
        if hdr.flags.is_data() {
            if let Some(Payload::Flow(flow)) = decode_payload(&hdr, frame).unwrap() {
                self.applied.insert(hdr.seq.0, flow);
            }
            self.strategy_actions.extend(strategy.on_data(&hdr));
        } else {
            self.strategy_actions.extend(strategy.on_ctl(&hdr));
        }
    }
}

#[test]
fn lost_message_is_recovered_via_nack() {
    let mut sender = FtFw::new(32, 64);
    let mut receiver_machine = FtFw::new(32, 64);
    let mut receiver = MiniReceiver::default();

    // Sender emits seq 7, 8, 9; seq 8 is lost on the wire.
    let mut frames = Vec::new();
    for (i, seq) in (7u32..=9).enumerate() {
        let frame = encode_flow(
            MsgType::CtNew,
            NetFlags::empty(),
            SeqNum(seq),
            &flow(i as u8 + 1),
        );
        sender.on_sent(SeqNum(seq), &frame);
        frames.push(frame);
    }

    receiver.feed(&mut receiver_machine, &frames[0]); // seq 7
    receiver.feed(&mut receiver_machine, &frames[2]); // seq 9, hole at 8

    // The receiver asked for exactly [8, 8].
    let nack = receiver
        .strategy_actions
        .iter()
        .find_map(|a| match a {
            Action::SendCtl { flags, bounds } if flags.contains(NetFlags::NACK) => Some(*bounds),
            _ => None,
        })
        .expect("receiver must NACK the hole")
        .unwrap();
    assert_eq!((nack.from, nack.to), (SeqNum(8), SeqNum(8)));

    // Deliver the NACK to the sender; it serves the stored frame.
    let nack_frame = ctmirror_proto::codec::encode_ctl(NetFlags::NACK, SeqNum(0), Some(nack));
    let hdr = NetHdr::parse(&nack_frame).unwrap();
    let served: Vec<_> = sender
        .on_ctl(&hdr)
        .into_iter()
        .filter_map(|a| match a {
            Action::SendFrame(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(served.len(), 1);

    receiver.feed(&mut receiver_machine, &served[0]);

    // All three flows arrived; the replica matches what was sent.
    assert_eq!(receiver.applied.len(), 3);
    assert_eq!(receiver.applied[&8], flow(2));
}

#[test]
fn window_overflow_keeps_only_the_tail() {
    let mut sender = FtFw::new(4, 64);
    for seq in 10u32..=15 {
        let frame = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(seq), &flow(1));
        sender.on_sent(SeqNum(seq), &frame);
    }
    assert_eq!(sender.queue_len(), 4); // 12..=15 after FIFO eviction

    let ack = ctmirror_proto::codec::encode_ctl(
        NetFlags::ACK,
        SeqNum(0),
        Some(ctmirror_proto::AckBounds {
            from: SeqNum(0),
            to: SeqNum(12),
        }),
    );
    let hdr = NetHdr::parse(&ack).unwrap();
    sender.on_ctl(&hdr);
    assert_eq!(sender.queue_len(), 3); // 13, 14, 15 remain
}

#[test]
fn duplicate_application_is_idempotent() {
    let mut machine = FtFw::new(32, 64);
    let mut receiver = MiniReceiver::default();
    let frame = encode_flow(MsgType::CtNew, NetFlags::empty(), SeqNum(5), &flow(3));

    receiver.feed(&mut machine, &frame);
    let first = receiver.applied.clone();
    receiver.feed(&mut machine, &frame);
    receiver.feed(&mut machine, &frame);
    assert_eq!(receiver.applied, first);
}
