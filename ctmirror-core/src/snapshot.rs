//! Optional external-cache snapshot: the replica is written to disk as the
//! concatenation of wire-encoded NEW messages, so loading is literally the
//! receive path replayed.

use crate::cache::Cache;
use crate::error::CoreError;
use ctmirror_proto::codec::{self, Payload};
use ctmirror_proto::flow::Flow;
use ctmirror_proto::{MsgType, NetFlags, SeqNum};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Writes every external-cache flow to `path`.
pub fn save(cache: &Cache<Flow>, path: &Path) -> Result<usize, CoreError> {
    let mut out = Vec::new();
    let mut seq = SeqNum(1);
    let mut count = 0;
    cache.for_each(|flow| {
        out.extend_from_slice(&codec::encode_flow(
            MsgType::CtNew,
            NetFlags::empty(),
            seq,
            flow,
        ));
        seq = seq.next();
        count += 1;
    });
    let mut file = fs::File::create(path)?;
    file.write_all(&out)?;
    info!(count, path = %path.display(), "external cache snapshot written");
    Ok(count)
}

/// Replays a snapshot file into the external cache. A missing file is an
/// empty snapshot.
pub fn load(cache: &mut Cache<Flow>, path: &Path) -> Result<usize, CoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut count = 0;
    for item in codec::FrameIter::new(&data) {
        let (hdr, frame) = item?;
        if let Some(Payload::Flow(flow)) = codec::decode_payload(&hdr, frame)? {
            cache.update_force(flow)?;
            count += 1;
        }
    }
    info!(count, path = %path.display(), "external cache snapshot loaded");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn snapshot_round_trips_through_the_wire_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("external.snapshot");

        let mut cache: Cache<Flow> = Cache::new("external");
        for n in 1..=4u8 {
            let mut flow = Flow::tcp_v4(
                Ipv4Addr::new(10, 9, 0, n),
                1000 + n as u16,
                Ipv4Addr::new(10, 9, 1, n),
                443,
            );
            flow.tcp_state = Some(3);
            cache.update_force(flow).unwrap();
        }
        assert_eq!(save(&cache, &path).unwrap(), 4);

        let mut restored: Cache<Flow> = Cache::new("external");
        assert_eq!(load(&mut restored, &path).unwrap(), 4);
        assert_eq!(restored.len(), 4);

        // Every object survived byte-identically.
        cache.for_each(|flow| {
            let key = flow.key().unwrap();
            assert_eq!(&restored.find(&key).unwrap().item, flow);
        });
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache: Cache<Flow> = Cache::new("external");
        let loaded = load(&mut cache, &dir.path().join("absent")).unwrap();
        assert_eq!(loaded, 0);
    }
}
