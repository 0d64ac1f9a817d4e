//! Indexed stores of live flow state.
//!
//! A cache maps fingerprints to owned objects. Each object carries an
//! extension value whose lifecycle (add, update, destroy, dump) is driven by
//! the cache at the corresponding transitions; replication caches use the
//! unit extension, track mode attaches its per-object alarm and stamina.

use crate::error::CoreError;
use ctmirror_proto::expect::{ExpKey, Expectation};
use ctmirror_proto::flow::{Flow, FlowKey};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::hash::Hash;
use std::io::{self, Write};

/// Output style for cache dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Plain,
    Xml,
}

/// An item a cache can index: it names its own fingerprint, merges
/// replicated metadata, and renders itself for dumps.
pub trait CacheItem: Clone {
    type Key: Hash + Eq + Clone;

    /// `None` when the item carries no usable fingerprint; such items are
    /// dropped by callers before they reach a cache.
    fn item_key(&self) -> Option<Self::Key>;

    fn merge_from(&mut self, other: &Self);

    fn render(&self, fmt: DumpFormat) -> String;
}

impl CacheItem for Flow {
    type Key = FlowKey;

    fn item_key(&self) -> Option<FlowKey> {
        self.key()
    }

    fn merge_from(&mut self, other: &Flow) {
        self.merge(other);
    }

    fn render(&self, fmt: DumpFormat) -> String {
        match fmt {
            DumpFormat::Plain => self.to_string(),
            DumpFormat::Xml => {
                let mut out = String::from("<flow>");
                if let Some(ip) = self.orig {
                    let _ = write!(out, "<src>{}</src><dst>{}</dst>", ip.src(), ip.dst());
                }
                let _ = write!(out, "<proto>{}</proto>", self.proto);
                if let Some(ctmirror_proto::flow::L4Info::Ports(p)) = self.l4 {
                    let _ = write!(
                        out,
                        "<sport>{}</sport><dport>{}</dport>",
                        p.sport, p.dport
                    );
                }
                out.push_str("</flow>");
                out
            }
        }
    }
}

impl CacheItem for Expectation {
    type Key = ExpKey;

    fn item_key(&self) -> Option<ExpKey> {
        Some(self.key())
    }

    fn merge_from(&mut self, other: &Expectation) {
        self.merge(other);
    }

    fn render(&self, fmt: DumpFormat) -> String {
        let t = &self.expected;
        match fmt {
            DumpFormat::Plain => format!(
                "expectation proto={} src={} dst={}",
                t.proto,
                t.ip.src(),
                t.ip.dst()
            ),
            DumpFormat::Xml => format!(
                "<expectation><proto>{}</proto><src>{}</src><dst>{}</dst></expectation>",
                t.proto,
                t.ip.src(),
                t.ip.dst()
            ),
        }
    }
}

/// Lifecycle of the per-object extension value.
pub trait ExtraLifecycle<I: CacheItem, X> {
    fn on_add(&mut self, item: &I) -> X;
    fn on_update(&mut self, item: &I, extra: &mut X);
    fn on_destroy(&mut self, item: &I, extra: &mut X);

    /// Optional dump annotation appended to the item's own rendering.
    fn dump(&self, _item: &I, _extra: &X, _fmt: DumpFormat) -> Option<String> {
        None
    }
}

/// Extension for caches that carry none.
pub struct NoExtra;

impl<I: CacheItem> ExtraLifecycle<I, ()> for NoExtra {
    fn on_add(&mut self, _item: &I) {}
    fn on_update(&mut self, _item: &I, _extra: &mut ()) {}
    fn on_destroy(&mut self, _item: &I, _extra: &mut ()) {}
}

/// Monotonic operation counters; each operation outcome bumps exactly one
/// ok/fail pair member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub active: u64,
    pub add_ok: u64,
    pub add_fail: u64,
    pub upd_ok: u64,
    pub upd_fail: u64,
    pub del_ok: u64,
    pub del_fail: u64,
}

/// Verdict of an iteration callback for the current object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterVerdict {
    Keep,
    Remove,
}

pub struct CacheObject<I, X> {
    pub item: I,
    pub extra: X,
}

/// A named, fingerprint-indexed cache.
pub struct Cache<I: CacheItem, X = ()> {
    name: String,
    entries: HashMap<I::Key, CacheObject<I, X>>,
    lifecycle: Box<dyn ExtraLifecycle<I, X>>,
    stats: CacheStats,
}

impl<I: CacheItem> Cache<I, ()> {
    /// A cache with no per-object extension.
    pub fn new(name: &str) -> Cache<I, ()> {
        Cache::with_extra(name, Box::new(NoExtra))
    }
}

impl<I: CacheItem, X> Cache<I, X> {
    pub fn with_extra(name: &str, lifecycle: Box<dyn ExtraLifecycle<I, X>>) -> Cache<I, X> {
        Cache {
            name: name.to_owned(),
            entries: HashMap::new(),
            lifecycle,
            stats: CacheStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a new object. Fails when another object already occupies the
    /// fingerprint bucket.
    pub fn add(&mut self, item: I) -> Result<(), CoreError> {
        let Some(key) = item.item_key() else {
            self.stats.add_fail += 1;
            return Err(CoreError::ResourceExhausted("object without fingerprint"));
        };
        if self.entries.contains_key(&key) {
            self.stats.add_fail += 1;
            return Err(CoreError::Exists);
        }
        let extra = self.lifecycle.on_add(&item);
        self.entries.insert(key, CacheObject { item, extra });
        self.stats.add_ok += 1;
        self.stats.active += 1;
        Ok(())
    }

    pub fn find(&self, key: &I::Key) -> Option<&CacheObject<I, X>> {
        self.entries.get(key)
    }

    pub fn find_mut(&mut self, key: &I::Key) -> Option<&mut CacheObject<I, X>> {
        self.entries.get_mut(key)
    }

    /// Upserts: merges into an existing object (firing the update hook) or
    /// inserts a new one.
    pub fn update_force(&mut self, item: I) -> Result<(), CoreError> {
        let Some(key) = item.item_key() else {
            self.stats.upd_fail += 1;
            return Err(CoreError::ResourceExhausted("object without fingerprint"));
        };
        if let Some(obj) = self.entries.get_mut(&key) {
            obj.item.merge_from(&item);
            self.lifecycle.on_update(&obj.item, &mut obj.extra);
            self.stats.upd_ok += 1;
            return Ok(());
        }
        let extra = self.lifecycle.on_add(&item);
        self.entries.insert(key, CacheObject { item, extra });
        self.stats.add_ok += 1;
        self.stats.active += 1;
        Ok(())
    }

    /// Removes and destroys the object under `key`.
    pub fn del(&mut self, key: &I::Key) -> bool {
        match self.entries.remove(key) {
            Some(mut obj) => {
                self.lifecycle.on_destroy(&obj.item, &mut obj.extra);
                self.stats.del_ok += 1;
                self.stats.active -= 1;
                true
            }
            None => {
                self.stats.del_fail += 1;
                false
            }
        }
    }

    /// Destroys every object.
    pub fn flush(&mut self) {
        let keys: Vec<_> = self.entries.keys().cloned().collect();
        for key in keys {
            self.del(&key);
        }
    }

    /// Stable traversal. The callback may remove the current object (by
    /// verdict) but no other.
    pub fn iterate(&mut self, mut cb: impl FnMut(&I, &mut X) -> IterVerdict) {
        let keys: Vec<_> = self.entries.keys().cloned().collect();
        for key in keys {
            let verdict = match self.entries.get_mut(&key) {
                Some(obj) => cb(&obj.item, &mut obj.extra),
                None => continue,
            };
            if verdict == IterVerdict::Remove {
                self.del(&key);
            }
        }
    }

    /// Read-only traversal, e.g. for cache replay.
    pub fn for_each(&self, mut cb: impl FnMut(&I)) {
        for obj in self.entries.values() {
            cb(&obj.item);
        }
    }

    /// Streams a dump of every object to `out`.
    pub fn dump(&self, out: &mut dyn Write, fmt: DumpFormat) -> io::Result<()> {
        if fmt == DumpFormat::Xml {
            writeln!(out, "<cache name=\"{}\">", self.name)?;
        }
        for obj in self.entries.values() {
            let mut line = obj.item.render(fmt);
            if let Some(annot) = self.lifecycle.dump(&obj.item, &obj.extra, fmt) {
                line.push_str(&annot);
            }
            writeln!(out, "{}", line)?;
        }
        if fmt == DumpFormat::Xml {
            writeln!(out, "</cache>")?;
        }
        Ok(())
    }

    /// Streams the counter block shown by the `stats` control command.
    pub fn write_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        let s = self.stats;
        writeln!(out, "cache:{} active objects:\t\t{:12}", self.name, s.active)?;
        writeln!(out, "\tobject new:\t\t\t{:12}\tfailed:\t{:12}", s.add_ok, s.add_fail)?;
        writeln!(out, "\tobject update:\t\t\t{:12}\tfailed:\t{:12}", s.upd_ok, s.upd_fail)?;
        writeln!(out, "\tobject destroy:\t\t\t{:12}\tfailed:\t{:12}", s.del_ok, s.del_fail)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn flow(n: u8) -> Flow {
        Flow::tcp_v4(
            Ipv4Addr::new(10, 0, 0, n),
            1000,
            Ipv4Addr::new(10, 0, 0, 200),
            80,
        )
    }

    #[test]
    fn duplicate_fingerprint_fails_with_exists() {
        let mut cache: Cache<Flow> = Cache::new("internal");
        cache.add(flow(1)).unwrap();
        assert!(matches!(cache.add(flow(1)), Err(CoreError::Exists)));
        let s = cache.stats();
        assert_eq!((s.add_ok, s.add_fail, s.active), (1, 1, 1));
    }

    #[test]
    fn add_then_del_restores_prior_state() {
        let mut cache: Cache<Flow> = Cache::new("internal");
        let before = cache.stats();
        cache.add(flow(1)).unwrap();
        assert!(cache.del(&flow(1).key().unwrap()));
        let after = cache.stats();
        assert_eq!(after.active, before.active);
        assert_eq!(after.add_ok, before.add_ok + 1);
        assert_eq!(after.del_ok, before.del_ok + 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn update_force_upserts_and_merges() {
        let mut cache: Cache<Flow> = Cache::new("external");
        let mut original = flow(1);
        original.mark = Some(1);
        cache.update_force(original).unwrap();
        assert_eq!(cache.stats().add_ok, 1);

        let mut update = flow(1);
        update.tcp_state = Some(3);
        cache.update_force(update).unwrap();
        assert_eq!(cache.stats().upd_ok, 1);

        let obj = cache.find(&flow(1).key().unwrap()).unwrap();
        assert_eq!(obj.item.mark, Some(1));
        assert_eq!(obj.item.tcp_state, Some(3));
    }

    #[test]
    fn del_of_absent_key_counts_a_failure() {
        let mut cache: Cache<Flow> = Cache::new("external");
        assert!(!cache.del(&flow(9).key().unwrap()));
        assert_eq!(cache.stats().del_fail, 1);
    }

    #[test]
    fn iterate_may_remove_the_current_object() {
        let mut cache: Cache<Flow> = Cache::new("internal");
        for n in 1..=5 {
            cache.add(flow(n)).unwrap();
        }
        cache.iterate(|item, _| {
            if item.orig.map(|ip| ip.src()) == Some(Ipv4Addr::new(10, 0, 0, 3).into()) {
                IterVerdict::Remove
            } else {
                IterVerdict::Keep
            }
        });
        assert_eq!(cache.len(), 4);
        assert!(cache.find(&flow(3).key().unwrap()).is_none());
    }

    #[test]
    fn flush_destroys_everything() {
        let mut cache: Cache<Flow> = Cache::new("internal");
        for n in 1..=3 {
            cache.add(flow(n)).unwrap();
        }
        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().del_ok, 3);
    }

    #[test]
    fn dump_renders_every_object() {
        let mut cache: Cache<Flow> = Cache::new("internal");
        cache.add(flow(1)).unwrap();
        cache.add(flow(2)).unwrap();
        let mut out = Vec::new();
        cache.dump(&mut out, DumpFormat::Plain).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("proto=6"));

        let mut xml = Vec::new();
        cache.dump(&mut xml, DumpFormat::Xml).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.starts_with("<cache name=\"internal\">"));
        assert!(text.contains("<flow>"));
    }

    struct CountingLifecycle {
        adds: std::rc::Rc<std::cell::Cell<u32>>,
        destroys: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl ExtraLifecycle<Flow, u32> for CountingLifecycle {
        fn on_add(&mut self, _item: &Flow) -> u32 {
            self.adds.set(self.adds.get() + 1);
            self.adds.get()
        }
        fn on_update(&mut self, _item: &Flow, _extra: &mut u32) {}
        fn on_destroy(&mut self, _item: &Flow, _extra: &mut u32) {
            self.destroys.set(self.destroys.get() + 1);
        }
    }

    #[test]
    fn lifecycle_hooks_fire_once_per_transition() {
        let adds = std::rc::Rc::new(std::cell::Cell::new(0));
        let destroys = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut cache = Cache::with_extra(
            "track",
            Box::new(CountingLifecycle {
                adds: adds.clone(),
                destroys: destroys.clone(),
            }),
        );
        cache.add(flow(1)).unwrap();
        cache.add(flow(2)).unwrap();
        cache.flush();
        assert_eq!(adds.get(), 2);
        assert_eq!(destroys.get(), 2);
    }
}
