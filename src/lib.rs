//!
//! An embedded key-value store built as a leveled [Log Structured Merge
//! Tree](https://en.wikipedia.org/wiki/Log-structured_merge-tree).
//!
//! ## Example usage
//! ```
//! use lsm_engine::{Engine, EngineConfig};
//! use tempfile::tempdir;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempdir()?;
//!     let config = EngineConfig::builder()
//!         .directory(dir.path())
//!         .memtable_capacity(1)
//!         .fan_out(2)
//!         .block_size(2)
//!         .build();
//!
//!     let mut engine = Engine::open(config)?;
//!     engine.add("k1".to_owned(), "v1".to_owned())?;
//!     engine.add("k2".to_owned(), "k2".to_owned())?;
//!     engine.add("k1".to_owned(), "v_1_1".to_owned())?;
//!     let value = engine.get("k1")?;
//!     assert_eq!(value, Some("v_1_1".to_owned()));
//!     Ok(())
//! }
//! ```
//!
//! ## Design
//!
//! `lsm_engine` accepts point inserts of string keys mapped to string values
//! and persists batches of accumulated writes to immutable on-disk sorted
//! runs ("segments").
//!
//! ### Write
//! When a write comes in:
//! * The entry is inserted into the in-memory memtable, overwriting any
//!   prior value for the same key.
//! * If the memtable's size has reached its configured capacity, its
//!   contents are flushed to a new segment at level 0.
//! * If a level now holds as many segments as the configured fan-out, that
//!   level's segments are k-way merged into a single new segment at the
//!   next level, cascading upward for as long as the condition holds.
//!
//! ### Read
//! When a read comes in:
//! * The memtable is checked first; a hit there is always the most recent
//!   write.
//! * Failing that, each level is probed in increasing depth, and within a
//!   level, segments are probed newest-to-oldest (level 0 may hold
//!   overlapping key ranges across multiple flushes, so within-level order
//!   matters). The first hit wins.
//!
//! There is no delete operation and no write-ahead log: this engine favors
//! write throughput over durability across an unclean shutdown (see
//! `SPEC_FULL.md`/`DESIGN.md` in the repository for the full rationale).
//!

mod config;
mod error;
mod filter;
mod memtable;
mod segment;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{EngineError, Result};

use memtable::Memtable;
use segment::Segment;
use std::path::PathBuf;

/// The embedded LSM engine: a memtable plus a growable vector of levels.
pub struct Engine {
    memtable: Memtable,
    levels: Vec<Vec<Segment>>,
    next_sequence: Vec<usize>,
    config: EngineConfig,
}

impl Engine {
    /// Opens (creating if necessary) an engine rooted at
    /// `config.directory`. The memtable and level vector start empty;
    /// reopening a directory containing segments from a prior process does
    /// not recover them (the sparse index and filter are in-memory only —
    /// see `SPEC_FULL.md` §6).
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        Ok(Engine {
            memtable: Memtable::new(),
            levels: Vec::new(),
            next_sequence: Vec::new(),
            config,
        })
    }

    /// Inserts or overwrites `key` with `value`. May synchronously flush the
    /// memtable and cascade compactions through one or more levels before
    /// returning.
    pub fn add(&mut self, key: String, value: String) -> Result<()> {
        validate_no_newline(&key, "key")?;
        validate_no_newline(&value, "value")?;

        self.memtable.insert(key, value);
        if self.memtable.len() < self.config.memtable_capacity {
            return Ok(());
        }

        self.flush()?;
        self.cascade()?;
        Ok(())
    }

    /// Looks up `key`, honoring the most recent write: memtable, then level
    /// 0 newest-to-oldest, then level 1 newest-to-oldest, and so on.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.memtable.get(key) {
            return Ok(Some(value.clone()));
        }

        for level in &self.levels {
            for segment in level.iter().rev() {
                if let Some(value) = segment.get(key)? {
                    return Ok(Some(value));
                }
            }
        }

        Ok(None)
    }

    /// Flushes the memtable to a new level-0 segment. The segment is built
    /// from a borrowed snapshot of the memtable, so a failure here leaves
    /// the memtable untouched; it is only cleared once the segment exists.
    fn flush(&mut self) -> Result<()> {
        let path = self.next_segment_path(0);
        log::debug!(
            "flushing memtable ({} entries) to {}",
            self.memtable.len(),
            path.display()
        );

        let segment = Segment::create_from_memtable(path, self.memtable.iter(), self.config.block_size)?;
        self.ensure_level(0);
        self.levels[0].push(segment);
        self.memtable.clear();
        Ok(())
    }

    /// Cascades compactions upward for as long as a level holds at least
    /// `fan_out` segments. `self.levels[level]` is left untouched until the
    /// merge has actually succeeded, so an I/O or corruption error from
    /// `create_from_merge` never orphans previously-flushed segments: on
    /// error the level's segments are exactly as they were before this call.
    fn cascade(&mut self) -> Result<()> {
        let mut level = 0;
        while self.levels.get(level).map_or(false, |l| l.len() >= self.config.fan_out) {
            self.ensure_level(level + 1);
            let path = self.next_segment_path(level + 1);

            log::info!(
                "cascading {} segments from level {} into level {} ({})",
                self.levels[level].len(),
                level,
                level + 1,
                path.display()
            );

            let merged = Segment::create_from_merge(path, &self.levels[level], self.config.block_size)?;
            self.levels[level].clear();
            self.levels[level + 1].push(merged);
            level += 1;
        }
        Ok(())
    }

    fn ensure_level(&mut self, level: usize) {
        while self.levels.len() <= level {
            self.levels.push(Vec::new());
            self.next_sequence.push(0);
        }
    }

    fn next_segment_path(&mut self, level: usize) -> PathBuf {
        self.ensure_level(level);
        let sequence = self.next_sequence[level];
        self.next_sequence[level] += 1;
        self.config.directory.join(format!("{}_{}.seg", level, sequence))
    }
}

fn validate_no_newline(s: &str, context: &str) -> Result<()> {
    if s.as_bytes().contains(&b'\n') {
        return Err(EngineError::InvalidInput {
            context: context.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path, capacity: usize, fan_out: usize, block_size: usize) -> Engine {
        let config = EngineConfig::builder()
            .directory(dir)
            .memtable_capacity(capacity)
            .fan_out(fan_out)
            .block_size(block_size)
            .build();
        Engine::open(config).unwrap()
    }

    fn random_string(rng: &mut StdRng, len: usize) -> String {
        rng.sample_iter(&Alphanumeric).take(len).map(char::from).collect()
    }

    #[test]
    fn basic_read_your_writes() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 3, 4, 8);
        lsm.add("k1".to_owned(), "v1".to_owned())?;
        lsm.add("k2".to_owned(), "v2".to_owned())?;
        lsm.add("k3".to_owned(), "v3".to_owned())?;

        for (k, v) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3")] {
            assert_eq!(lsm.get(k)?, Some(v.to_owned()));
        }
        Ok(())
    }

    #[test]
    fn overwrite_across_a_flush() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 2, 3, 2);

        lsm.add("k1".to_owned(), "v1".to_owned())?;
        lsm.add("k2".to_owned(), "k2".to_owned())?;
        lsm.add("k1".to_owned(), "v_1_1".to_owned())?;
        lsm.add("k3".to_owned(), "v3".to_owned())?;

        assert_eq!(lsm.get("k1")?, Some("v_1_1".to_owned()));
        Ok(())
    }

    #[test]
    fn absence_for_never_inserted_keys() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 100, 3, 50);
        let mut rng: StdRng = SeedableRng::seed_from_u64(7);

        for _ in 0..1000 {
            lsm.add(random_string(&mut rng, 10), random_string(&mut rng, 10))?;
        }

        for _ in 0..1000 {
            // distinct length from inserted keys, so it can never collide
            let key = random_string(&mut rng, 32);
            assert_eq!(lsm.get(&key)?, None);
        }
        Ok(())
    }

    #[test]
    fn newline_in_key_or_value_is_rejected() {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 4, 4, 4);
        assert!(lsm.add("bad\nkey".to_owned(), "v".to_owned()).is_err());
        assert!(lsm.add("k".to_owned(), "bad\nvalue".to_owned()).is_err());
    }

    /// §7: "No partial state is exposed" for a failing flush/cascade.
    /// Forces the level-0-into-level-1 cascade to fail by pre-creating a
    /// directory at the exact path the merge would open for writing, then
    /// checks that every key already flushed to level 0 is still readable
    /// afterward — the level's segments must not be dropped until the merge
    /// actually succeeds.
    #[test]
    fn failed_cascade_does_not_lose_previously_flushed_keys() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 2, 2, 2);

        lsm.add("k1".to_owned(), "v1".to_owned())?;
        // Flushes to level 0's first segment ("0_0.seg"); one segment is
        // below fan_out, so no cascade yet.
        lsm.add("k2".to_owned(), "v2".to_owned())?;
        // Memtable-only; no flush yet.
        lsm.add("k3".to_owned(), "v3".to_owned())?;

        // The next flush will bring level 0 to `fan_out` (2) segments and
        // trigger, in that same `add` call, a cascade into level 1,
        // sequence 0: "1_0.seg". Block that path with a directory first so
        // the merge's file-create fails.
        std::fs::create_dir(dir.path().join("1_0.seg")).unwrap();

        let result = lsm.add("k4".to_owned(), "v4".to_owned());
        assert!(result.is_err(), "cascade should have failed on the blocked path");

        // Every previously-flushed key must still be reachable: level 0's
        // two segments were never cleared, since the merge never succeeded.
        assert_eq!(lsm.get("k1")?, Some("v1".to_owned()));
        assert_eq!(lsm.get("k2")?, Some("v2".to_owned()));
        assert_eq!(lsm.get("k3")?, Some("v3".to_owned()));
        assert_eq!(lsm.get("k4")?, Some("v4".to_owned()));
        Ok(())
    }

    /// S4 from spec.md §8: forced cascades at tiny thresholds. Run under
    /// `test-log` so flush/cascade `log` output is visible with
    /// `RUST_LOG=debug cargo test`.
    #[test_log::test]
    fn tiny_thresholds_force_cascades() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 2, 2, 1);

        lsm.add("b".to_owned(), "1".to_owned())?;
        lsm.add("a".to_owned(), "2".to_owned())?;
        lsm.add("b".to_owned(), "3".to_owned())?;
        lsm.add("c".to_owned(), "4".to_owned())?;
        lsm.add("a".to_owned(), "5".to_owned())?;
        lsm.add("d".to_owned(), "6".to_owned())?;

        assert_eq!(lsm.get("a")?, Some("5".to_owned()));
        assert_eq!(lsm.get("b")?, Some("3".to_owned()));
        assert_eq!(lsm.get("c")?, Some("4".to_owned()));
        assert_eq!(lsm.get("d")?, Some("6".to_owned()));
        assert_eq!(lsm.get("e")?, None);
        Ok(())
    }

    /// S1/S2/S3 from spec.md §8, combined into one randomized run.
    #[test]
    fn randomized_inserts_are_always_readable_and_tracked() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut lsm = engine(dir.path(), 100, 3, 50);
        let mut rng: StdRng = SeedableRng::seed_from_u64(20);

        let dataset: Vec<(String, String)> = (0..1000)
            .map(|i| (format!("k{}", i), format!("v{}", i)))
            .collect();
        let mut seen: HashMap<&str, &str> = HashMap::new();

        for (key, value) in &dataset {
            lsm.add(key.clone(), value.clone())?;
            seen.insert(key, value);

            let (random_key, _) = dataset.choose(&mut rng).unwrap();
            let expected = seen.get(random_key.as_str()).map(|v| v.to_string());
            assert_eq!(lsm.get(random_key)?, expected);
        }

        for (key, value) in &dataset {
            assert_eq!(lsm.get(key)?, Some(value.clone()));
        }
        Ok(())
    }
}
