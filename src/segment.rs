//! Immutable on-disk sorted runs ("SSTables"): construction from a memtable
//! snapshot, construction from a k-way merge of a level's segments, the
//! sparse index, and the point-lookup path.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::filter::BloomFilter;

/// A single record read off a segment's backing file.
type Record = (String, String);

/// An immutable sorted key/value run on disk, with an in-memory sparse index
/// and membership filter. Segments are move-only (no `Clone`): the same
/// resource cannot be owned by two levels at once.
pub struct Segment {
    path: PathBuf,
    file: RefCell<File>,
    index: Vec<(String, u64)>,
    filter: BloomFilter,
    block_size: usize,
    len: usize,
}

impl Segment {
    /// Builds a segment file from an ordered, deduplicated snapshot of
    /// records (e.g. a memtable's `iter()`).
    pub fn create_from_memtable<'a, I>(path: PathBuf, records: I, block_size: usize) -> Result<Self>
    where
        I: Iterator<Item = (&'a String, &'a String)>,
    {
        let mut write_handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut index = Vec::new();
        let mut filter = BloomFilter::new();
        let mut offset: u64 = 0;
        let mut count: usize = 0;

        for (key, value) in records {
            if count % block_size == 0 {
                index.push((key.clone(), offset));
            }
            offset += write_record(&mut write_handle, key, value)?;
            filter.add(key.as_bytes());
            count += 1;
        }
        write_handle.flush()?;
        drop(write_handle);

        let read_handle = OpenOptions::new().read(true).open(&path)?;
        log::debug!(
            "built segment {} with {} records ({} index blocks)",
            path.display(),
            count,
            index.len()
        );

        Ok(Segment {
            path,
            file: RefCell::new(read_handle),
            index,
            filter,
            block_size,
            len: count,
        })
    }

    /// Builds a segment by k-way merging `sources`, ordered oldest-first
    /// (the last element is the newest). On a tie, the value from the
    /// highest-indexed (newest) source wins. `sources` is borrowed rather
    /// than consumed so that a failed merge (I/O error, or corruption in a
    /// source) leaves the caller's copies of `sources` untouched; only once
    /// this returns `Ok` are the sources' backing files removed, and only
    /// then should a caller drop its references to them.
    pub fn create_from_merge(path: PathBuf, sources: &[Segment], block_size: usize) -> Result<Self> {
        let mut readers: Vec<RecordReader> = sources
            .iter()
            .map(|s| RecordReader::open(&s.path))
            .collect::<Result<_>>()?;

        let mut current: Vec<Option<Record>> = Vec::with_capacity(readers.len());
        for reader in readers.iter_mut() {
            current.push(reader.next_record()?);
        }

        let mut write_handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut index = Vec::new();
        let mut filter = BloomFilter::new();
        let mut offset: u64 = 0;
        let mut count: usize = 0;

        loop {
            // Scan from the highest index downward so a tie is won by the
            // first (i.e. newest) source encountered.
            let mut winner: Option<usize> = None;
            for i in (0..current.len()).rev() {
                if let Some((key, _)) = &current[i] {
                    match winner {
                        None => winner = Some(i),
                        Some(w) => {
                            let current_min = &current[w].as_ref().unwrap().0;
                            if key < current_min {
                                winner = Some(i);
                            }
                        }
                    }
                }
            }

            let Some(winner) = winner else { break };
            let (key, value) = current[winner].clone().unwrap();

            // Collapse duplicates: advance every source whose current key
            // matches the one just emitted, including the winner itself.
            for i in 0..current.len() {
                loop {
                    let matches = matches!(&current[i], Some((k, _)) if k == &key);
                    if !matches {
                        break;
                    }
                    current[i] = readers[i].next_record()?;
                }
            }

            if count % block_size == 0 {
                index.push((key.clone(), offset));
            }
            offset += write_record(&mut write_handle, &key, &value)?;
            filter.add(key.as_bytes());
            count += 1;
        }

        write_handle.flush()?;
        drop(write_handle);

        let read_handle = OpenOptions::new().read(true).open(&path)?;
        log::info!(
            "merged {} segments into {} ({} records)",
            sources.len(),
            path.display(),
            count
        );

        for source in sources.iter() {
            if let Err(e) = std::fs::remove_file(&source.path) {
                log::warn!("could not remove compacted segment {}: {}", source.path.display(), e);
            }
        }

        Ok(Segment {
            path,
            file: RefCell::new(read_handle),
            index,
            filter,
            block_size,
            len: count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Point lookup, per spec: filter gate, sparse-index block selection,
    /// block read, intra-block binary search.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.filter.contains(key.as_bytes()) {
            return Ok(None);
        }

        let Some(offset) = self.find_block_offset(key) else {
            return Ok(None);
        };

        let block = self.read_block(offset)?;
        Ok(search_block(&block, key))
    }

    /// Rightmost sparse-index entry with `entry.key <= key`, if any.
    fn find_block_offset(&self, key: &str) -> Option<u64> {
        let count = self.index.partition_point(|(k, _)| k.as_str() <= key);
        if count == 0 {
            None
        } else {
            Some(self.index[count - 1].1)
        }
    }

    /// Reads up to `block_size` records starting at `offset`. A malformed
    /// (unterminated or truncated) record ends the block early rather than
    /// erroring: it is treated as the end of the segment.
    fn read_block(&self, offset: u64) -> Result<Vec<Record>> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);

        let mut block = Vec::with_capacity(self.block_size);
        for _ in 0..self.block_size {
            let mut key_line = String::new();
            if reader.read_line(&mut key_line)? == 0 {
                break;
            }
            if key_line.pop() != Some('\n') {
                break;
            }

            let mut value_line = String::new();
            if reader.read_line(&mut value_line)? == 0 {
                break;
            }
            if value_line.pop() != Some('\n') {
                break;
            }

            block.push((key_line, value_line));
        }
        Ok(block)
    }
}

/// Rightmost entry in an ascending-by-key block with `entry.key <= key`.
fn search_block(block: &[Record], key: &str) -> Option<String> {
    let count = block.partition_point(|(k, _)| k.as_str() <= key);
    if count == 0 {
        return None;
    }
    let (found_key, value) = &block[count - 1];
    if found_key == key {
        Some(value.clone())
    } else {
        None
    }
}

fn write_record(file: &mut File, key: &str, value: &str) -> Result<u64> {
    let mut written = 0u64;
    file.write_all(key.as_bytes())?;
    file.write_all(b"\n")?;
    written += key.len() as u64 + 1;
    file.write_all(value.as_bytes())?;
    file.write_all(b"\n")?;
    written += value.len() as u64 + 1;
    Ok(written)
}

/// Strict record-by-record reader used by compaction. Unlike the lookup
/// path's block reader, a truncated record here is a hard corruption error:
/// a compaction must never silently drop or fabricate data.
///
/// Reads raw `\n`-terminated lines rather than using `BufRead::lines()`,
/// which also strips a trailing `\r` — spec §3 only forbids `0x0A` in keys
/// and values, so a value ending in `0x0D` is valid and must round-trip
/// through a merge unchanged, the same way `read_block` already preserves it.
struct RecordReader {
    reader: BufReader<File>,
}

impl RecordReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(RecordReader {
            reader: BufReader::new(file),
        })
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(key) = self.read_line()? else {
            return Ok(None);
        };
        let value = self.read_line()?.ok_or_else(|| EngineError::Corruption {
            detail: format!("key {:?} has no matching value line", key),
        })?;
        Ok(Some((key, value)))
    }

    /// Reads one line, stripping only the trailing `\n`. `Ok(None)` at a
    /// clean end-of-file; a non-empty line missing its terminating `\n` is
    /// corruption, not a partial record.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.pop() != Some('\n') {
            return Err(EngineError::Corruption {
                detail: "record truncated before its terminating newline".to_owned(),
            });
        }
        Ok(Some(line))
    }
}
