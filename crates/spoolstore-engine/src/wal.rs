//! Write-ahead log
//!
//! The WAL is the only on-disk state of the engine. Each mutation is encoded
//! as a checksummed record and appended to the current segment; the RAM table
//! is updated only after the append succeeded, so replaying the log on open
//! rebuilds exactly the state that was visible before shutdown.
//!
//! Segments are named `wal-{seq:016x}.log` and rotate once they pass the
//! configured size. Replay walks them in sequence order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::format::{decode_record, encode_record, RecordKind, WalRecord, HEADER_SIZE, MAGIC_ARRAY};
use crate::platform::durable_sync;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

fn segment_name(sequence: u64) -> String {
    format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX)
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// Appends records to the current segment.
///
/// Invariant: an append returns Ok only after the record bytes were handed
/// to the OS (and, for durable appends, synced). Callers update RAM after.
pub struct WalWriter {
    /// Current segment handle
    file: File,
    /// Path to current segment (for error context)
    path: PathBuf,
    /// Current segment size in bytes (tracked to avoid stat calls)
    size: u64,
    /// WAL directory for rotation
    wal_dir: PathBuf,
    /// Sequence number of the current segment
    sequence: u64,
    /// Rotate when the next record would push a segment past this size
    rotation_size: u64,
}

impl WalWriter {
    /// Open the WAL in `wal_dir`, resuming the highest existing segment.
    ///
    /// Scans that segment to find where its intact records end. After a
    /// [`WalReader::replay`] use [`WalWriter::after_replay`] instead, which
    /// reuses the position the replay already found.
    pub fn open<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> EngineResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        create_wal_dir(&wal_dir)?;

        let tail = match list_segments(&wal_dir)?.pop() {
            Some((sequence, path)) => Some(SegmentTail {
                sequence,
                valid_len: scan_segment(&path, &mut |_| {})?,
            }),
            None => None,
        };
        Self::resume(wal_dir, rotation_size, tail)
    }

    /// Open the WAL right after `replay` scanned it.
    pub fn after_replay<P: AsRef<Path>>(wal_dir: P, rotation_size: u64, replay: &Replay) -> EngineResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        create_wal_dir(&wal_dir)?;
        Self::resume(wal_dir, rotation_size, replay.tail)
    }

    fn resume(wal_dir: PathBuf, rotation_size: u64, tail: Option<SegmentTail>) -> EngineResult<Self> {
        let sequence = tail.map_or(0, |t| t.sequence);
        let path = wal_dir.join(segment_name(sequence));
        let file = open_segment(&path)?;
        let mut size = file
            .metadata()
            .map_err(|e| EngineError::io_at(&path, e, "Failed to stat WAL segment"))?
            .len();

        // Bytes past the last intact record would hide new appends from replay
        if let Some(valid_len) = tail.map(|t| t.valid_len) {
            if valid_len < size {
                warn!(
                    segment = %path.display(),
                    valid_len,
                    dropped = size - valid_len,
                    "truncating unreadable WAL tail"
                );
                file.set_len(valid_len)
                    .map_err(|e| EngineError::io_at(&path, e, "Failed to truncate WAL tail"))?;
                size = valid_len;
            }
        }

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size })
    }

    /// Append a record. When `durable` is set the segment is synced before
    /// returning, so the record survives power loss.
    pub fn append(&mut self, key: &[u8], value: &[u8], kind: RecordKind, durable: bool) -> EngineResult<()> {
        let bytes = encode_record(key, value, kind)?;

        if self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file
            .write_all(&bytes)
            .map_err(|e| EngineError::io_at(&self.path, e, "WAL write failed"))?;
        self.size += bytes.len() as u64;

        if durable {
            self.sync()?;
        }
        Ok(())
    }

    /// Sync the current segment without writing anything.
    pub fn sync(&self) -> EngineResult<()> {
        durable_sync(&self.file).map_err(|e| EngineError::io_at(&self.path, e, "WAL sync failed"))
    }

    /// A handle that syncs the current segment without borrowing the writer.
    /// Segments rotated away earlier were synced by the rotation.
    pub fn sync_handle(&self) -> EngineResult<WalSync> {
        let file = self
            .file
            .try_clone()
            .map_err(|e| EngineError::io_at(&self.path, e, "Failed to clone WAL handle"))?;
        Ok(WalSync { file, path: self.path.clone() })
    }

    /// Sync the current segment and start the next one.
    fn rotate(&mut self) -> EngineResult<()> {
        self.sync()?;

        self.sequence += 1;
        let path = self.wal_dir.join(segment_name(self.sequence));
        self.file = open_segment(&path)?;
        self.path = path;
        self.size = 0;

        debug!(segment = %self.path.display(), "rotated WAL segment");
        Ok(())
    }

    /// Current segment path (diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Current segment size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }

    /// Sequence number of the current segment
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Detached sync of one WAL segment, from [`WalWriter::sync_handle`].
#[derive(Debug)]
pub struct WalSync {
    file: File,
    path: PathBuf,
}

impl WalSync {
    /// Make every record appended before the handle was taken durable.
    pub fn sync(&self) -> EngineResult<()> {
        durable_sync(&self.file).map_err(|e| EngineError::io_at(&self.path, e, "WAL sync failed"))
    }
}

fn create_wal_dir(wal_dir: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(wal_dir).map_err(|e| EngineError::io_at(wal_dir, e, "Failed to create WAL directory"))
}

fn open_segment(path: &Path) -> EngineResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngineError::io_at(path, e, "Failed to open WAL segment"))
}

/// All segments in `wal_dir`, sorted by sequence number.
fn list_segments(wal_dir: &Path) -> EngineResult<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(wal_dir)
        .map_err(|e| EngineError::io_at(wal_dir, e, "Failed to read WAL directory"))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io_at(wal_dir, e, "Failed to read directory entry"))?;
        let path = entry.path();
        if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_segment_name) {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Replays WAL segments on open.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Hand every intact record to `apply`, in sequence order, one segment
    /// at a time.
    ///
    /// Per segment:
    /// 1. Check the magic at the current offset; resync to the next magic if absent
    /// 2. A record failing its checksum is skipped by resyncing to the next magic
    /// 3. A record whose declared length runs past EOF is skipped the same way;
    ///    when no magic follows it is a torn tail and ends the segment
    ///
    /// A missing directory replays nothing.
    pub fn replay<F: FnMut(WalRecord)>(&self, mut apply: F) -> EngineResult<Replay> {
        let mut replay = Replay::default();
        if !self.wal_dir.exists() {
            return Ok(replay);
        }

        for (sequence, path) in list_segments(&self.wal_dir)? {
            let valid_len = scan_segment(&path, &mut |record| {
                replay.records += 1;
                apply(record);
            })?;
            replay.tail = Some(SegmentTail { sequence, valid_len });
        }
        Ok(replay)
    }

    /// Collect every intact record, in sequence order.
    pub fn recover(&self) -> EngineResult<Vec<WalRecord>> {
        let mut records = Vec::new();
        self.replay(|record| records.push(record))?;
        Ok(records)
    }
}

/// Outcome of [`WalReader::replay`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Replay {
    /// Records handed to the callback
    pub records: usize,
    tail: Option<SegmentTail>,
}

/// Newest segment and the end of its last intact record.
#[derive(Debug, Clone, Copy)]
struct SegmentTail {
    sequence: u64,
    valid_len: u64,
}

/// Scan one segment, returning the end offset of its last intact record.
/// Nothing past that offset decodes, so truncating there loses no record.
fn scan_segment(path: &Path, apply: &mut dyn FnMut(WalRecord)) -> EngineResult<u64> {
    let mut buffer = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buffer))
        .map_err(|e| EngineError::io_at(path, e, "Failed to read WAL segment"))?;

    let mut offset = 0;
    let mut valid_len = 0;

    while offset + HEADER_SIZE <= buffer.len() {
        if buffer[offset..offset + 4] != MAGIC_ARRAY {
            warn!(segment = %path.display(), offset, "bad WAL magic, scanning for next record");
            match find_next_magic(&buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        let length = u32::from_le_bytes([
            buffer[offset + 4],
            buffer[offset + 5],
            buffer[offset + 6],
            buffer[offset + 7],
        ]) as usize;
        let total = HEADER_SIZE + length;

        // The checksum does not cover the length, so a corrupted length looks
        // like a torn tail until a later record proves otherwise
        if offset + total > buffer.len() {
            match find_next_magic(&buffer, offset + 1) {
                Some(next) => {
                    warn!(
                        segment = %path.display(),
                        offset,
                        needed = total,
                        available = buffer.len() - offset,
                        "WAL record runs past segment end, scanning for next record"
                    );
                    offset = next;
                    continue;
                }
                None => {
                    warn!(
                        segment = %path.display(),
                        offset,
                        needed = total,
                        available = buffer.len() - offset,
                        "torn WAL tail, stopping replay of segment"
                    );
                    break;
                }
            }
        }

        match decode_record(&buffer[offset..offset + total], path) {
            Ok(record) => {
                apply(record);
                offset += total;
                valid_len = offset;
            }
            Err(e) => {
                warn!(segment = %path.display(), offset, error = %e, "corrupt WAL record skipped");
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }

    Ok(valid_len as u64)
}

/// Next offset at or after `start` where the record magic appears.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if start >= buffer.len() {
        return None;
    }
    buffer[start..]
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|pos| start + pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ROTATE_LARGE: u64 = 100 * 1024 * 1024;

    #[test]
    fn test_append_then_recover_in_order() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        writer.append(b"key1", b"value1", RecordKind::Put, true).unwrap();
        writer.append(b"key2", b"value2", RecordKind::Put, false).unwrap();
        writer.append(b"key1", b"", RecordKind::Delete, false).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let records = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, b"key1");
        assert_eq!(records[0].value, b"value1");
        assert_eq!(records[0].kind, RecordKind::Put);
        assert_eq!(records[1].key, b"key2");
        assert_eq!(records[2].kind, RecordKind::Delete);
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        writer.append(b"good1", b"val1", RecordKind::Put, false).unwrap();
        let first_len = writer.current_size() as usize;
        writer.append(b"good2", b"val2", RecordKind::Put, false).unwrap();
        writer.append(b"good3", b"val3", RecordKind::Put, false).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        // Flip the last value byte of the second record
        let mut data = std::fs::read(&path).unwrap();
        data[2 * first_len - 1] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover().unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"good1".as_slice(), b"good3".as_slice()]);
    }

    #[test]
    fn test_torn_tail_stops_cleanly() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        writer.append(b"complete", b"entry", RecordKind::Put, false).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&MAGIC_ARRAY);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; HEADER_SIZE - 8]);
        std::fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"complete");
    }

    #[test]
    fn test_rotation_replays_across_segments() {
        let temp = TempDir::new().unwrap();
        let value = vec![7u8; 64 * 1024];

        // 1MB segments, 64KB values: 40 records spill into several segments
        let mut writer = WalWriter::open(temp.path(), 1024 * 1024).unwrap();
        for i in 0..40u32 {
            writer.append(&i.to_be_bytes(), &value, RecordKind::Put, false).unwrap();
        }
        assert!(writer.sequence() >= 2);
        drop(writer);

        let records = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(records.len(), 40);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.key, (i as u32).to_be_bytes());
        }
    }

    #[test]
    fn test_reopen_resumes_last_segment() {
        let temp = TempDir::new().unwrap();
        {
            let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
            writer.append(b"a", b"1", RecordKind::Put, false).unwrap();
        }
        let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        assert!(writer.current_size() > 0);
        writer.append(b"b", b"2", RecordKind::Put, false).unwrap();
        drop(writer);

        assert_eq!(WalReader::new(temp.path()).recover().unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let temp = TempDir::new().unwrap();
        let path = {
            let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
            writer.append(b"a", b"1", RecordKind::Put, false).unwrap();
            writer.current_path().to_path_buf()
        };
        let intact = std::fs::metadata(&path).unwrap().len();

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&MAGIC_ARRAY);
        data.extend_from_slice(&[0x40, 0x00]);
        std::fs::write(&path, data).unwrap();

        let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        assert_eq!(writer.current_size(), intact);
        writer.append(b"b", b"2", RecordKind::Put, false).unwrap();
        drop(writer);

        let records = WalReader::new(temp.path()).recover().unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[test]
    fn test_corrupt_length_mid_segment_keeps_later_records() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        writer.append(b"a", b"1", RecordKind::Put, false).unwrap();
        let second = writer.current_size() as usize;
        writer.append(b"b", b"2", RecordKind::Put, false).unwrap();
        writer.append(b"c", b"3", RecordKind::Put, false).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        // High byte of the second record's length: now runs far past EOF
        let mut data = std::fs::read(&path).unwrap();
        let size = data.len() as u64;
        data[second + 7] = 0x7f;
        std::fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover().unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"c".as_slice()]);

        let writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
        assert_eq!(writer.current_size(), size, "intact records must not be truncated");
    }

    #[test]
    fn test_replay_streams_records_and_tail() {
        let temp = TempDir::new().unwrap();
        {
            let mut writer = WalWriter::open(temp.path(), ROTATE_LARGE).unwrap();
            writer.append(b"a", b"1", RecordKind::Put, false).unwrap();
            writer.append(b"a", b"", RecordKind::Delete, false).unwrap();
        }

        let mut kinds = Vec::new();
        let replay = WalReader::new(temp.path()).replay(|r| kinds.push(r.kind)).unwrap();
        assert_eq!(replay.records, 2);
        assert_eq!(kinds, vec![RecordKind::Put, RecordKind::Delete]);

        let mut writer = WalWriter::after_replay(temp.path(), ROTATE_LARGE, &replay).unwrap();
        assert!(writer.current_size() > 0);
        writer.append(b"b", b"2", RecordKind::Put, false).unwrap();
        drop(writer);
        assert_eq!(WalReader::new(temp.path()).recover().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_directory_recovers_nothing() {
        let temp = TempDir::new().unwrap();
        let records = WalReader::new(temp.path().join("absent")).recover().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_segment_naming() {
        assert_eq!(segment_name(0x2a), "wal-000000000000002a.log");
        assert_eq!(parse_segment_name("wal-000000000000002a.log"), Some(0x2a));
        assert_eq!(parse_segment_name("wal-xyz.log"), None);
        assert_eq!(parse_segment_name("data-0000.log"), None);
    }
}
