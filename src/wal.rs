use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bytes of framing around each payload: length prefix plus CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one record as `[u32 len][bincode][u32 crc32]`. Returns the frame size.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(u64::from(len) + FRAME_OVERHEAD)
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of replaying a log file.
#[derive(Debug)]
pub struct Replay<E> {
    pub records: Vec<E>,
    /// Bytes after the last valid record were ignored (torn write or corruption).
    pub discarded_tail: bool,
    /// File offset just past the last valid record.
    pub valid_len: u64,
}

/// Append-only write-ahead log of `E` records.
///
/// A torn final record (crash mid-write) is dropped on replay via the length
/// prefix and CRC check, and cut off by [`Wal::recover`] before new appends.
/// A batch that fails to flush is rolled back to the last synced length, so
/// the file only ever holds whole, acknowledged frames.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Length of the file as of the last successful `flush_sync`.
    synced_len: u64,
    pending_bytes: u64,
    pending_appends: u64,
    appends_since_compact: u64,
    _record: PhantomData<fn(E)>,
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            pending_bytes: 0,
            pending_appends: 0,
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Replay the log, truncate any invalid tail, and open it for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Replay<E>)> {
        let replay = Self::replay(path)?;
        if replay.discarded_tail && fs::metadata(path)?.is_file() {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, replay))
    }

    /// Append and fsync a single record. Production code batches with
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, record: &E) -> io::Result<()> {
        self.pending_bytes += encode_record(&mut self.writer, record)?;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// still-buffered bytes and any partial frame that reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact -= self.pending_appends;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (stale_file, _unwritten) = stale.into_parts();
        stale_file.set_len(self.synced_len)?;
        stale_file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write the compacted record set to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, records: &[E]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_bytes = 0;
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[E]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    /// Read every valid record. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Replay<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    records: Vec::new(),
                    discarded_tail: false,
                    valid_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        let discarded_tail = loop {
            let mut len_buf = [0u8; 4];
            let mut lead = [0u8; 1];
            // Distinguish a clean end from a torn length prefix.
            if !read_frame_part(&mut reader, &mut lead)? {
                break false;
            }
            len_buf[0] = lead[0];
            if !read_frame_part(&mut reader, &mut len_buf[1..])? {
                break true;
            }
            let len = u32::from_le_bytes(len_buf);

            let mut payload = vec![0u8; len as usize];
            if !read_frame_part(&mut reader, &mut payload)? {
                break true;
            }
            let mut crc_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut crc_buf)? {
                break true;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break true;
            }
            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break true,
            }
            valid_len += u64::from(len) + FRAME_OVERHEAD;
        };

        Ok(Replay {
            records,
            discarded_tail,
            valid_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseFields, Event, Reservation, SlotKey};
    use chrono::NaiveDate;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("officeno_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn saved(branch: &str, day: u32) -> Event {
        let date = NaiveDate::from_ymd_opt(2024, 9, day).unwrap();
        Event::ReservationSaved {
            reservation: Reservation::draft(SlotKey::new(date, branch)),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            saved("Pune", 10),
            Event::CaseUpdated {
                key: "DVM-PUNE-24-25-001".into(),
                fields: CaseFields::blank(),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, events);
        assert!(!replay.discarded_tail);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = saved("Sangli", 11);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![event]);
        assert!(replay.discarded_tail);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = saved("Pune", 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&saved("Pune", 2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![good]);
        assert!(replay.discarded_tail);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for day in 1..=20 {
                wal.append(&saved("Pune", day)).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![saved("Pune", 20)];
        let after_event = saved("Satara", 21);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&after_event).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should be smaller: {after} < {before}");
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![snapshot[0].clone(), after_event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_become_durable_on_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (1..=5).map(|d| saved("Nashik", d)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap().records, events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = saved("Pune", 10);
        let second = saved("Pune", 11);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        {
            let (mut wal, replay) = Wal::<Event>::recover(&path).unwrap();
            assert!(replay.discarded_tail);
            assert_eq!(replay.valid_len, clean_len);
            assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
            wal.append(&second).unwrap();
        }

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![first, second]);
        assert!(!replay.discarded_tail);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unflushed_batch() {
        let path = tmp_path("rollback.wal");
        let kept = saved("Satara", 1);
        let dropped = saved("Satara", 2);
        let later = saved("Satara", 3);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&dropped).unwrap();
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            wal.append(&later).unwrap();
        }

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![kept, later]);
        assert!(!replay.discarded_tail);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_truncates_partial_frame_on_disk() {
        let path = tmp_path("rollback_partial.wal");
        let kept = saved("Kolhapur", 1);
        let later = saved("Kolhapur", 2);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            // A half-written frame, as left by a failed flush.
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40u8, 0, 0, 0, 7, 7, 7]).unwrap();
            wal.rollback().unwrap();
            wal.append(&later).unwrap();
        }

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![kept, later]);
        assert!(!replay.discarded_tail);
        let _ = fs::remove_file(&path);
    }
}
