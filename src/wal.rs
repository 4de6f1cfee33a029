use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::limits::MAX_WAL_RECORD_BYTES;
use crate::model::{Ms, WeekId, WeekSchedule};

/// One committed week document. The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub week: WeekId,
    pub version: u64,
    pub committed_at: Ms,
    pub schedule: WeekSchedule,
}

fn encode_record(writer: &mut impl Write, record: &CommitRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only log of week commits.
///
/// Format per entry: `[u32: len][bincode: CommitRecord][u32: crc32]`, little endian.
/// A torn or corrupt tail is dropped on replay and truncated on open.
///
/// A failed append or flush poisons the log. The next append first truncates
/// the file back to the last synced length and discards whatever was still
/// buffered, so a rejected record can never reach disk behind a later one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    synced_len: u64,
    pending: u64,
    poisoned: bool,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_next_flush: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Replay `path`, cut any torn tail, and open for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<CommitRecord>)> {
        let (records, valid_len) = Self::scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!("{}: dropping {} bytes of torn WAL tail", path.display(), on_disk - valid_len);
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: valid_len,
            pending: 0,
            poisoned: false,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_flush: false,
        };
        Ok((wal, records))
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &CommitRecord) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer without syncing. Follow a batch with `flush_sync()`.
    pub fn append_buffered(&mut self, record: &CommitRecord) -> io::Result<()> {
        if self.poisoned {
            self.rollback()?;
        }
        if let Err(e) = encode_record(&mut self.writer, record) {
            self.poisoned = true;
            return Err(e);
        }
        self.pending += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL write failed earlier in this batch"));
        }
        match self.sync_buffer() {
            Ok(len) => {
                self.synced_len = len;
                self.appends_since_compact += self.pending;
                self.pending = 0;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn sync_buffer(&mut self) -> io::Result<u64> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_flush) {
            return Err(io::Error::other("injected fsync failure"));
        }
        let file = self.writer.get_ref();
        file.sync_all()?;
        Ok(file.metadata()?.len())
    }

    /// Make the next flush write its bytes and then report failure.
    #[cfg(test)]
    pub(crate) fn inject_flush_failure(&mut self) {
        self.fail_next_flush = true;
    }

    /// Truncate to the last synced length and drop the unflushed buffer.
    fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_, _discarded) = stale.into_parts();
        warn!("{}: rolled WAL back to {} bytes after a write error", self.path.display(), self.synced_len);
        self.pending = 0;
        self.poisoned = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records synced since the last compaction.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write `records` to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, records: &[CommitRecord]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_, _discarded) = stale.into_parts();
        self.pending = 0;
        self.poisoned = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[CommitRecord]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    /// Every intact record in log order.
    pub fn replay(path: &Path) -> io::Result<Vec<CommitRecord>> {
        Self::scan(path).map(|(records, _)| records)
    }

    /// Intact records plus the byte length they cover.
    fn scan(path: &Path) -> io::Result<(Vec<CommitRecord>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_WAL_RECORD_BYTES {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<CommitRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        Ok((records, valid_len))
    }

    /// Highest-version record per week. On a version tie the later record wins.
    pub fn latest_per_week(records: Vec<CommitRecord>) -> HashMap<WeekId, CommitRecord> {
        let mut latest: HashMap<WeekId, CommitRecord> = HashMap::new();
        for record in records {
            match latest.get(&record.week) {
                Some(seen) if seen.version > record.version => {}
                _ => {
                    latest.insert(record.week.clone(), record);
                }
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgrid_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn record(week: u32, version: u64) -> CommitRecord {
        let mut schedule = WeekSchedule::default();
        let entry = CatalogEntry::new("REDES", "5A", "DOCENTE");
        let mut r = Reservation::from_catalog(Ulid::new(), &entry, Day::Tue, version as u32 % 10, &CallerId::new("u"));
        r.updated_at = Some(version as Ms);
        for cell in r.cells() {
            schedule.slots.insert(cell, r.id);
        }
        schedule.reservations.insert(r.id, r);
        CommitRecord {
            week: WeekId::new("lab", week),
            version,
            committed_at: version as Ms,
            schedule,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let records = vec![record(1, 1), record(1, 2)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let first = record(1, 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        {
            let payload = bincode::serialize(&record(2, 1)).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn latest_per_week_keeps_highest_version() {
        let latest = Wal::latest_per_week(vec![record(1, 1), record(2, 1), record(1, 3), record(1, 2)]);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&WeekId::new("lab", 1)].version, 3);
        assert_eq!(latest[&WeekId::new("lab", 2)].version, 1);
    }

    #[test]
    fn latest_per_week_prefers_later_record_on_tie() {
        let first = record(1, 2);
        let second = record(1, 2);
        let latest = Wal::latest_per_week(vec![record(1, 1), first, second.clone()]);
        assert_eq!(latest[&WeekId::new("lab", 1)], second);
    }

    #[test]
    fn failed_flush_is_rolled_back_before_next_append() {
        let path = tmp_path("failed_flush.wal");
        let first = record(4, 1);
        let mut rejected = record(4, 2);
        rejected.committed_at = 111;
        let accepted = record(4, 2);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            let synced = fs::metadata(&path).unwrap().len();

            wal.inject_flush_failure();
            wal.append_buffered(&rejected).unwrap();
            assert!(wal.flush_sync().is_err());
            assert!(fs::metadata(&path).unwrap().len() > synced);
            assert!(wal.flush_sync().is_err());

            wal.append(&accepted).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, accepted]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_truncates_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let first = record(5, 1);
        let second = record(5, 2);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let clean = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1]).unwrap();
        }
        {
            let (mut wal, records) = Wal::recover(&path).unwrap();
            assert_eq!(records, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), clean);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let churn: Vec<_> = (1..=20).map(|v| record(1, v)).collect();
        let after = record(1, 21);
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &churn {
                wal.append(r).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&churn[19..]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&after).unwrap();
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![churn[19].clone(), after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count() {
        let path = tmp_path("buffered.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for v in 1..=5 {
                wal.append_buffered(&record(3, v)).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 5);
        let _ = fs::remove_file(&path);
    }
}
