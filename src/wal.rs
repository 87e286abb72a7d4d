use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Records larger than this are treated as corruption rather than allocated.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Why a scan stopped before the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    Truncated,
    Corrupt,
}

/// `Ok(None)` at clean EOF; `Err(tail)` when the record cannot be trusted.
fn read_record(reader: &mut impl Read) -> io::Result<Result<Option<(Event, u64)>, Tail>> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Ok(None)),
        4 => {}
        _ => return Ok(Err(Tail::Truncated)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Err(Tail::Corrupt));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? != len {
        return Ok(Err(Tail::Truncated));
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? != 4 {
        return Ok(Err(Tail::Truncated));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Err(Tail::Corrupt));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Ok(Some((event, (8 + len) as u64)))),
        Err(_) => Ok(Err(Tail::Corrupt)),
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Valid events plus the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64, Tail)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0, Tail::Clean)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    loop {
        match read_record(&mut reader)? {
            Ok(Some((event, size))) => {
                events.push(event);
                valid_len += size;
            }
            Ok(None) => return Ok((events, valid_len, Tail::Clean)),
            Err(tail) => return Ok((events, valid_len, tail)),
        }
    }
}

/// Per-tenant append-only event log.
///
/// Record format: `[u32 le: len][bincode Event][u32 le: crc32(payload)]`.
/// A torn or corrupt tail ends replay; `recover` cuts it off so later
/// appends stay readable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every valid event in order. Stops at the first torn or corrupt record.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _, _)| events)
    }

    /// Replay, then truncate anything after the last valid record.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len, tail) = scan(path)?;
        if tail != Tail::Clean {
            let file = OpenOptions::new().write(true).open(path)?;
            let file_len = file.metadata()?.len();
            tracing::warn!(
                path = %path.display(),
                ?tail,
                kept = events.len(),
                discarded_bytes = file_len.saturating_sub(valid_len),
                "discarding damaged WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn contact_event() -> Event {
        Event::ContactUpserted {
            contact: Contact {
                id: Ulid::new(),
                name: Some("Ana".into()),
                email: Some("ana@example.com".into()),
            },
        }
    }

    fn booking_event(start: Minutes) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                contact_id: Ulid::new(),
                service_id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                span: Span::new(start, start + 30),
                status: BookingStatus::Confirmed,
                reminder_sent: false,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![contact_event(), booking_event(600)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
        assert!(Wal::recover(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn.wal");
        let event = booking_event(540);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&contact_event()).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_oversized_length() {
        let path = tmp_path("oversized.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn recover_truncates_so_new_appends_replay() {
        let path = tmp_path("recover.wal");
        let first = booking_event(540);
        let second = booking_event(600);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 3]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let contact = contact_event();
        let booking = booking_event(600);
        let id = match &booking {
            Event::BookingCreated { booking } => booking.id,
            _ => unreachable!(),
        };
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&contact).unwrap();
            wal.append(&booking).unwrap();
            for status in [BookingStatus::Cancelled, BookingStatus::Confirmed].repeat(10) {
                wal.append(&Event::BookingStatusChanged { id, date, status }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![contact, booking];
        let later = booking_event(720);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let mut expected = compacted;
        expected.push(later);
        assert_eq!(Wal::replay(&path).unwrap(), expected);
    }

    #[test]
    fn buffered_appends_count_toward_compaction() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| booking_event(540 + i * 30)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
