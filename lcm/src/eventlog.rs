//! Reading and writing of LCM event log files.
//!
//! An event log is a flat file of framed events, each carrying an ordinal,
//! a microsecond timestamp, a channel name, and an opaque payload. The
//! format is the one produced by the standard LCM logging tools, so logs
//! written here can be played back elsewhere and vice versa.
//!
//! Every frame starts with a sync word, which lets the reader recover from
//! truncated or partially overwritten files by scanning forward to the next
//! intact event.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use error::LogError;

/// Marks the start of every event frame.
const SYNC_WORD: u32 = 0xEDA1_DA01;

/// Sanity bound on the channel length field. Real channel names are at most
/// 63 bytes; anything in this neighborhood means we are not looking at an
/// event header.
const MAX_CHANNEL_LENGTH: i32 = 1000;

/// Returns `Ok(None)` if the expression hits end-of-file mid-frame.
macro_rules! try_or_eof {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(LogError::from(err)),
        }
    };
}

/// A single entry in an event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Position of the event in the log it was read from.
    pub event_num: i64,
    /// Microsecond timestamp recorded with the event.
    pub timestamp: i64,
    /// The channel the payload was published on.
    pub channel: String,
    /// The message payload.
    pub data: Vec<u8>,
}

/// How an event log file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Read an existing log.
    Read,
    /// Create (or truncate) a log for writing.
    Write,
    /// Create (or truncate) a log and keep it readable.
    ReadWrite,
    /// Append events to an existing log.
    Append,
}

/// An event log open on disk.
///
/// A single file handle is shared between the read and the write position.
/// The handle tracks which position it currently sits at and the saved read
/// offset is used to flip between them on demand, so interleaved reads and
/// writes behave as if each had its own cursor.
pub struct EventLog {
    file: File,
    /// True while the file handle sits at the read position.
    at_read_pos: bool,
    read_pos: u64,
    /// Source of the ordinals assigned to written events.
    write_event_count: i64,
}

impl EventLog {
    /// Opens the log file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, mode: LogMode) -> Result<EventLog, LogError> {
        let mut options = OpenOptions::new();
        let options = match mode {
            LogMode::Read => options.read(true),
            LogMode::Write => options.write(true).create(true).truncate(true),
            LogMode::ReadWrite => options.read(true).write(true).create(true).truncate(true),
            LogMode::Append => options.append(true).create(true),
        };
        let file = options.open(path)?;

        Ok(EventLog {
            file,
            // Start at the read position. If we write first, the read
            // position will get saved.
            at_read_pos: true,
            read_pos: 0,
            write_event_count: 0,
        })
    }

    /// Reads the next event from the log.
    ///
    /// Scans forward to the next sync word first, so a log with a damaged
    /// region yields the events that survive it. Returns `None` at
    /// end-of-file, including when the file ends in a partial event.
    pub fn read_next_event(&mut self) -> Result<Option<Event>, LogError> {
        if !self.at_read_pos {
            self.file.seek(SeekFrom::Start(self.read_pos))?;
            self.at_read_pos = true;
        }

        if !self.scan_to_sync()? {
            return Ok(None);
        }

        let event_num = try_or_eof!(self.file.read_i64::<BigEndian>());
        let timestamp = try_or_eof!(self.file.read_i64::<BigEndian>());
        let channel_len = try_or_eof!(self.file.read_i32::<BigEndian>());
        let data_len = try_or_eof!(self.file.read_i32::<BigEndian>());

        if channel_len < 0 || channel_len >= MAX_CHANNEL_LENGTH {
            return Err(LogError::Corrupt("channel length out of range"));
        }
        if data_len < 0 {
            return Err(LogError::Corrupt("negative payload length"));
        }

        let mut channel = vec![0u8; channel_len as usize];
        try_or_eof!(self.file.read_exact(&mut channel));
        let channel = String::from_utf8(channel)?;

        let mut data = vec![0u8; data_len as usize];
        try_or_eof!(self.file.read_exact(&mut data));

        Ok(Some(Event {
            event_num,
            timestamp,
            channel,
            data,
        }))
    }

    /// Appends an event to the log and returns the ordinal it was assigned.
    ///
    /// Ordinals come from a per-writer counter, not from the file, and are
    /// strictly increasing for the life of this `EventLog`.
    pub fn write_event(
        &mut self,
        timestamp: i64,
        channel: &str,
        data: &[u8],
    ) -> Result<i64, LogError> {
        if self.at_read_pos {
            self.read_pos = self.file.seek(SeekFrom::Current(0))?;
            self.at_read_pos = false;
            self.file.seek(SeekFrom::End(0))?;
        }

        let event_num = self.write_event_count;

        self.file.write_u32::<BigEndian>(SYNC_WORD)?;
        self.file.write_i64::<BigEndian>(event_num)?;
        self.file.write_i64::<BigEndian>(timestamp)?;
        self.file.write_i32::<BigEndian>(channel.len() as i32)?;
        self.file.write_i32::<BigEndian>(data.len() as i32)?;
        self.file.write_all(channel.as_bytes())?;
        self.file.write_all(data)?;

        self.write_event_count += 1;
        Ok(event_num)
    }

    /// Flushes buffered writes to disk.
    pub fn flush(&mut self) -> Result<(), LogError> {
        self.file.flush()?;
        Ok(())
    }

    /// Positions the read cursor near the first event at or after
    /// `timestamp`.
    ///
    /// The seek is approximate: it bisects over file offsets and stops when
    /// the bracket collapses, so the next event read is only guaranteed to
    /// be in the neighborhood of the target. `timestamp <= 0` rewinds to
    /// the start of the log directly, since the bisection misbehaves at the
    /// very beginning of a file.
    pub fn seek_to_timestamp(&mut self, timestamp: i64) -> Result<(), LogError> {
        if timestamp <= 0 {
            self.file.seek(SeekFrom::Start(0))?;
            self.at_read_pos = true;
            return Ok(());
        }

        let file_len = self.file.seek(SeekFrom::End(0))? as f64;
        self.at_read_pos = true;

        let mut frac1 = 0.0; // left bracket
        let mut frac2 = 1.0; // right bracket
        let mut prev_frac = -1.0;

        loop {
            let frac = 0.5 * (frac1 + frac2);
            let offset = (frac * file_len) as u64;
            self.file.seek(SeekFrom::Start(offset))?;

            let cur_time = match self.peek_event_time()? {
                Some(t) => t,
                None => return Err(LogError::Corrupt("no event found while seeking")),
            };

            let frac = self.file.seek(SeekFrom::Current(0))? as f64 / file_len;
            if frac > frac2 || frac < frac1 || frac1 >= frac2 {
                break;
            }

            if (frac - prev_frac).abs() < 1e-12 {
                break;
            }

            if cur_time == timestamp {
                break;
            }

            if cur_time < timestamp {
                frac1 = frac;
            } else {
                frac2 = frac;
            }
            prev_frac = frac;
        }

        Ok(())
    }

    /// Scans to the next event and reads its timestamp, then rewinds so the
    /// next read returns that same event.
    fn peek_event_time(&mut self) -> Result<Option<i64>, LogError> {
        if !self.scan_to_sync()? {
            return Ok(None);
        }
        let _event_num = try_or_eof!(self.file.read_i64::<BigEndian>());
        let timestamp = try_or_eof!(self.file.read_i64::<BigEndian>());
        self.file.seek(SeekFrom::Current(-20))?;
        Ok(Some(timestamp))
    }

    /// Advances the file byte by byte until the sync word has been read.
    ///
    /// Returns `false` at end-of-file.
    fn scan_to_sync(&mut self) -> Result<bool, io::Error> {
        let mut word = 0u32;
        let mut byte = [0u8; 1];
        loop {
            if self.file.read(&mut byte)? == 0 {
                return Ok(false);
            }
            word = (word << 8) | u32::from(byte[0]);
            if word == SYNC_WORD {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod test {
    extern crate tempdir;

    use super::*;

    fn scratch_log(name: &str) -> (tempdir::TempDir, ::std::path::PathBuf) {
        let dir = tempdir::TempDir::new("eventlog").unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn round_trip() {
        let (_dir, path) = scratch_log("roundtrip.lcmlog");

        {
            let mut log = EventLog::create(&path, LogMode::Write).unwrap();
            assert_eq!(log.write_event(100, "FOO", b"hello").unwrap(), 0);
            assert_eq!(log.write_event(200, "BAR", &[0u8, 1, 2, 255]).unwrap(), 1);
        }

        let mut log = EventLog::create(&path, LogMode::Read).unwrap();
        let first = log.read_next_event().unwrap().unwrap();
        assert_eq!(first.event_num, 0);
        assert_eq!(first.timestamp, 100);
        assert_eq!(first.channel, "FOO");
        assert_eq!(first.data, b"hello");

        let second = log.read_next_event().unwrap().unwrap();
        assert_eq!(second.event_num, 1);
        assert_eq!(second.channel, "BAR");
        assert_eq!(second.data, &[0u8, 1, 2, 255]);

        assert!(log.read_next_event().unwrap().is_none());
    }

    #[test]
    fn interleaved_read_and_write() {
        let (_dir, path) = scratch_log("interleaved.lcmlog");
        let mut log = EventLog::create(&path, LogMode::ReadWrite).unwrap();

        log.write_event(1, "A", b"a").unwrap();
        log.write_event(2, "B", b"b").unwrap();

        // The read position was saved before the first write, so reading
        // starts from the beginning of the file.
        let first = log.read_next_event().unwrap().unwrap();
        assert_eq!(first.channel, "A");

        // Another write must not disturb the read position.
        log.write_event(3, "C", b"c").unwrap();
        let second = log.read_next_event().unwrap().unwrap();
        assert_eq!(second.channel, "B");
        let third = log.read_next_event().unwrap().unwrap();
        assert_eq!(third.channel, "C");
    }

    #[test]
    fn resyncs_after_garbage() {
        let (_dir, path) = scratch_log("garbage.lcmlog");

        {
            let mut file = File::create(&path).unwrap();
            file.write_all(b"this is not an event log frame").unwrap();
        }
        {
            let mut log = EventLog::create(&path, LogMode::Append).unwrap();
            log.write_event(42, "SURVIVOR", b"payload").unwrap();
        }

        let mut log = EventLog::create(&path, LogMode::Read).unwrap();
        let event = log.read_next_event().unwrap().unwrap();
        assert_eq!(event.channel, "SURVIVOR");
        assert_eq!(event.timestamp, 42);
    }

    #[test]
    fn truncated_tail_is_eof() {
        let (_dir, path) = scratch_log("truncated.lcmlog");

        {
            let mut log = EventLog::create(&path, LogMode::Write).unwrap();
            log.write_event(1, "WHOLE", b"intact").unwrap();
        }
        {
            // Chop the second event off mid-header.
            let mut log = EventLog::create(&path, LogMode::Append).unwrap();
            log.write_event(2, "PARTIAL", b"lost").unwrap();
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 30).unwrap();
        }

        let mut log = EventLog::create(&path, LogMode::Read).unwrap();
        let event = log.read_next_event().unwrap().unwrap();
        assert_eq!(event.channel, "WHOLE");
        assert!(log.read_next_event().unwrap().is_none());
    }

    #[test]
    fn seek_to_timestamp_is_approximately_right() {
        let (_dir, path) = scratch_log("seek.lcmlog");

        {
            let mut log = EventLog::create(&path, LogMode::Write).unwrap();
            for ts in &[1000i64, 2000, 3000, 4000, 5000] {
                // Padding keeps the events far enough apart that the
                // bisection has offsets to work with.
                log.write_event(*ts, "TICK", &[0u8; 256]).unwrap();
            }
        }

        let mut log = EventLog::create(&path, LogMode::Read).unwrap();
        log.seek_to_timestamp(3500).unwrap();
        let event = log.read_next_event().unwrap().unwrap();
        assert!(
            event.timestamp == 3000 || event.timestamp == 4000,
            "landed on {}",
            event.timestamp
        );

        log.seek_to_timestamp(0).unwrap();
        let event = log.read_next_event().unwrap().unwrap();
        assert_eq!(event.timestamp, 1000);
    }

    #[test]
    fn ordinals_increase_per_writer() {
        let (_dir, path) = scratch_log("ordinals.lcmlog");

        let mut log = EventLog::create(&path, LogMode::Write).unwrap();
        for i in 0..5 {
            assert_eq!(log.write_event(i * 10, "N", b"x").unwrap(), i);
        }
    }
}
