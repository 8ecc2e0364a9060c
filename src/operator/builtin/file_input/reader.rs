use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fingerprint::Fingerprint;

/// Character encoding of the tailed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LogEncoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "ascii")]
    Ascii,
    #[serde(rename = "latin-1", alias = "latin1")]
    Latin1,
}

impl LogEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String, String> {
        match self {
            LogEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(|s| s.to_string())
                .map_err(|e| format!("invalid utf-8: {}", e)),
            LogEncoding::Ascii => {
                if let Some(byte) = bytes.iter().find(|b| !b.is_ascii()) {
                    return Err(format!("invalid ascii byte 0x{:02x}", byte));
                }
                // All bytes ASCII, so this cannot fail
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
            LogEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// Knobs that shape how records are read and decoded
#[derive(Debug, Clone)]
pub struct ReadSettings {
    pub fingerprint_bytes: usize,
    pub max_log_size: usize,
    pub encoding: LogEncoding,
}

/// The decoded body of one pending record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Text(String),
    Undecodable { error: String, raw: Vec<u8> },
}

/// One record read from a file, not yet emitted. The reader's offset is
/// advanced to `end_offset` only after the record has been handed to the
/// downstream queue.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub body: RecordBody,
    pub end_offset: u64,
    pub truncated: bool,
}

/// Persisted form of a FileReader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderRecord {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub mtime: i64,
}

/// Per-file tailing state: the path, the content fingerprint that survives
/// renames, the confirmed read offset, and the last observed modification
/// time.
#[derive(Debug)]
pub struct FileReader {
    path: PathBuf,
    fingerprint: Fingerprint,
    offset: u64,
    mtime: i64,
}

impl FileReader {
    /// Create a reader for a newly discovered file, fingerprinting it and
    /// positioning at the beginning or the current end.
    pub fn create(path: PathBuf, fingerprint_bytes: usize, start_at_end: bool) -> io::Result<Self> {
        let mut file = File::open(&path)?;
        let meta = file.metadata()?;
        let fingerprint = Fingerprint::read(&mut file, fingerprint_bytes)?;
        let offset = if start_at_end { meta.len() } else { 0 };

        Ok(Self {
            path,
            fingerprint,
            offset,
            mtime: mtime_seconds(&meta),
        })
    }

    pub fn from_record(record: ReaderRecord) -> Self {
        Self {
            path: record.path,
            fingerprint: record.fingerprint,
            offset: record.offset,
            mtime: record.mtime,
        }
    }

    pub fn record(&self) -> ReaderRecord {
        ReaderRecord {
            path: self.path.clone(),
            fingerprint: self.fingerprint.clone(),
            offset: self.offset,
            mtime: self.mtime,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reassign the path after a detected rename; all other state survives
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Confirm that everything up to `offset` has been handed downstream
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Read all complete records past the current offset.
    ///
    /// Detects truncation (file shrank below the offset) and
    /// replace-in-place (fingerprint no longer matches at the same path);
    /// both reset the offset to zero before reading.
    pub fn read_records(&mut self, settings: &ReadSettings) -> io::Result<Vec<PendingRecord>> {
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let size = meta.len();
        self.mtime = mtime_seconds(&meta);

        if size < self.offset {
            debug!(path = %self.path.display(), "file size decreased, resetting offset");
            self.offset = 0;
            self.fingerprint = Fingerprint::read(&mut file, settings.fingerprint_bytes)?;
        } else {
            let current = Fingerprint::read(&mut file, settings.fingerprint_bytes)?;
            if self.fingerprint.is_empty() || current.is_empty() {
                self.fingerprint = current;
            } else if current.matches(&self.fingerprint) {
                // Same file, possibly grown since the fingerprint was taken
                self.fingerprint = current;
            } else {
                debug!(
                    path = %self.path.display(),
                    "fingerprint mismatch, treating file as replaced"
                );
                self.offset = 0;
                self.fingerprint = current;
            }
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut pos = self.offset;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            pos += n as u64;

            let mut line: &[u8] = &buf;
            if line.ends_with(b"\n") {
                line = &line[..line.len() - 1];
            }
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }

            let truncated = line.len() > settings.max_log_size;
            let slice = if truncated {
                &line[..settings.max_log_size]
            } else {
                line
            };

            let body = match settings.encoding.decode(slice) {
                Ok(text) => RecordBody::Text(text),
                Err(error) => RecordBody::Undecodable {
                    error,
                    raw: slice.to_vec(),
                },
            };

            records.push(PendingRecord {
                body,
                end_offset: pos,
                truncated,
            });
        }

        Ok(records)
    }
}

fn mtime_seconds(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn settings() -> ReadSettings {
        ReadSettings {
            fingerprint_bytes: 1000,
            max_log_size: 1024,
            encoding: LogEncoding::Utf8,
        }
    }

    fn text_records(records: &[PendingRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| match &r.body {
                RecordBody::Text(t) => t.clone(),
                RecordBody::Undecodable { error, .. } => panic!("undecodable: {}", error),
            })
            .collect()
    }

    #[test]
    fn test_read_from_beginning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "a\nb\nc\n").unwrap();

        let mut reader = FileReader::create(path, 1000, false).unwrap();
        let records = reader.read_records(&settings()).unwrap();
        assert_eq!(text_records(&records), vec!["a", "b", "c"]);

        // Offsets advance only as the caller confirms them
        assert_eq!(reader.offset(), 0);
        reader.set_offset(records.last().unwrap().end_offset);
        assert_eq!(reader.offset(), 6);
    }

    #[test]
    fn test_start_at_end_skips_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "old\n").unwrap();

        let mut reader = FileReader::create(path.clone(), 1000, true).unwrap();
        assert!(reader.read_records(&settings()).unwrap().is_empty());

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "new").unwrap();

        let records = reader.read_records(&settings()).unwrap();
        assert_eq!(text_records(&records), vec!["new"]);
    }

    #[test]
    fn test_incremental_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "one\n").unwrap();

        let mut reader = FileReader::create(path.clone(), 1000, false).unwrap();
        let records = reader.read_records(&settings()).unwrap();
        assert_eq!(text_records(&records), vec!["one"]);
        reader.set_offset(records.last().unwrap().end_offset);

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "two").unwrap();

        let records = reader.read_records(&settings()).unwrap();
        assert_eq!(text_records(&records), vec!["two"]);
    }

    #[test]
    fn test_truncation_resets_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "p\nq\n").unwrap();

        let mut reader = FileReader::create(path.clone(), 1000, false).unwrap();
        let records = reader.read_records(&settings()).unwrap();
        reader.set_offset(records.last().unwrap().end_offset);

        fs::write(&path, "r\n").unwrap();

        let records = reader.read_records(&settings()).unwrap();
        assert_eq!(text_records(&records), vec!["r"]);
    }

    #[test]
    fn test_replace_in_place_resets_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "aaaa\n").unwrap();

        let mut reader = FileReader::create(path.clone(), 1000, false).unwrap();
        let records = reader.read_records(&settings()).unwrap();
        reader.set_offset(records.last().unwrap().end_offset);

        // Same length, different content: size check alone cannot see this
        fs::write(&path, "bbbb\n").unwrap();

        let records = reader.read_records(&settings()).unwrap();
        assert_eq!(text_records(&records), vec!["bbbb"]);
    }

    #[test]
    fn test_oversize_record_truncated_and_flagged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        let long = "x".repeat(64);
        fs::write(&path, format!("{}\nshort\n", long)).unwrap();

        let mut reader = FileReader::create(path, 1000, false).unwrap();
        let small = ReadSettings {
            max_log_size: 10,
            ..settings()
        };
        let records = reader.read_records(&small).unwrap();

        assert_eq!(records.len(), 2);
        assert!(records[0].truncated);
        assert_eq!(records[0].body, RecordBody::Text("x".repeat(10)));
        assert!(!records[1].truncated);
    }

    #[test]
    fn test_undecodable_bytes_are_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, [0xff, 0xfe, b'\n', b'o', b'k', b'\n']).unwrap();

        let mut reader = FileReader::create(path, 1000, false).unwrap();
        let records = reader.read_records(&settings()).unwrap();

        assert_eq!(records.len(), 2);
        match &records[0].body {
            RecordBody::Undecodable { raw, .. } => assert_eq!(raw, &vec![0xff, 0xfe]),
            other => panic!("expected undecodable record, got {:?}", other),
        }
        assert_eq!(records[1].body, RecordBody::Text("ok".to_string()));
    }

    #[test]
    fn test_latin1_decoding() {
        assert_eq!(
            LogEncoding::Latin1.decode(&[b'a', 0xe9, b'b']).unwrap(),
            "a\u{e9}b"
        );
    }

    #[test]
    fn test_ascii_rejects_high_bytes() {
        assert!(LogEncoding::Ascii.decode(&[b'a', 0x80]).is_err());
        assert_eq!(LogEncoding::Ascii.decode(b"plain").unwrap(), "plain");
    }

    #[test]
    fn test_record_round_trip() {
        let record = ReaderRecord {
            path: PathBuf::from("/var/log/app.log"),
            fingerprint: Fingerprint::from_bytes(b"head".to_vec()),
            offset: 123,
            mtime: 456,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: ReaderRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_tolerates_unknown_fields() {
        let json = r#"{"path":"/p","fingerprint":[1,2],"offset":9,"mtime":0,"future_field":true}"#;
        let record: ReaderRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.offset, 9);
    }
}
