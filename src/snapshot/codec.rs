//! Line-delimited snapshot files.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{CodecError, Record};

/// A decoded line plus the exact text it came from.
#[derive(Clone, Debug)]
pub struct SnapshotLine {
    pub line_no: usize,
    pub raw: String,
    pub record: Record,
}

/// Streaming reader. Yields one item per non-blank line; decode failures are
/// per-line [`CodecError::Parse`] items the caller counts and skips.
pub struct SnapshotReader {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: usize,
    buf: Vec<u8>,
    failed: bool,
}

impl SnapshotReader {
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        let file = File::open(path).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line_no: 0,
            buf: Vec::new(),
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for SnapshotReader {
    type Item = Result<SnapshotLine, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            self.buf.clear();
            let read = match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(read) => read,
                Err(source) => {
                    self.failed = true;
                    return Some(Err(CodecError::Io {
                        path: self.path.clone(),
                        source,
                    }));
                }
            };
            if read == 0 {
                return None;
            }
            self.line_no += 1;
            let line_no = self.line_no;
            let raw = match std::str::from_utf8(&self.buf) {
                Ok(text) => text.trim_end_matches(['\n', '\r']).to_string(),
                Err(err) => {
                    return Some(Err(CodecError::Parse {
                        line_no,
                        reason: format!("line is not valid utf-8: {err}"),
                        raw: String::from_utf8_lossy(&self.buf)
                            .trim_end_matches(['\n', '\r'])
                            .to_string(),
                    }));
                }
            };
            if raw.trim().is_empty() {
                continue;
            }
            return Some(Record::from_line(line_no, &raw).map(|record| SnapshotLine {
                line_no,
                raw,
                record,
            }));
        }
    }
}

/// Append-only writer. Each line goes out in a single `write_all` so a crash
/// leaves only whole lines behind.
pub struct SnapshotWriter {
    path: PathBuf,
    file: File,
    lines: u64,
}

impl SnapshotWriter {
    /// Create or truncate `path`.
    pub fn create(path: &Path) -> Result<Self, CodecError> {
        Self::open_with(path, OpenOptions::new().write(true).create(true).truncate(true))
    }

    /// Open `path` for appending, creating it if needed.
    pub fn append(path: &Path) -> Result<Self, CodecError> {
        Self::open_with(path, OpenOptions::new().append(true).create(true))
    }

    fn open_with(path: &Path, options: &OpenOptions) -> Result<Self, CodecError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CodecError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = options.open(path).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            lines: 0,
        })
    }

    pub fn write(&mut self, record: &Record) -> Result<(), CodecError> {
        let line = record.to_line()?;
        self.write_raw(&line)
    }

    /// Write `raw` unchanged as one line.
    pub fn write_raw(&mut self, raw: &str) -> Result<(), CodecError> {
        let mut line = Vec::with_capacity(raw.len() + 1);
        line.extend_from_slice(raw.as_bytes());
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|source| CodecError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn finish(self) -> Result<u64, CodecError> {
        self.file.sync_all().map_err(|source| CodecError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DumpBlob, FieldMap, StoredValue, ValueType};

    fn hash_record(key: &str) -> Record {
        let mut fields = FieldMap::new();
        fields.insert("email".into(), "alice@example.com".into());
        let blob = DumpBlob::encode(&StoredValue::Hash(fields)).expect("encode");
        Record::dumped(key, ValueType::Hash, None, blob)
    }

    #[test]
    fn corrupt_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("customer.jsonl");
        let mut writer = SnapshotWriter::create(&path).expect("create");
        writer.write(&hash_record("customer:a:object")).expect("write");
        writer.write_raw("{not json").expect("write");
        writer.write_raw("").expect("write");
        writer.write(&hash_record("customer:b:object")).expect("write");
        assert_eq!(writer.finish().expect("finish"), 4);

        let items: Vec<_> = SnapshotReader::open(&path).expect("open").collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(CodecError::Parse { line_no: 2, .. })));
        let last = items[2].as_ref().expect("third record");
        assert_eq!(last.line_no, 4);
        assert_eq!(last.record.key, "customer:b:object");
    }

    #[test]
    fn torn_final_line_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret.jsonl");
        let line = hash_record("secret:x:object").to_line().expect("line");
        let torn = &line[..line.len() / 2];
        std::fs::write(&path, format!("{line}\n{torn}")).expect("write");

        let items: Vec<_> = SnapshotReader::open(&path).expect("open").collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(CodecError::Parse { line_no: 2, .. })));
    }

    #[test]
    fn raw_line_is_kept_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("customer.jsonl");
        let line = hash_record("customer:a:object").to_line().expect("line");
        std::fs::write(&path, format!("{line}\r\n")).expect("write");
        let item = SnapshotReader::open(&path)
            .expect("open")
            .next()
            .expect("one line")
            .expect("parses");
        assert_eq!(item.raw, line);
    }
}
