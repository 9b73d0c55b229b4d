//! Export a live store into per-model snapshot files.

use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;
use crate::store::{Store, scan_keys};

use super::{Record, SnapshotWriter, snapshot_path};

/// Summary of an export run.
#[derive(Debug, Default, Clone)]
pub struct ExportReport {
    /// Lines written per source prefix.
    pub written: BTreeMap<String, u64>,
    /// Keys that vanished between scan and dump.
    pub vanished: u64,
    pub warnings: Vec<String>,
}

impl ExportReport {
    pub fn total(&self) -> u64 {
        self.written.values().sum()
    }
}

/// Dump every key under each prefix into `{dir}/{prefix}.jsonl`.
pub fn export_store(store: &dyn Store, prefixes: &[&str], dir: &Path) -> Result<ExportReport> {
    let mut report = ExportReport::default();
    for prefix in prefixes {
        let path = snapshot_path(dir, prefix);
        let mut writer = SnapshotWriter::create(&path)?;
        let pattern = format!("{prefix}:*");
        for key in scan_keys(store, &pattern) {
            let key = key?;
            let (Some(value_type), Some(blob)) = (store.key_type(&key)?, store.dump(&key)?) else {
                report.vanished += 1;
                report
                    .warnings
                    .push(format!("key `{key}` disappeared during export"));
                continue;
            };
            let ttl_ms = store.pttl(&key)?;
            writer.write(&Record::dumped(key, value_type, ttl_ms, blob))?;
        }
        let lines = writer.finish()?;
        tracing::info!(prefix, lines, path = %path.display(), "exported snapshot");
        report.written.insert(prefix.to_string(), lines);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotReader;
    use crate::store::{FieldMap, MemoryStore};

    #[test]
    fn export_writes_one_file_per_prefix() {
        let store = MemoryStore::new();
        let mut fields = FieldMap::new();
        fields.insert("email".into(), "alice@example.com".into());
        store
            .hset("customer:alice@example.com:object", &fields)
            .expect("hset");
        store.sadd("customer:values", "alice@example.com").expect("sadd");
        store.set_string("secret:abc:object", "opaque").expect("set");
        store.pexpire("secret:abc:object", 60_000).expect("expire");
        store.set_string("unrelated", "x").expect("set");

        let dir = tempfile::tempdir().expect("tempdir");
        let report = export_store(&store, &["customer", "secret"], dir.path()).expect("export");
        assert_eq!(report.written["customer"], 2);
        assert_eq!(report.written["secret"], 1);
        assert_eq!(report.total(), 3);

        let secret = SnapshotReader::open(&snapshot_path(dir.path(), "secret"))
            .expect("open")
            .next()
            .expect("line")
            .expect("parse");
        assert!(secret.record.ttl_ms.is_some());
    }
}
