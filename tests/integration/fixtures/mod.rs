//! Shared fixtures: a seeded v1 store and a migration workspace around it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use keyshift::pipeline::{Pipeline, PipelineOptions, RunSummary, Stage};
use keyshift::snapshot::{Record, RunManifest, SnapshotReader, export_store};
use keyshift::store::{FieldMap, MemoryStore, Store, ValueType, scan_keys};
use keyshift::transform::{rejected_path, transformed_path};
use tempfile::TempDir;

/// v1 key prefixes, in plan order.
pub const SOURCES: [&str; 4] = ["customer", "customdomain", "secret", "metadata"];

pub fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A v1 store built up record by record.
pub struct V1Store {
    pub store: MemoryStore,
}

impl Default for V1Store {
    fn default() -> Self {
        Self::new()
    }
}

impl V1Store {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
        }
    }

    fn put(&self, key: &str, pairs: &[(&str, &str)]) -> &Self {
        self.store.hset(key, &fields(pairs)).expect("seed hset");
        self
    }

    /// v1 customers are keyed by email.
    pub fn customer(&self, email: &str, created: &str) -> &Self {
        self.put(
            &format!("customer:{email}:object"),
            &[
                ("custid", email),
                ("email", email),
                ("role", "customer"),
                ("verified", "true"),
                ("secrets_created", "3"),
                ("planid", "basic"),
                ("created", created),
                ("updated", created),
            ],
        );
        self.store
            .zadd("customer:values", created.parse().unwrap_or(0.0), email)
            .expect("seed zadd");
        self
    }

    pub fn anonymous_customer(&self) -> &Self {
        self.put(
            "customer:anon:object",
            &[("custid", "anon"), ("role", "anonymous"), ("created", "1600000000")],
        )
    }

    pub fn secret(&self, key: &str, custid: &str, state: &str, created: &str) -> &Self {
        self.put(
            &format!("secret:{key}:object"),
            &[
                ("key", key),
                ("custid", custid),
                ("state", state),
                ("value", "  s3cr3t\n"),
                ("value_encryption", "2"),
                ("lifespan", "604800"),
                ("created", created),
            ],
        )
    }

    pub fn expiring_secret(&self, key: &str, custid: &str, created: &str, ttl_ms: u64) -> &Self {
        self.secret(key, custid, "new", created);
        self.store
            .pexpire(&format!("secret:{key}:object"), ttl_ms)
            .expect("seed pexpire");
        self
    }

    pub fn receipt(
        &self,
        key: &str,
        custid: &str,
        secret_key: &str,
        state: &str,
        created: &str,
    ) -> &Self {
        self.put(
            &format!("metadata:{key}:object"),
            &[
                ("key", key),
                ("custid", custid),
                ("secret_key", secret_key),
                ("state", state),
                ("created", created),
            ],
        )
    }

    pub fn custom_domain(&self, domainid: &str, custid: &str, display: &str, created: &str) -> &Self {
        self.put(
            &format!("customdomain:{domainid}:object"),
            &[
                ("domainid", domainid),
                ("custid", custid),
                ("display_domain", display),
                ("verified", "false"),
                ("created", created),
            ],
        )
    }

    /// A key no router rewrites or drops.
    pub fn passthrough(&self, key: &str, value: &str) -> &Self {
        self.store.set_string(key, value).expect("seed string");
        self
    }
}

/// Exported snapshot plus a fresh target store and output directory.
pub struct Migration {
    pub dir: TempDir,
    pub target: MemoryStore,
}

impl Migration {
    pub fn exported(v1: &V1Store) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let migration = Self {
            dir,
            target: MemoryStore::new(),
        };
        export_store(&v1.store, &SOURCES, &migration.input()).expect("export v1 snapshot");
        migration
    }

    pub fn input(&self) -> PathBuf {
        self.dir.path().join("snapshot")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn options(&self) -> PipelineOptions {
        PipelineOptions::new(Some(self.input()), self.output())
    }

    pub fn pipeline(&self, options: PipelineOptions) -> Pipeline<'_> {
        Pipeline::new(&self.target, options).expect("standard plan")
    }

    pub fn run(&self) -> RunSummary {
        self.pipeline(self.options()).run_all().expect("pipeline run")
    }

    pub fn manifest(&self) -> RunManifest {
        RunManifest::load(&self.output())
            .expect("read manifest")
            .expect("manifest written")
    }

    pub fn count(&self, stage: Stage, name: &str) -> u64 {
        self.manifest()
            .stage(stage)
            .map(|report| report.count(name))
            .unwrap_or(0)
    }

    /// Every `{model}:*:object` hash in the target store.
    pub fn objects(&self, model: &str) -> Vec<FieldMap> {
        keys(&self.target, &format!("{model}:*:object"))
            .into_iter()
            .map(|key| self.target.hgetall(&key).expect("hgetall"))
            .collect()
    }

    pub fn object_by(&self, model: &str, field: &str, value: &str) -> FieldMap {
        self.objects(model)
            .into_iter()
            .find(|object| object.get(field).map(String::as_str) == Some(value))
            .unwrap_or_else(|| panic!("no {model} with {field} = {value}"))
    }

    pub fn transformed(&self, source: &str) -> Vec<Record> {
        read_records(&transformed_path(&self.output(), source))
    }

    pub fn rejected_lines(&self, source: &str) -> Vec<String> {
        let path = rejected_path(&self.output(), source);
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Index keys and their contents, for comparing two rebuilds.
    pub fn index_state(&self) -> BTreeMap<String, String> {
        let mut state = BTreeMap::new();
        for key in keys(&self.target, "*") {
            if key.ends_with(":object") {
                continue;
            }
            let rendered = match self.target.key_type(&key).expect("type") {
                Some(ValueType::Zset) => {
                    format!("{:?}", self.target.zrange_with_scores(&key).expect("zrange"))
                }
                Some(ValueType::Hash) => {
                    format!("{:?}", self.target.hgetall(&key).expect("hgetall"))
                }
                other => format!("{other:?}"),
            };
            state.insert(key, rendered);
        }
        state
    }
}

pub fn keys(store: &dyn Store, pattern: &str) -> Vec<String> {
    let mut keys = scan_keys(store, pattern)
        .collect::<Result<Vec<_>, _>>()
        .expect("scan");
    keys.sort();
    keys
}

pub fn read_records(path: &std::path::Path) -> Vec<Record> {
    if !path.exists() {
        return Vec::new();
    }
    SnapshotReader::open(path)
        .expect("open snapshot")
        .map(|line| line.expect("valid line").record)
        .collect()
}
