//! Runs the `keyshift` binary against sqlite stores in a temp dir.

use std::path::Path;

use assert_cmd::Command;
use keyshift::store::{SqliteStore, Store};
use predicates::prelude::*;
use tempfile::TempDir;

use crate::fixtures::fields;

fn keyshift(home: &Path) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("keyshift");
    cmd.current_dir(home);
    cmd.env("KEYSHIFT_CONFIG_DIR", home.join("config"));
    cmd.env("KEYSHIFT_DATA_DIR", home.join("data"));
    cmd.env_remove("KEYSHIFT_LOG");
    cmd
}

fn seed_v1(path: &Path) {
    let store = SqliteStore::open(path).expect("open v1 store");
    store
        .hset(
            "customer:alice@example.com:object",
            &fields(&[
                ("custid", "alice@example.com"),
                ("email", "alice@example.com"),
                ("created", "1700000000"),
            ]),
        )
        .expect("seed customer");
    store
        .hset(
            "secret:s1:object",
            &fields(&[
                ("key", "s1"),
                ("custid", "alice@example.com"),
                ("state", "new"),
                ("created", "1700000100"),
            ]),
        )
        .expect("seed secret");
}

#[test]
fn export_run_status_round_trip() {
    let home = TempDir::new().expect("tempdir");
    let v1 = home.path().join("v1.sqlite");
    let v2 = home.path().join("v2.sqlite");
    seed_v1(&v1);

    keyshift(home.path())
        .args(["export", "--source"])
        .arg(&v1)
        .args(["--output", "snapshot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("customer: 1 line(s)"));

    keyshift(home.path())
        .args(["run", "--input", "snapshot", "--output", "out", "--store"])
        .arg(&v2)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"validate_post\""));

    let target = SqliteStore::open(&v2).expect("open v2 store");
    let instances = target
        .zrange_with_scores("customer:instances")
        .expect("instances");
    assert_eq!(instances.len(), 1);
    assert_eq!(
        target
            .zrange_with_scores("secret:instances")
            .expect("secret instances")
            .len(),
        1
    );

    keyshift(home.path())
        .args(["status", "--output", "out"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rebuild_index"))
        .stdout(predicate::str::contains("pending").not());
}

#[test]
fn stage_without_its_prerequisite_exits_with_precondition_code() {
    let home = TempDir::new().expect("tempdir");
    keyshift(home.path())
        .args(["run", "--stage", "load", "--output", "fresh", "--store"])
        .arg(home.path().join("v2.sqlite"))
        .assert()
        .code(3)
        .stderr(predicate::str::contains("cannot run load"));
}

#[test]
fn sweep_removes_only_scratch_keys() {
    let home = TempDir::new().expect("tempdir");
    let db = home.path().join("store.sqlite");
    {
        let store = SqliteStore::open(&db).expect("open");
        store
            .set_string("_keyshift_scratch:secret.1:0", "left over")
            .expect("seed scratch");
        store.set_string("customer:keep", "x").expect("seed");
    }

    keyshift(home.path())
        .args(["sweep", "--store"])
        .arg(&db)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\": 1"));

    let store = SqliteStore::open(&db).expect("reopen");
    assert!(store.exists("customer:keep").expect("exists"));
    assert!(!store.exists("_keyshift_scratch:secret.1:0").expect("exists"));
}

#[test]
fn status_without_a_run_fails() {
    let home = TempDir::new().expect("tempdir");
    keyshift(home.path())
        .args(["status", "--output", "nowhere"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("no run recorded"));
}
