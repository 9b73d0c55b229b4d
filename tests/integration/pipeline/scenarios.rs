//! End-to-end migrations over small v1 stores.

use keyshift::ident::PrimaryId;
use keyshift::pipeline::{PipelineState, Stage, StageStatus};
use keyshift::store::Store;
use keyshift::validate::{CheckId, CheckStatus, ValidationReport};
use keyshift::{Error, pipeline::PipelineError};

use crate::fixtures::{Migration, V1Store, fields, keys};

fn report(migration: &Migration, name: &str) -> ValidationReport {
    let raw = std::fs::read_to_string(migration.output().join(name)).expect("report file");
    serde_json::from_str(&raw).expect("report json")
}

#[test]
fn alice_becomes_customer_organization_and_owner_membership() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000");
    let migration = Migration::exported(&v1);

    let summary = migration.run();
    assert_eq!(summary.state, PipelineState::Complete, "{:?}", summary.manifest);

    let customer = migration.object_by("customer", "email", "alice@example.com");
    assert!(!customer.contains_key("custid"), "v1 custid leaked: {customer:?}");
    assert_eq!(customer["v1_custid"], "alice@example.com");
    assert_eq!(customer["verified"], "true");
    assert_eq!(customer["migration_status"], "completed");
    assert_eq!(customer["v1_key"], "customer:alice@example.com:object");
    assert!(customer["extid"].starts_with("ur"));

    let objid: PrimaryId = customer["objid"].parse().expect("objid is a primary id");
    assert_eq!(objid.timestamp_ms(), 1_700_000_000_000);

    let organization = migration.object_by("organization", "owner_id", &customer["objid"]);
    assert_eq!(organization["contact_email"], "alice@example.com");
    assert_eq!(organization["is_default"], "true");
    assert!(!organization["owner_id"].contains('@'));

    let membership = migration.object_by("org_membership", "customer_objid", &customer["objid"]);
    assert_eq!(membership["organization_objid"], organization["objid"]);
    assert_eq!(membership["role"], "owner");
    assert_eq!(membership["status"], "active");

    let instances = migration
        .target
        .zrange_with_scores("customer:instances")
        .expect("instances");
    assert_eq!(instances, vec![(customer["objid"].clone(), 1_700_000_000.0)]);
    assert_eq!(
        migration
            .target
            .hget("customer:email_index", "alice@example.com")
            .expect("hget"),
        Some(customer["objid"].clone())
    );
    let members = migration
        .target
        .zrange_with_scores(&format!("organization:{}:members", organization["objid"]))
        .expect("members");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].0, membership["objid"]);

    // v1 index keys never reach the target store.
    assert!(!migration.target.exists("customer:values").expect("exists"));

    let post = report(&migration, "validate_post.json");
    assert!(post.passed(), "{post:?}");
}

#[test]
fn bob_secret_keeps_an_unresolved_placeholder() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .secret("bobsecret", "bob@example.com", "new", "1700000100");
    let migration = Migration::exported(&v1);

    let summary = migration.run();
    assert!(summary.succeeded(), "{:?}", summary.manifest);

    let secret = migration.object_by("secret", "v1_custid", "bob@example.com");
    assert_eq!(secret["owner_id"], "");
    assert_eq!(secret["state"], "new");
    assert_eq!(migration.count(Stage::Transform, "secret.missing_mappings"), 1);

    let transform = migration.manifest().stage(Stage::Transform).cloned().expect("transform");
    let miss = transform
        .errors
        .iter()
        .find(|entry| entry.class.as_str() == "lookup_miss")
        .expect("lookup miss recorded");
    assert_eq!(miss.key.as_deref(), Some("secret:bobsecret:object"));

    let post = report(&migration, "validate_post.json");
    assert_eq!(
        post.check(CheckId::ForeignKeys).expect("fk").status,
        CheckStatus::Warn
    );
    assert!(post.passed());
}

#[test]
fn anonymous_owner_is_not_a_lookup_miss() {
    let v1 = V1Store::new();
    v1.anonymous_customer()
        .secret("anonsecret", "anon", "viewed", "1700000000")
        .secret("missing", "carol@example.com", "new", "1700000001");
    let migration = Migration::exported(&v1);
    assert!(migration.run().succeeded());

    let anonymous = migration.object_by("secret", "v1_key", "secret:anonsecret:object");
    assert_eq!(anonymous["owner_id"], "anon");
    assert_eq!(anonymous["state"], "previewed");
    assert_eq!(anonymous["value"], "  s3cr3t\n");

    let unresolved = migration.object_by("secret", "v1_key", "secret:missing:object");
    assert_eq!(unresolved["owner_id"], "");

    assert_eq!(migration.count(Stage::Transform, "secret.anonymous"), 1);
    assert_eq!(migration.count(Stage::Transform, "secret.missing_mappings"), 1);
    assert_eq!(migration.count(Stage::Transform, "customer.anon_dropped"), 1);
    assert!(migration.objects("customer").is_empty());
}

#[test]
fn dependents_are_one_to_one_with_customers() {
    for n in [0usize, 1, 1000] {
        let v1 = V1Store::new();
        for i in 0..n {
            v1.customer(&format!("user{i}@example.com"), &format!("{}", 1_600_000_000 + i));
        }
        let migration = Migration::exported(&v1);
        let summary = migration.run();
        assert!(summary.succeeded(), "n = {n}: {:?}", summary.manifest);

        assert_eq!(migration.objects("customer").len(), n);
        assert_eq!(migration.objects("organization").len(), n, "n = {n}");
        assert_eq!(migration.objects("org_membership").len(), n, "n = {n}");
        for model in ["customer", "organization", "org_membership"] {
            let instances = migration
                .target
                .zrange_with_scores(&format!("{model}:instances"))
                .expect("instances");
            assert_eq!(instances.len(), n, "{model} instances for n = {n}");
        }
    }
}

#[test]
fn receipts_link_to_migrated_secrets_and_domains_to_organizations() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .custom_domain("d1", "alice@example.com", "secrets.example.com", "1700000050")
        .secret("s1", "alice@example.com", "received", "1700000100")
        .receipt("m1", "alice@example.com", "s1", "received", "1700000100")
        .receipt("m2", "anon", "gone", "viewed", "1700000200");
    let migration = Migration::exported(&v1);
    assert!(migration.run().succeeded());

    let customer = migration.object_by("customer", "email", "alice@example.com");
    let organization = migration.object_by("organization", "owner_id", &customer["objid"]);

    let domain = migration.object_by("custom_domain", "display_domain", "secrets.example.com");
    assert_eq!(domain["org_id"], organization["objid"]);
    assert!(domain["extid"].starts_with("cd"));
    let domains = migration
        .target
        .zrange_with_scores(&format!("organization:{}:domains", organization["objid"]))
        .expect("domains");
    assert_eq!(domains.len(), 1);

    let secret = migration.object_by("secret", "v1_key", "secret:s1:object");
    assert_eq!(secret["owner_id"], customer["objid"]);
    assert_eq!(secret["state"], "revealed");

    let linked = migration.object_by("receipt", "objid", "m1");
    assert_eq!(linked["secret_id"], secret["objid"]);
    assert_eq!(linked["state"], "revealed");
    assert!(
        migration
            .target
            .exists("receipt:m1:object")
            .expect("exists")
    );

    let orphan = migration.object_by("receipt", "objid", "m2");
    assert_eq!(orphan["owner_id"], "anon");
    assert_eq!(orphan["secret_id"], "");
    assert_eq!(orphan["state"], "previewed");
}

#[test]
fn rebuilding_twice_leaves_identical_indexes() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .customer("bob@example.com", "1700000500")
        .secret("s1", "alice@example.com", "new", "1700000600")
        .custom_domain("d1", "bob@example.com", "bob.example.com", "1700000700");
    let migration = Migration::exported(&v1);
    assert!(migration.run().succeeded());
    let first = migration.index_state();
    assert!(first.contains_key("customer:instances"));

    let pipeline = migration.pipeline(migration.options());
    let report = pipeline.run_stage(Stage::RebuildIndex).expect("rebuild");
    assert_eq!(report.status, StageStatus::Completed);
    assert_eq!(migration.index_state(), first);

    // Stale members do not survive a rebuild.
    migration
        .target
        .zadd("customer:instances", 1.0, "ghost")
        .expect("zadd");
    pipeline.run_stage(Stage::RebuildIndex).expect("rebuild");
    assert_eq!(migration.index_state(), first);
}

#[test]
fn instance_order_follows_source_creation_time() {
    let v1 = V1Store::new();
    v1.customer("late@example.com", "1700000900")
        .customer("early@example.com", "1500000000")
        .customer("middle@example.com", "1600000000.250");
    let migration = Migration::exported(&v1);
    assert!(migration.run().succeeded());

    let instances = migration
        .target
        .zrange_with_scores("customer:instances")
        .expect("instances");
    let emails: Vec<String> = instances
        .iter()
        .map(|(objid, _)| {
            migration
                .target
                .hget(&format!("customer:{objid}:object"), "email")
                .expect("hget")
                .expect("email")
        })
        .collect();
    assert_eq!(
        emails,
        ["early@example.com", "middle@example.com", "late@example.com"]
    );
    let mut objids: Vec<&String> = instances.iter().map(|(objid, _)| objid).collect();
    let in_score_order = objids.clone();
    objids.sort();
    assert_eq!(objids, in_score_order, "objids sort like their creation time");
    assert_eq!(instances[1].1, 1_600_000_000.25);
}

#[test]
fn nothing_from_the_snapshot_is_lost() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .anonymous_customer()
        .passthrough("customer:alice@example.com:feature_flags", "beta")
        .secret("s1", "alice@example.com", "new", "1700000100")
        .secret("broken", "alice@example.com", "exploded", "1700000200")
        .expiring_secret("short", "anon", "1700000300", 3_600_000);
    let migration = Migration::exported(&v1);
    assert!(migration.run().succeeded());

    let manifest = migration.manifest();
    let transform = manifest.stage(Stage::Transform).expect("transform");
    for source in ["customer", "secret"] {
        let read = transform.count(&format!("{source}.read"));
        let accounted = transform.count(&format!("{source}.rewritten"))
            + transform.count(&format!("{source}.passthrough"))
            + transform.count(&format!("{source}.dropped"))
            + transform.count(&format!("{source}.rejected"));
        assert!(read > 0);
        assert_eq!(read, accounted, "{source} lines unaccounted for");
    }

    let rejected = migration.rejected_lines("secret");
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].contains("secret:broken:object"));
    assert_eq!(transform.count("errors.unmapped_value"), 1);

    for record in migration.transformed("secret") {
        let fields = record.fields().expect("generated");
        let original = keyshift::snapshot::Record::from_line(0, &fields["_original_record"])
            .expect("original line parses");
        assert_eq!(original.key, fields["v1_key"]);
    }

    assert_eq!(
        migration
            .target
            .get_string("customer:alice@example.com:feature_flags")
            .expect("get"),
        Some("beta".to_string())
    );
    let short = migration.object_by("secret", "v1_key", "secret:short:object");
    let key = format!("secret:{}:object", short["objid"]);
    let ttl = migration.target.pttl(&key).expect("pttl").expect("ttl kept");
    assert!(ttl <= 3_600_000 && ttl > 3_000_000, "ttl {ttl}");

    let pre = report(&migration, "validate_pre.json");
    assert_eq!(
        pre.check(CheckId::SnapshotParse).expect("parse").status,
        CheckStatus::Warn
    );
}

#[test]
fn unknown_field_rejects_the_exact_source_line() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .customer("carol@example.com", "1700000050");
    v1.store
        .hset(
            "customer:carol@example.com:object",
            &fields(&[("favourite_colour", "teal")]),
        )
        .expect("seed extra field");
    let migration = Migration::exported(&v1);
    assert!(migration.run().succeeded());

    let exported = std::fs::read_to_string(migration.input().join("customer.jsonl"))
        .expect("exported customers");
    let source_line = exported
        .lines()
        .find(|line| line.contains("customer:carol@example.com:object"))
        .expect("carol exported");
    assert_eq!(migration.rejected_lines("customer"), vec![source_line.to_string()]);

    let transform = migration.count(Stage::Transform, "errors.unknown_field");
    assert_eq!(transform, 1);
    assert_eq!(migration.count(Stage::Transform, "customer.rejected"), 1);
    assert!(
        migration
            .objects("customer")
            .iter()
            .all(|customer| customer["email"] != "carol@example.com")
    );
}

#[test]
fn dry_run_leaves_the_target_untouched() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .secret("s1", "alice@example.com", "new", "1700000100");
    let migration = Migration::exported(&v1);
    let mut options = migration.options();
    options.dry_run = true;

    let summary = migration.pipeline(options).run_all().expect("dry run");
    assert!(summary.succeeded(), "{:?}", summary.manifest);
    assert!(summary.manifest.dry_run);
    assert!(keys(&migration.target, "*").is_empty());
    assert_eq!(migration.transformed("customer").len(), 3);
    assert_eq!(migration.count(Stage::Load, "load.would_write"), 4);

    // Later stages run against the in-memory shadow of what load would write.
    assert_eq!(migration.count(Stage::RebuildIndex, "customer.indexed"), 1);
    assert_eq!(migration.count(Stage::RebuildIndex, "secret.indexed"), 1);
    assert_eq!(
        migration.count(Stage::RebuildIndex, "indexes.instance_members"),
        4
    );
    let post = report(&migration, "validate_post.json");
    assert!(post.passed(), "{post:#?}");
    assert_eq!(
        post.check(CheckId::InstanceIndex).expect("index").status,
        CheckStatus::Pass
    );
}

#[test]
fn single_dry_run_stage_sees_the_earlier_stages() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000");
    let migration = Migration::exported(&v1);
    let mut options = migration.options();
    options.dry_run = true;
    let pipeline = migration.pipeline(options);

    for stage in Stage::ALL {
        let report = pipeline.run_stage(stage).expect("stage");
        assert_eq!(report.status, StageStatus::Completed, "{report:?}");
    }
    assert!(keys(&migration.target, "*").is_empty());
    assert_eq!(
        migration.count(Stage::RebuildIndex, "indexes.instance_members"),
        3
    );
    assert!(report(&migration, "validate_post.json").passed());
}

#[test]
fn skip_policy_keeps_existing_keys() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000")
        .passthrough("customer:alice@example.com:feature_flags", "beta");
    let migration = Migration::exported(&v1);
    migration
        .target
        .set_string("customer:alice@example.com:feature_flags", "operator-set")
        .expect("seed target");

    let mut options = migration.options();
    options.policy = keyshift::load::LoadPolicy::Skip;
    assert!(migration.pipeline(options).run_all().expect("run").succeeded());

    assert_eq!(
        migration
            .target
            .get_string("customer:alice@example.com:feature_flags")
            .expect("get"),
        Some("operator-set".to_string())
    );
    assert_eq!(migration.count(Stage::Load, "load.skipped"), 1);
}

#[test]
fn single_stage_runs_check_the_manifest() {
    let v1 = V1Store::new();
    v1.customer("alice@example.com", "1700000000");
    let migration = Migration::exported(&v1);
    let pipeline = migration.pipeline(migration.options());

    let err = pipeline.run_stage(Stage::Load).expect_err("no transform yet");
    assert!(matches!(
        err,
        Error::Pipeline(PipelineError::Precondition { stage: Stage::Load, .. })
    ));

    for stage in Stage::ALL {
        let report = pipeline.run_stage(stage).expect("stage");
        assert_eq!(report.status, StageStatus::Completed, "{stage}");
    }
    let manifest = migration.manifest();
    assert!(Stage::ALL.iter().all(|stage| manifest.is_completed(*stage)));
}
