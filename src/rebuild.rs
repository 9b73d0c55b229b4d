//! Secondary index rebuild.
//!
//! Indexes are never migrated. They are computed from the v2 objects in the
//! store, the previous index keys are deleted, and the new ones written.
//! Every structure is ordered, so rebuilding twice produces identical dumps.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::ident::SourceTime;
use crate::model::{
    self, ANON, CREATED, MIGRATION_STATUS, ModelSchema, OBJID, instance_index_key,
    participation_key, unique_index_key,
};
use crate::pipeline::{ErrorClass, ErrorEntry, StageLog};
use crate::store::{FieldMap, Store, StoreError, scan_keys};

/// Sorted-set members with their scores.
pub type Members = BTreeMap<String, f64>;

/// Every index key the rebuild will write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexPlan {
    /// `{model}:instances`
    pub instances: BTreeMap<String, Members>,
    /// `{model}:{field}_index`: natural value -> objid
    pub unique: BTreeMap<String, FieldMap>,
    /// `{parent}:{parent_id}:{set}`
    pub participation: BTreeMap<String, Members>,
}

impl IndexPlan {
    pub fn instance_count(&self, model: &str) -> usize {
        self.instances
            .get(&instance_index_key(model))
            .map_or(0, BTreeMap::len)
    }
}

/// Scan every v2 model and compute its indexes. Objects that cannot be
/// indexed are counted and logged, never fatal.
pub fn compute_indexes(
    store: &dyn Store,
    models: &[&'static ModelSchema],
    log: &mut StageLog,
) -> Result<IndexPlan, StoreError> {
    let mut plan = IndexPlan::default();
    for schema in models {
        let mut instances = Members::new();
        let mut unique: BTreeMap<&'static str, BTreeMap<String, Vec<(f64, String)>>> =
            BTreeMap::new();

        for key in scan_keys(store, &format!("{}:*:object", schema.name)) {
            let key = key?;
            let fields = match store.hgetall(&key) {
                Ok(fields) => fields,
                Err(err) => {
                    log.error(
                        ErrorEntry::new(ErrorClass::Store, err.to_string())
                            .model(schema.name)
                            .key(&key),
                    );
                    log.bump(&format!("{}.skipped", schema.name));
                    continue;
                }
            };
            let Some((objid, score)) = indexable(schema, &key, &fields, log) else {
                log.bump(&format!("{}.skipped", schema.name));
                continue;
            };
            log.bump(&format!("{}.indexed", schema.name));

            for field in schema.unique {
                if let Some(value) = fields.get(*field).filter(|value| !value.is_empty()) {
                    unique
                        .entry(*field)
                        .or_default()
                        .entry(value.clone())
                        .or_default()
                        .push((score, objid.clone()));
                }
            }
            for fk in schema.foreign_keys {
                let Some(set) = fk.participation else {
                    continue;
                };
                let Some(parent) = fields
                    .get(fk.field)
                    .filter(|parent| !parent.is_empty() && parent.as_str() != ANON)
                else {
                    continue;
                };
                plan.participation
                    .entry(participation_key(fk.target, parent, set))
                    .or_default()
                    .insert(objid.clone(), score);
            }
            instances.insert(objid, score);
        }

        for (field, values) in unique {
            let mut lookup = FieldMap::new();
            for (value, mut owners) in values {
                owners.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                if owners.len() > 1 {
                    let losers: Vec<&str> = owners[1..].iter().map(|(_, id)| id.as_str()).collect();
                    log.error(
                        ErrorEntry::new(
                            ErrorClass::Invariant,
                            format!(
                                "duplicate {field} `{value}`: kept {}, dropped {}",
                                owners[0].1,
                                losers.join(", ")
                            ),
                        )
                        .model(schema.name),
                    );
                }
                lookup.insert(value, owners[0].1.clone());
            }
            plan.unique.insert(unique_index_key(schema.name, field), lookup);
        }
        plan.instances
            .insert(instance_index_key(schema.name), instances);
    }
    Ok(plan)
}

/// objid and score of an object, or `None` (with an error logged) when the
/// object cannot be indexed.
fn indexable(
    schema: &ModelSchema,
    key: &str,
    fields: &FieldMap,
    log: &mut StageLog,
) -> Option<(String, f64)> {
    let mut reject = |message: String| {
        log.error(
            ErrorEntry::new(ErrorClass::Invariant, message)
                .model(schema.name)
                .key(key),
        );
        None
    };
    let Some(objid) = fields.get(OBJID).filter(|id| !id.is_empty()) else {
        return reject("object has no objid".into());
    };
    if fields.get(MIGRATION_STATUS).is_none_or(String::is_empty) {
        return reject("object was not written by a migration".into());
    }
    let created = fields.get(CREATED).map(String::as_str).unwrap_or_default();
    match SourceTime::parse(created) {
        Ok(time) => Some((objid.clone(), time.score())),
        Err(err) => reject(format!("unusable created: {err}")),
    }
}

/// Delete previous index keys and write `plan`. Returns the number of keys
/// deleted.
pub fn apply_indexes(
    store: &dyn Store,
    models: &[&'static ModelSchema],
    plan: &IndexPlan,
    log: &mut StageLog,
) -> Result<u64, StoreError> {
    let mut stale = BTreeSet::new();
    for schema in models {
        stale.insert(instance_index_key(schema.name));
        for field in schema.unique {
            stale.insert(unique_index_key(schema.name, field));
        }
        for fk in schema.foreign_keys {
            if let Some(set) = fk.participation {
                for key in scan_keys(store, &format!("{}:*:{set}", fk.target)) {
                    stale.insert(key?);
                }
            }
        }
    }
    let mut deleted = 0;
    for key in &stale {
        if store.delete(key)? {
            deleted += 1;
        }
    }
    debug!(deleted, "previous index keys removed");

    for (key, members) in plan.instances.iter().chain(&plan.participation) {
        for (member, score) in members {
            store.zadd(key, *score, member)?;
        }
    }
    for (key, lookup) in &plan.unique {
        if !lookup.is_empty() {
            store.hset(key, lookup)?;
        }
    }

    log.add("indexes.deleted", deleted);
    Ok(deleted)
}

/// Compute and (unless `dry_run`) write every index for `models`.
pub fn rebuild_indexes(
    store: &dyn Store,
    models: &[&'static ModelSchema],
    dry_run: bool,
    log: &mut StageLog,
) -> Result<IndexPlan, StoreError> {
    let plan = compute_indexes(store, models, log)?;
    log.add(
        "indexes.instance_members",
        plan.instances.values().map(|m| m.len() as u64).sum(),
    );
    log.add(
        "indexes.unique_entries",
        plan.unique.values().map(|m| m.len() as u64).sum(),
    );
    log.add("indexes.participation_sets", plan.participation.len() as u64);
    if dry_run {
        info!("dry run: indexes computed, nothing written");
        return Ok(plan);
    }
    apply_indexes(store, models, &plan, log)?;
    info!(
        instances = plan.instances.len(),
        participation = plan.participation.len(),
        "indexes rebuilt"
    );
    Ok(plan)
}

/// All v2 models.
pub fn rebuild_all(
    store: &dyn Store,
    dry_run: bool,
    log: &mut StageLog,
) -> Result<IndexPlan, StoreError> {
    rebuild_indexes(store, model::v2_models(), dry_run, log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn object(store: &MemoryStore, model: &str, objid: &str, pairs: &[(&str, &str)]) {
        let mut fields: FieldMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        fields.insert("objid".into(), objid.into());
        fields.insert("migration_status".into(), "completed".into());
        store
            .hset(&model::object_key(model, objid), &fields)
            .expect("hset");
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        object(
            &store,
            "customer",
            "c1",
            &[("created", "100"), ("email", "a@example.com"), ("extid", "ur1")],
        );
        object(
            &store,
            "customer",
            "c2",
            &[("created", "200"), ("email", "b@example.com"), ("extid", "ur2")],
        );
        object(
            &store,
            "secret",
            "s1",
            &[("created", "150"), ("owner_id", "c1"), ("extid", "sc1")],
        );
        object(
            &store,
            "secret",
            "s2",
            &[("created", "160"), ("owner_id", "anon"), ("extid", "sc2")],
        );
        object(
            &store,
            "secret",
            "s3",
            &[("created", "170"), ("owner_id", ""), ("extid", "sc3")],
        );
        store
    }

    #[test]
    fn computes_instances_unique_and_participation() {
        let store = seeded();
        let mut log = StageLog::new(10);
        let plan = rebuild_all(&store, false, &mut log).expect("rebuild");
        assert_eq!(plan.instance_count("customer"), 2);
        assert_eq!(plan.instance_count("secret"), 3);

        assert_eq!(
            store.zrange_with_scores("customer:instances").expect("zrange"),
            vec![("c1".to_string(), 100.0), ("c2".to_string(), 200.0)]
        );
        assert_eq!(
            store
                .hget("customer:email_index", "b@example.com")
                .expect("hget"),
            Some("c2".into())
        );
        // anon and placeholder owners have no participation set
        assert_eq!(
            store.zrange_with_scores("customer:c1:secrets").expect("zrange"),
            vec![("s1".to_string(), 150.0)]
        );
        assert!(!store.exists("customer:anon:secrets").expect("exists"));
        assert!(!store.exists("customer::secrets").expect("exists"));
        assert_eq!(log.error_count(), 0);
    }

    #[test]
    fn rebuild_twice_is_byte_identical() {
        let store = seeded();
        let mut log = StageLog::new(10);
        rebuild_all(&store, false, &mut log).expect("first");
        let keys = [
            "customer:instances",
            "customer:email_index",
            "secret:instances",
            "customer:c1:secrets",
        ];
        let first: Vec<_> = keys.iter().map(|k| store.dump(k).expect("dump")).collect();
        rebuild_all(&store, false, &mut log).expect("second");
        let second: Vec<_> = keys.iter().map(|k| store.dump(k).expect("dump")).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_participation_sets_are_removed() {
        let store = seeded();
        store.zadd("customer:gone:secrets", 1.0, "old").expect("zadd");
        store.zadd("customer:instances", 1.0, "ghost").expect("zadd");
        let mut log = StageLog::new(10);
        rebuild_all(&store, false, &mut log).expect("rebuild");
        assert!(!store.exists("customer:gone:secrets").expect("exists"));
        let members: Vec<_> = store
            .zrange_with_scores("customer:instances")
            .expect("zrange")
            .into_iter()
            .map(|(member, _)| member)
            .collect();
        assert_eq!(members, vec!["c1", "c2"]);
    }

    #[test]
    fn duplicate_unique_value_keeps_earliest() {
        let store = seeded();
        object(
            &store,
            "customer",
            "c0",
            &[("created", "300"), ("email", "a@example.com"), ("extid", "ur0")],
        );
        let mut log = StageLog::new(10);
        rebuild_all(&store, false, &mut log).expect("rebuild");
        assert_eq!(
            store
                .hget("customer:email_index", "a@example.com")
                .expect("hget"),
            Some("c1".into())
        );
        assert_eq!(log.count("errors.invariant"), 1);
    }

    #[test]
    fn unmigrated_object_is_skipped() {
        let store = seeded();
        let mut fields = FieldMap::new();
        fields.insert("objid".into(), "legacy".into());
        fields.insert("created".into(), "1".into());
        store
            .hset("customer:legacy:object", &fields)
            .expect("hset");
        let mut log = StageLog::new(10);
        let plan = rebuild_all(&store, true, &mut log).expect("dry run");
        assert_eq!(plan.instance_count("customer"), 2);
        assert_eq!(log.count("customer.skipped"), 1);
        assert!(!store.exists("customer:instances").expect("exists"));
    }

    #[test]
    fn unreadable_object_is_logged_and_the_scan_continues() {
        let store = seeded();
        store
            .set_string("customer:legacy:object", "not a hash")
            .expect("set");
        let mut log = StageLog::new(10);
        let plan = rebuild_all(&store, false, &mut log).expect("rebuild");
        assert_eq!(plan.instance_count("customer"), 2);
        assert_eq!(log.count("customer.skipped"), 1);
        assert_eq!(log.count("errors.store"), 1);
        assert_eq!(
            log.errors()[0].key.as_deref(),
            Some("customer:legacy:object")
        );
        assert_eq!(
            store.zrange_with_scores("customer:instances").expect("zrange").len(),
            2
        );
    }
}
