//! Secrets: owner resolved by customer email, anonymous owners allowed.

use crate::model::{FieldType, ModelSchema, SECRET};
use crate::snapshot::SnapshotLine;

use super::{
    FieldAction, FieldPlan, MappingKind, RouteContext, Routed, Router, TransformError, ValueTable,
    assign_identity, object_record,
};

static SECRET_STATES: ValueTable = ValueTable {
    name: "secret_state",
    entries: &[
        ("new", "new"),
        ("viewed", "previewed"),
        ("received", "revealed"),
        ("burned", "burned"),
    ],
};

static SECRET_PLAN: FieldPlan = FieldPlan {
    source: "secret",
    target: &SECRET,
    entries: &[
        ("custid", FieldAction::Rename("v1_custid")),
        ("state", FieldAction::MapValue("state", &SECRET_STATES)),
        ("value", FieldAction::Verbatim),
        ("value_encryption", FieldAction::Copy),
        ("passphrase", FieldAction::Verbatim),
        ("metadata_key", FieldAction::Rename("v1_receipt_key")),
        ("lifespan", FieldAction::Coerce(FieldType::Integer)),
        ("original_size", FieldAction::Coerce(FieldType::Integer)),
        ("share_domain", FieldAction::Copy),
        ("truncated", FieldAction::Coerce(FieldType::Boolean)),
        ("created", FieldAction::Coerce(FieldType::Timestamp)),
        ("updated", FieldAction::Coerce(FieldType::Timestamp)),
        ("key", FieldAction::Drop),
    ],
};

static SECRET_PLANS: &[&FieldPlan] = &[&SECRET_PLAN];

static SECRET_DERIVED: &[(&ModelSchema, &[&str])] = &[(
    &SECRET,
    &[
        "objid",
        "extid",
        "owner_id",
        "state",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
)];

pub struct SecretRouter;

impl SecretRouter {
    fn rewrite(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let source = ctx.materialize(line)?;
        let mut out = SECRET_PLAN.apply(&source)?;
        out.entry("state".into()).or_insert_with(|| "new".into());

        let owner = ctx.resolve_owner(
            MappingKind::CustomerByEmail,
            SECRET.name,
            line,
            source.get("custid").map(String::as_str),
        )?;
        out.insert("owner_id".into(), owner);

        let created = ctx.created(SECRET.name, &source)?;
        let objid = assign_identity(&SECRET, created, &mut out);
        ctx.stamp(&SECRET, line, &mut out);

        let record = object_record(&SECRET, out, line.record.ttl_ms)?;
        ctx.publish(MappingKind::SecretByKey, line.record.key_parts().id, &objid);
        Ok(Routed::Rewrite(vec![record]))
    }
}

impl Router for SecretRouter {
    fn source(&self) -> &'static str {
        "secret"
    }

    fn consumes(&self) -> &'static [MappingKind] {
        &[MappingKind::CustomerByEmail]
    }

    fn produces(&self) -> &'static [MappingKind] {
        &[MappingKind::SecretByKey]
    }

    fn plans(&self) -> &'static [&'static FieldPlan] {
        SECRET_PLANS
    }

    fn derived(&self) -> &'static [(&'static ModelSchema, &'static [&'static str])] {
        SECRET_DERIVED
    }

    fn route(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let parts = line.record.key_parts();
        match parts.suffix {
            "object" if !parts.id.is_empty() => self.rewrite(line, ctx),
            _ => Ok(Routed::Passthrough),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ANON;
    use crate::pipeline::ErrorClass;
    use crate::store::MemoryStore;
    use crate::transform::test_support::{context, hash_line, rewritten, sealed_tables};
    use crate::transform::MappingTables;

    #[test]
    fn anonymous_secret_keeps_ttl_and_sensitive_fields() {
        let scratch = MemoryStore::new();
        let tables = sealed_tables(&[], &[MappingKind::CustomerByEmail]);
        let mut ctx = context("secret", &scratch, &tables);
        let mut line = hash_line(
            1,
            "secret:abc123:object",
            &[
                ("custid", "anon"),
                ("state", "viewed"),
                ("value", "AAEC  ciphertext=="),
                ("passphrase", "$2a$12$x"),
                ("lifespan", "604800.0"),
                ("created", "1700000200"),
            ],
        );
        line.record.ttl_ms = Some(600_000);

        let records = rewritten(SecretRouter.route(&line, &mut ctx).expect("route"));
        let secret = &records[0];
        assert_eq!(secret.ttl_ms, Some(600_000));
        let fields = secret.fields().expect("generated");
        assert_eq!(fields["owner_id"], ANON);
        assert_eq!(fields["state"], "previewed");
        assert_eq!(fields["value"], "AAEC  ciphertext==");
        assert_eq!(fields["passphrase"], "$2a$12$x");
        assert_eq!(fields["lifespan"], "604800");
        assert!(fields["extid"].starts_with("sc"));

        let (delta, _) = ctx.into_parts();
        let mut published = MappingTables::new();
        published.merge(delta);
        published.seal([MappingKind::SecretByKey]);
        assert_eq!(
            published
                .lookup(MappingKind::SecretByKey, "abc123")
                .expect("sealed"),
            Some(fields["objid"].as_str())
        );
    }

    #[test]
    fn unmapped_state_rejects_record() {
        let scratch = MemoryStore::new();
        let tables = sealed_tables(&[], &[MappingKind::CustomerByEmail]);
        let mut ctx = context("secret", &scratch, &tables);
        let line = hash_line(1, "secret:abc:object", &[("state", "shredded")]);
        let err = SecretRouter.route(&line, &mut ctx).expect_err("unmapped");
        assert_eq!(err.class(), ErrorClass::UnmappedValue);
    }

    #[test]
    fn reading_unsealed_owner_table_is_an_invariant_error() {
        let scratch = MemoryStore::new();
        let tables = MappingTables::new();
        let mut ctx = context("secret", &scratch, &tables);
        let line = hash_line(1, "secret:abc:object", &[("custid", "bob@example.com")]);
        let err = SecretRouter.route(&line, &mut ctx).expect_err("unsealed");
        assert!(matches!(err, TransformError::UnsealedTable { .. }));
        assert_eq!(err.class(), ErrorClass::Invariant);
    }
}
