//! v1 `metadata` becomes `receipt`. The id segment carries over as the
//! objid so links that embed it keep working.

use crate::model::{FieldType, ModelSchema, OBJID, RECEIPT, render_timestamp};
use crate::snapshot::SnapshotLine;

use super::{
    FieldAction, FieldPlan, MappingKind, RouteContext, Routed, Router, TransformError, ValueTable,
    object_record,
};

static RECEIPT_STATES: ValueTable = ValueTable {
    name: "receipt_state",
    entries: &[
        ("new", "new"),
        ("shared", "shared"),
        ("viewed", "previewed"),
        ("received", "revealed"),
        ("burned", "burned"),
        ("expired", "expired"),
        ("orphaned", "orphaned"),
    ],
};

static RECEIPT_PLAN: FieldPlan = FieldPlan {
    source: "metadata",
    target: &RECEIPT,
    entries: &[
        ("custid", FieldAction::Rename("v1_custid")),
        ("state", FieldAction::MapValue("state", &RECEIPT_STATES)),
        ("secret_key", FieldAction::Rename("v1_secret_key")),
        ("secret_shortkey", FieldAction::Rename("secret_shortid")),
        ("secret_ttl", FieldAction::Coerce(FieldType::Integer)),
        ("passphrase", FieldAction::Verbatim),
        ("recipients", FieldAction::Copy),
        ("share_domain", FieldAction::Copy),
        ("created", FieldAction::Coerce(FieldType::Timestamp)),
        ("updated", FieldAction::Coerce(FieldType::Timestamp)),
        ("viewed", FieldAction::RenameCoerce("previewed", FieldType::Timestamp)),
        ("received", FieldAction::RenameCoerce("revealed", FieldType::Timestamp)),
        ("burned", FieldAction::Coerce(FieldType::Timestamp)),
        ("shared", FieldAction::Coerce(FieldType::Timestamp)),
        ("key", FieldAction::Drop),
    ],
};

static RECEIPT_PLANS: &[&FieldPlan] = &[&RECEIPT_PLAN];

static RECEIPT_DERIVED: &[(&ModelSchema, &[&str])] = &[(
    &RECEIPT,
    &[
        "objid",
        "owner_id",
        "secret_id",
        "state",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
)];

pub struct ReceiptRouter;

impl ReceiptRouter {
    fn rewrite(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let source = ctx.materialize(line)?;
        let mut out = RECEIPT_PLAN.apply(&source)?;
        out.entry("state".into()).or_insert_with(|| "new".into());
        out.insert(OBJID.into(), line.record.key_parts().id.to_string());

        let owner = ctx.resolve_owner(
            MappingKind::CustomerByEmail,
            RECEIPT.name,
            line,
            source.get("custid").map(String::as_str),
        )?;
        out.insert("owner_id".into(), owner);

        if let Some(secret_id) = ctx.resolve_link(
            MappingKind::SecretByKey,
            RECEIPT.name,
            line,
            source.get("secret_key").map(String::as_str),
        )? {
            out.insert("secret_id".into(), secret_id);
        }

        let created = ctx.created(RECEIPT.name, &source)?;
        out.insert("created".into(), render_timestamp(created));
        ctx.stamp(&RECEIPT, line, &mut out);

        let record = object_record(&RECEIPT, out, line.record.ttl_ms)?;
        Ok(Routed::Rewrite(vec![record]))
    }
}

impl Router for ReceiptRouter {
    fn source(&self) -> &'static str {
        "metadata"
    }

    fn consumes(&self) -> &'static [MappingKind] {
        &[MappingKind::CustomerByEmail, MappingKind::SecretByKey]
    }

    fn plans(&self) -> &'static [&'static FieldPlan] {
        RECEIPT_PLANS
    }

    fn derived(&self) -> &'static [(&'static ModelSchema, &'static [&'static str])] {
        RECEIPT_DERIVED
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
