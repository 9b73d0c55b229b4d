//! Root identity: v1 customers become a customer, its default
//! organization, and the owner membership linking the two.

use crate::ident::SourceTime;
use crate::model::{
    ANON, CUSTOMER, FieldType, ModelSchema, ORG_MEMBERSHIP, ORGANIZATION, render_timestamp,
};
use crate::snapshot::SnapshotLine;
use crate::store::FieldMap;

use super::{
    FieldAction, FieldPlan, MappingKind, RouteContext, Routed, Router, TransformError,
    assign_identity, object_record,
};

/// v1 index keys under `customer:`; all rebuilt from objects.
const GLOBAL_INDEXES: &[&str] = &["values", "domains", "email_index"];
const OBJECT_INDEXES: &[&str] = &["custom_domain", "metadata", "receipts"];

static CUSTOMER_PLAN: FieldPlan = FieldPlan {
    source: "customer",
    target: &CUSTOMER,
    entries: &[
        ("custid", FieldAction::Rename("v1_custid")),
        ("email", FieldAction::Copy),
        ("role", FieldAction::Copy),
        ("planid", FieldAction::Copy),
        ("locale", FieldAction::Copy),
        ("verified", FieldAction::Coerce(FieldType::Boolean)),
        ("contributor", FieldAction::Coerce(FieldType::Boolean)),
        ("secrets_created", FieldAction::Coerce(FieldType::Integer)),
        ("secrets_burned", FieldAction::Coerce(FieldType::Integer)),
        ("secrets_shared", FieldAction::Coerce(FieldType::Integer)),
        ("emails_sent", FieldAction::Coerce(FieldType::Integer)),
        ("apitoken", FieldAction::Verbatim),
        ("passphrase", FieldAction::Verbatim),
        ("passphrase_encryption", FieldAction::Copy),
        ("stripe_customer_id", FieldAction::Copy),
        ("stripe_subscription_id", FieldAction::Copy),
        ("created", FieldAction::Coerce(FieldType::Timestamp)),
        ("updated", FieldAction::Coerce(FieldType::Timestamp)),
        ("last_login", FieldAction::Coerce(FieldType::Timestamp)),
        ("key", FieldAction::Drop),
        ("sessid", FieldAction::Drop),
    ],
};

static CUSTOMER_PLANS: &[&FieldPlan] = &[&CUSTOMER_PLAN];

static CUSTOMER_DERIVED: &[(&ModelSchema, &[&str])] = &[
    (
        &CUSTOMER,
        &[
            "objid",
            "extid",
            "email",
            "v1_custid",
            "created",
            "_original_record",
            "v1_key",
            "migration_status",
            "migrated_at",
        ],
    ),
    (
        &ORGANIZATION,
        &[
            "objid",
            "extid",
            "display_name",
            "owner_id",
            "contact_email",
            "is_default",
            "created",
            "updated",
            "v1_key",
            "migration_status",
            "migrated_at",
        ],
    ),
    (
        &ORG_MEMBERSHIP,
        &[
            "objid",
            "organization_objid",
            "customer_objid",
            "role",
            "status",
            "joined_at",
            "created",
            "v1_key",
            "migration_status",
            "migrated_at",
        ],
    ),
];

pub struct CustomerRouter;

impl CustomerRouter {
    fn rewrite(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let parts = line.record.key_parts();
        let source = ctx.materialize(line)?;
        let mut customer = CUSTOMER_PLAN.apply(&source)?;

        if customer.get("v1_custid").is_none_or(String::is_empty) {
            customer.insert("v1_custid".into(), parts.id.to_string());
        }
        let email = match customer.get("email").filter(|email| !email.is_empty()) {
            Some(email) => email.clone(),
            None => customer["v1_custid"].clone(),
        };
        customer.insert("email".into(), email.clone());

        let created = ctx.created(CUSTOMER.name, &source)?;
        let customer_id = assign_identity(&CUSTOMER, created, &mut customer);
        ctx.stamp(&CUSTOMER, line, &mut customer);

        let mut organization = FieldMap::new();
        let organization_id = assign_identity(&ORGANIZATION, created, &mut organization);
        organization.insert("display_name".into(), email.clone());
        organization.insert("owner_id".into(), customer_id.clone());
        organization.insert("contact_email".into(), email.clone());
        organization.insert("is_default".into(), "true".into());
        organization.insert("updated".into(), render_timestamp(created));
        ctx.stamp(&ORGANIZATION, line, &mut organization);

        let membership = owner_membership(ctx, line, created, &organization_id, &customer_id);

        let records = vec![
            object_record(&CUSTOMER, customer, line.record.ttl_ms)?,
            object_record(&ORGANIZATION, organization, None)?,
            object_record(&ORG_MEMBERSHIP, membership, None)?,
        ];

        // Publish only once every record of this source line is built.
        ctx.publish(MappingKind::CustomerByEmail, &email, &customer_id);
        ctx.publish(MappingKind::OrganizationByEmail, &email, &organization_id);
        if let Some(custid) = source.get("custid").filter(|custid| **custid != email) {
            ctx.publish(MappingKind::CustomerByEmail, custid, &customer_id);
            ctx.publish(MappingKind::OrganizationByEmail, custid, &organization_id);
        }
        Ok(Routed::Rewrite(records))
    }
}

fn owner_membership(
    ctx: &RouteContext<'_>,
    line: &SnapshotLine,
    created: SourceTime,
    organization_id: &str,
    customer_id: &str,
) -> FieldMap {
    let mut membership = FieldMap::new();
    assign_identity(&ORG_MEMBERSHIP, created, &mut membership);
    membership.insert("organization_objid".into(), organization_id.to_string());
    membership.insert("customer_objid".into(), customer_id.to_string());
    membership.insert("role".into(), "owner".into());
    membership.insert("status".into(), "active".into());
    membership.insert("joined_at".into(), render_timestamp(created));
    ctx.stamp(&ORG_MEMBERSHIP, line, &mut membership);
    membership
}

impl Router for CustomerRouter {
    fn source(&self) -> &'static str {
        "customer"
    }

    fn produces(&self) -> &'static [MappingKind] {
        &[MappingKind::CustomerByEmail, MappingKind::OrganizationByEmail]
    }

    fn plans(&self) -> &'static [&'static FieldPlan] {
        CUSTOMER_PLANS
    }

    fn derived(&self) -> &'static [(&'static ModelSchema, &'static [&'static str])] {
        CUSTOMER_DERIVED
    }

    fn route(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let parts = line.record.key_parts();
        match parts.suffix {
            "object" if parts.id == ANON => {
                ctx.bump("customer.anon_dropped");
                Ok(Routed::Drop)
            }
            "object" => self.rewrite(line, ctx),
            suffix if parts.id.is_empty() && GLOBAL_INDEXES.contains(&suffix) => Ok(Routed::Drop),
            suffix if !parts.id.is_empty() && OBJECT_INDEXES.contains(&suffix) => {
                Ok(Routed::Drop)
            }
            _ => Ok(Routed::Passthrough),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::PrimaryId;
    use crate::store::MemoryStore;
    use crate::transform::MappingTables;
    use crate::transform::test_support::{context, hash_line, record_for, rewritten};

    fn alice() -> SnapshotLine {
        hash_line(
            1,
            "customer:alice@example.com:object",
            &[
                ("custid", "alice@example.com"),
                ("email", "alice@example.com"),
                ("created", "1700000000"),
                ("verified", "1"),
                ("secrets_created", "12.0"),
                ("passphrase", "$2a$12$hash"),
                ("apitoken", "tok_abc"),
                ("sessid", "s1"),
            ],
        )
    }

    #[test]
    fn customer_rewrites_into_customer_org_and_membership() {
        let scratch = MemoryStore::new();
        let tables = MappingTables::new();
        let mut ctx = context("customer", &scratch, &tables);
        let line = alice();
        let records = rewritten(CustomerRouter.route(&line, &mut ctx).expect("route"));
        assert_eq!(records.len(), 3);

        let customer = record_for(&records, "customer");
        let fields = customer.fields().expect("generated");
        let objid: PrimaryId = fields["objid"].parse().expect("uuid");
        assert_eq!(objid.timestamp_ms(), 1_700_000_000_000);
        assert!(fields["extid"].starts_with("ur"));
        assert_eq!(fields["extid"].len(), 27);
        assert_eq!(fields["v1_custid"], "alice@example.com");
        assert_eq!(fields["verified"], "true");
        assert_eq!(fields["secrets_created"], "12");
        assert_eq!(fields["passphrase"], "$2a$12$hash");
        assert_eq!(fields["migration_status"], "completed");
        assert_eq!(fields["_original_record"], line.raw);
        assert!(!fields.contains_key("custid"));
        assert!(!fields.contains_key("sessid"));
        assert_eq!(customer.key, format!("customer:{objid}:object"));

        let org = record_for(&records, "organization");
        let org_fields = org.fields().expect("generated");
        assert_eq!(org_fields["owner_id"], fields["objid"]);
        assert_eq!(org_fields["created"], "1700000000");
        assert!(org_fields["extid"].starts_with("on"));
        assert_eq!(org_fields["v1_key"], "customer:alice@example.com:object");
        assert!(!org_fields.contains_key("_original_record"));

        let membership = record_for(&records, "org_membership");
        let membership_fields = membership.fields().expect("generated");
        assert_eq!(membership_fields["organization_objid"], org_fields["objid"]);
        assert_eq!(membership_fields["customer_objid"], fields["objid"]);
        assert_eq!(membership_fields["role"], "owner");

        let (delta, _log) = ctx.into_parts();
        let mut tables = MappingTables::new();
        tables.merge(delta);
        tables.seal([MappingKind::CustomerByEmail, MappingKind::OrganizationByEmail]);
        assert_eq!(
            tables
                .lookup(MappingKind::CustomerByEmail, "alice@example.com")
                .expect("sealed"),
            Some(fields["objid"].as_str())
        );
        assert_eq!(
            tables
                .lookup(MappingKind::OrganizationByEmail, "alice@example.com")
                .expect("sealed"),
            Some(org_fields["objid"].as_str())
        );
    }

    #[test]
    fn anonymous_customer_and_indexes_are_dropped() {
        let scratch = MemoryStore::new();
        let tables = MappingTables::new();
        let mut ctx = context("customer", &scratch, &tables);
        for key in [
            "customer:anon:object",
            "customer:values",
            "customer:alice@example.com:custom_domain",
        ] {
            let line = hash_line(1, key, &[("x", "y")]);
            assert!(matches!(
                CustomerRouter.route(&line, &mut ctx).expect("route"),
                Routed::Drop
            ));
        }
        let line = hash_line(2, "customer:alice@example.com:reset_secret", &[("x", "y")]);
        assert!(matches!(
            CustomerRouter.route(&line, &mut ctx).expect("route"),
            Routed::Passthrough
        ));
    }

    #[test]
    fn unknown_source_field_rejects_whole_record_without_publishing() {
        let scratch = MemoryStore::new();
        let tables = MappingTables::new();
        let mut ctx = context("customer", &scratch, &tables);
        let line = hash_line(
            1,
            "customer:carol@example.com:object",
            &[("email", "carol@example.com"), ("favourite_colour", "teal")],
        );
        let err = CustomerRouter.route(&line, &mut ctx).expect_err("unknown field");
        assert!(matches!(err, TransformError::UnknownField { ref field, .. } if field == "favourite_colour"));
        let (delta, _) = ctx.into_parts();
        assert!(delta.is_empty());
    }

    #[test]
    fn missing_created_falls_back_to_run_start() {
        let scratch = MemoryStore::new();
        let tables = MappingTables::new();
        let mut ctx = context("customer", &scratch, &tables);
        let line = hash_line(1, "customer:dave@example.com:object", &[]);
        let records = rewritten(CustomerRouter.route(&line, &mut ctx).expect("route"));
        let customer = record_for(&records, "customer");
        let fields = customer.fields().expect("generated");
        assert_eq!(fields["email"], "dave@example.com");
        assert_eq!(fields["created"], "1800000000");
        assert_eq!(ctx.log().count("customer.created_fallback"), 1);
    }
}
