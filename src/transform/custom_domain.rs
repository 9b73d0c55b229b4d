//! Custom domains: owned by the organization of the v1 customer.

use crate::model::{CUSTOM_DOMAIN, FieldType, ModelSchema};
use crate::snapshot::SnapshotLine;

use super::{
    FieldAction, FieldPlan, MappingKind, RouteContext, Routed, Router, TransformError,
    assign_identity, object_record,
};

const GLOBAL_INDEXES: &[&str] = &["display_domains", "owners", "values"];

static CUSTOM_DOMAIN_PLAN: FieldPlan = FieldPlan {
    source: "customdomain",
    target: &CUSTOM_DOMAIN,
    entries: &[
        ("domainid", FieldAction::Rename("v1_domainid")),
        ("custid", FieldAction::Rename("v1_custid")),
        ("display_domain", FieldAction::Copy),
        ("base_domain", FieldAction::Copy),
        ("subdomain", FieldAction::Copy),
        ("trd", FieldAction::Copy),
        ("tld", FieldAction::Copy),
        ("sld", FieldAction::Copy),
        ("txt_validation_host", FieldAction::Copy),
        ("txt_validation_value", FieldAction::Copy),
        ("status", FieldAction::Copy),
        ("verified", FieldAction::Coerce(FieldType::Boolean)),
        ("resolving", FieldAction::Coerce(FieldType::Boolean)),
        ("created", FieldAction::Coerce(FieldType::Timestamp)),
        ("updated", FieldAction::Coerce(FieldType::Timestamp)),
        ("key", FieldAction::Drop),
    ],
};

static CUSTOM_DOMAIN_PLANS: &[&FieldPlan] = &[&CUSTOM_DOMAIN_PLAN];

static CUSTOM_DOMAIN_DERIVED: &[(&ModelSchema, &[&str])] = &[(
    &CUSTOM_DOMAIN,
    &[
        "objid",
        "extid",
        "org_id",
        "v1_domainid",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
)];

pub struct CustomDomainRouter;

impl CustomDomainRouter {
    fn rewrite(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let source = ctx.materialize(line)?;
        let mut out = CUSTOM_DOMAIN_PLAN.apply(&source)?;
        if out.get("v1_domainid").is_none_or(String::is_empty) {
            out.insert("v1_domainid".into(), line.record.key_parts().id.to_string());
        }

        let org_id = ctx.resolve_owner(
            MappingKind::OrganizationByEmail,
            CUSTOM_DOMAIN.name,
            line,
            source.get("custid").map(String::as_str),
        )?;
        out.insert("org_id".into(), org_id);

        let created = ctx.created(CUSTOM_DOMAIN.name, &source)?;
        let objid = assign_identity(&CUSTOM_DOMAIN, created, &mut out);
        ctx.stamp(&CUSTOM_DOMAIN, line, &mut out);

        let display_domain = out.get("display_domain").cloned().unwrap_or_default();
        let record = object_record(&CUSTOM_DOMAIN, out, line.record.ttl_ms)?;
        if !display_domain.is_empty() {
            ctx.publish(MappingKind::DomainByName, &display_domain, &objid);
        }
        Ok(Routed::Rewrite(vec![record]))
    }
}

impl Router for CustomDomainRouter {
    fn source(&self) -> &'static str {
        "customdomain"
    }

    fn consumes(&self) -> &'static [MappingKind] {
        &[MappingKind::OrganizationByEmail]
    }

    fn produces(&self) -> &'static [MappingKind] {
        &[MappingKind::DomainByName]
    }

    fn plans(&self) -> &'static [&'static FieldPlan] {
        CUSTOM_DOMAIN_PLANS
    }

    fn derived(&self) -> &'static [(&'static ModelSchema, &'static [&'static str])] {
        CUSTOM_DOMAIN_DERIVED
    }

    fn route(
        &self,
        line: &SnapshotLine,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Routed, TransformError> {
        let parts = line.record.key_parts();
        match parts.suffix {
            "object" => self.rewrite(line, ctx),
            suffix if parts.id.is_empty() && GLOBAL_INDEXES.contains(&suffix) => Ok(Routed::Drop),
            _ => Ok(Routed::Passthrough),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ANON, UNRESOLVED};
    use crate::pipeline::ErrorClass;
    use crate::store::MemoryStore;
    use crate::transform::test_support::{context, hash_line, rewritten, sealed_tables};

    fn domain_line(custid: Option<&str>) -> SnapshotLine {
        let mut pairs = vec![
            ("domainid", "d1"),
            ("display_domain", "secrets.example.com"),
            ("verified", "true"),
            ("created", "1700000100"),
        ];
        if let Some(custid) = custid {
            pairs.push(("custid", custid));
        }
        hash_line(3, "customdomain:d1:object", &pairs)
    }

    #[test]
    fn owner_email_resolves_to_organization() {
        let scratch = MemoryStore::new();
        let tables = sealed_tables(
            &[(MappingKind::OrganizationByEmail, "alice@example.com", "org-1")],
            &[MappingKind::OrganizationByEmail],
        );
        let mut ctx = context("customdomain", &scratch, &tables);
        let records = rewritten(
            CustomDomainRouter
                .route(&domain_line(Some("alice@example.com")), &mut ctx)
                .expect("route"),
        );
        let fields = records[0].fields().expect("generated");
        assert_eq!(fields["org_id"], "org-1");
        assert_eq!(fields["v1_custid"], "alice@example.com");
        assert_eq!(fields["v1_domainid"], "d1");
        assert!(fields["extid"].starts_with("cd"));
        assert_eq!(ctx.log().count("custom_domain.missing_mappings"), 0);
    }

    #[test]
    fn unknown_owner_becomes_placeholder_and_is_still_written() {
        let scratch = MemoryStore::new();
        let tables = sealed_tables(&[], &[MappingKind::OrganizationByEmail]);
        let mut ctx = context("customdomain", &scratch, &tables);
        let records = rewritten(
            CustomDomainRouter
                .route(&domain_line(Some("ghost@example.com")), &mut ctx)
                .expect("route"),
        );
        assert_eq!(records[0].fields().expect("generated")["org_id"], UNRESOLVED);
        assert_eq!(ctx.log().count("custom_domain.missing_mappings"), 1);
        let miss = &ctx.log().errors()[0];
        assert_eq!(miss.class, ErrorClass::LookupMiss);
        assert!(miss.message.contains("ghost@example.com"));
    }

    #[test]
    fn absent_owner_is_anonymous_not_unresolved() {
        let scratch = MemoryStore::new();
        let tables = sealed_tables(&[], &[MappingKind::OrganizationByEmail]);
        let mut ctx = context("customdomain", &scratch, &tables);
        let records = rewritten(
            CustomDomainRouter
                .route(&domain_line(None), &mut ctx)
                .expect("route"),
        );
        assert_eq!(records[0].fields().expect("generated")["org_id"], ANON);
        assert_eq!(ctx.log().count("custom_domain.anonymous"), 1);
        assert_eq!(ctx.log().count("custom_domain.missing_mappings"), 0);
    }

    #[test]
    fn display_domain_index_is_dropped() {
        let scratch = MemoryStore::new();
        let tables = sealed_tables(&[], &[MappingKind::OrganizationByEmail]);
        let mut ctx = context("customdomain", &scratch, &tables);
        let line = hash_line(1, "customdomain:display_domains", &[("a", "b")]);
        assert!(matches!(
            CustomDomainRouter.route(&line, &mut ctx).expect("route"),
            Routed::Drop
        ));
    }
}
