//! Declared v2 field sets.
//!
//! Every field a transform writes must appear in the table of its model.
//! The rebuilder and validator read the same tables for unique lookups,
//! foreign keys and participation sets.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::SourceTime;
use crate::store::FieldMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    /// Epoch seconds, integer or fractional.
    Timestamp,
    Identifier,
    Json,
    /// Sensitive or opaque; carried byte-for-byte, never coerced.
    Verbatim,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("`{value}` is not a valid {expected}: {reason}")]
pub struct CoerceError {
    pub value: String,
    pub expected: FieldType,
    pub reason: String,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Identifier => "identifier",
            FieldType::Json => "json",
            FieldType::Verbatim => "verbatim",
        }
    }

    /// Canonical string form of `raw` for this type. Empty stays empty.
    pub fn normalize(self, raw: &str) -> Result<String, CoerceError> {
        let fail = |reason: String| CoerceError {
            value: raw.to_string(),
            expected: self,
            reason,
        };
        match self {
            FieldType::String | FieldType::Identifier | FieldType::Verbatim => Ok(raw.to_string()),
            _ if raw.trim().is_empty() => Ok(String::new()),
            FieldType::Integer => {
                let trimmed = raw.trim();
                if let Ok(n) = trimmed.parse::<i64>() {
                    return Ok(n.to_string());
                }
                // v1 wrote some counters as floats ("3.0").
                match trimmed.parse::<f64>() {
                    Ok(f) if f.is_finite() && f.fract() == 0.0 => Ok((f as i64).to_string()),
                    _ => Err(fail("not an integer".into())),
                }
            }
            FieldType::Float => match raw.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(f.to_string()),
                _ => Err(fail("not a finite number".into())),
            },
            FieldType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok("true".into()),
                "false" | "0" | "no" => Ok("false".into()),
                _ => Err(fail("not a boolean".into())),
            },
            FieldType::Timestamp => {
                let time = SourceTime::parse(raw).map_err(|err| fail(err.to_string()))?;
                Ok(render_timestamp(time))
            }
            FieldType::Json => serde_json::from_str::<serde_json::Value>(raw)
                .map(|value| value.to_string())
                .map_err(|err| fail(err.to_string())),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole seconds render as an integer, otherwise with millisecond precision.
pub(crate) fn render_timestamp(time: SourceTime) -> String {
    let ms = time.millis();
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{}.{:03}", ms / 1000, ms % 1000)
            .trim_end_matches('0')
            .to_string()
    }
}

/// A reference from one model's field to another model's objid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub target: &'static str,
    /// Participation set on the target: `{target}:{value}:{set}`.
    pub participation: Option<&'static str>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ModelSchema {
    pub name: &'static str,
    /// External id prefix; `None` for models without an extid.
    pub ext_prefix: Option<&'static str>,
    pub fields: &'static [(&'static str, FieldType)],
    pub required: &'static [&'static str],
    pub unique: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    /// Rewritten from a source record (as opposed to synthesized).
    pub carries_original: bool,
}

impl ModelSchema {
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, ty)| *ty)
    }

    pub fn declares(&self, field: &str) -> bool {
        self.field_type(field).is_some()
    }

    /// Fields in `fields` missing from the declared table.
    pub fn undeclared<'f>(&self, fields: &'f FieldMap) -> Vec<&'f str> {
        fields
            .keys()
            .map(String::as_str)
            .filter(|field| !self.declares(field))
            .collect()
    }

    /// Required fields that are absent or empty.
    pub fn missing_required(&self, fields: &FieldMap) -> Vec<&'static str> {
        self.required
            .iter()
            .copied()
            .filter(|field| fields.get(*field).is_none_or(|value| value.is_empty()))
            .collect()
    }

    /// Normalize every field to its declared type.
    pub fn normalize(&self, fields: &FieldMap) -> Result<FieldMap, (String, CoerceError)> {
        let mut out = FieldMap::new();
        for (field, value) in fields {
            let ty = self.field_type(field).unwrap_or(FieldType::Verbatim);
            let normalized = ty.normalize(value).map_err(|err| (field.clone(), err))?;
            out.insert(field.clone(), normalized);
        }
        Ok(out)
    }
}

const fn f(name: &'static str, ty: FieldType) -> (&'static str, FieldType) {
    (name, ty)
}

use FieldType::{Boolean, Identifier, Integer, String as Str, Timestamp, Verbatim};

pub static CUSTOMER: ModelSchema = ModelSchema {
    name: "customer",
    ext_prefix: Some("ur"),
    fields: &[
        f("objid", Identifier),
        f("extid", Identifier),
        f("email", Str),
        f("v1_custid", Str),
        f("role", Str),
        f("planid", Str),
        f("verified", Boolean),
        f("locale", Str),
        f("secrets_created", Integer),
        f("secrets_burned", Integer),
        f("secrets_shared", Integer),
        f("emails_sent", Integer),
        f("apitoken", Verbatim),
        f("passphrase", Verbatim),
        f("passphrase_encryption", Str),
        f("contributor", Boolean),
        f("stripe_customer_id", Str),
        f("stripe_subscription_id", Str),
        f("created", Timestamp),
        f("updated", Timestamp),
        f("last_login", Timestamp),
        f("v1_key", Str),
        f("migration_status", Str),
        f("migrated_at", Timestamp),
        f("_original_record", Verbatim),
    ],
    required: &[
        "objid",
        "extid",
        "email",
        "v1_custid",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
    unique: &["email", "extid"],
    foreign_keys: &[],
    carries_original: true,
};

pub static ORGANIZATION: ModelSchema = ModelSchema {
    name: "organization",
    ext_prefix: Some("on"),
    fields: &[
        f("objid", Identifier),
        f("extid", Identifier),
        f("display_name", Str),
        f("owner_id", Identifier),
        f("contact_email", Str),
        f("is_default", Boolean),
        f("created", Timestamp),
        f("updated", Timestamp),
        f("v1_key", Str),
        f("migration_status", Str),
        f("migrated_at", Timestamp),
    ],
    required: &[
        "objid",
        "extid",
        "owner_id",
        "contact_email",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
    ],
    unique: &["extid"],
    foreign_keys: &[ForeignKey {
        field: "owner_id",
        target: "customer",
        participation: None,
    }],
    carries_original: false,
};

pub static ORG_MEMBERSHIP: ModelSchema = ModelSchema {
    name: "org_membership",
    ext_prefix: None,
    fields: &[
        f("objid", Identifier),
        f("organization_objid", Identifier),
        f("customer_objid", Identifier),
        f("role", Str),
        f("status", Str),
        f("joined_at", Timestamp),
        f("created", Timestamp),
        f("v1_key", Str),
        f("migration_status", Str),
        f("migrated_at", Timestamp),
    ],
    required: &[
        "objid",
        "organization_objid",
        "customer_objid",
        "role",
        "status",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
    ],
    unique: &[],
    foreign_keys: &[
        ForeignKey {
            field: "organization_objid",
            target: "organization",
            participation: Some("members"),
        },
        ForeignKey {
            field: "customer_objid",
            target: "customer",
            participation: Some("memberships"),
        },
    ],
    carries_original: false,
};

pub static CUSTOM_DOMAIN: ModelSchema = ModelSchema {
    name: "custom_domain",
    ext_prefix: Some("cd"),
    fields: &[
        f("objid", Identifier),
        f("extid", Identifier),
        f("display_domain", Str),
        f("org_id", Identifier),
        f("v1_custid", Str),
        f("v1_domainid", Str),
        f("base_domain", Str),
        f("subdomain", Str),
        f("trd", Str),
        f("tld", Str),
        f("sld", Str),
        f("txt_validation_host", Str),
        f("txt_validation_value", Str),
        f("status", Str),
        f("verified", Boolean),
        f("resolving", Boolean),
        f("created", Timestamp),
        f("updated", Timestamp),
        f("v1_key", Str),
        f("migration_status", Str),
        f("migrated_at", Timestamp),
        f("_original_record", Verbatim),
    ],
    required: &[
        "objid",
        "extid",
        "display_domain",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
    unique: &["display_domain", "extid"],
    foreign_keys: &[ForeignKey {
        field: "org_id",
        target: "organization",
        participation: Some("domains"),
    }],
    carries_original: true,
};

pub static SECRET: ModelSchema = ModelSchema {
    name: "secret",
    ext_prefix: Some("sc"),
    fields: &[
        f("objid", Identifier),
        f("extid", Identifier),
        f("owner_id", Identifier),
        f("v1_custid", Str),
        f("state", Str),
        f("value", Verbatim),
        f("value_encryption", Str),
        f("passphrase", Verbatim),
        f("v1_receipt_key", Str),
        f("lifespan", Integer),
        f("original_size", Integer),
        f("share_domain", Str),
        f("truncated", Boolean),
        f("created", Timestamp),
        f("updated", Timestamp),
        f("v1_key", Str),
        f("migration_status", Str),
        f("migrated_at", Timestamp),
        f("_original_record", Verbatim),
    ],
    required: &[
        "objid",
        "extid",
        "state",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
    unique: &["extid"],
    foreign_keys: &[ForeignKey {
        field: "owner_id",
        target: "customer",
        participation: Some("secrets"),
    }],
    carries_original: true,
};

pub static RECEIPT: ModelSchema = ModelSchema {
    name: "receipt",
    ext_prefix: None,
    fields: &[
        f("objid", Identifier),
        f("owner_id", Identifier),
        f("v1_custid", Str),
        f("state", Str),
        f("secret_id", Identifier),
        f("v1_secret_key", Str),
        f("secret_shortid", Str),
        f("secret_ttl", Integer),
        f("passphrase", Verbatim),
        f("recipients", Str),
        f("share_domain", Str),
        f("created", Timestamp),
        f("updated", Timestamp),
        f("previewed", Timestamp),
        f("revealed", Timestamp),
        f("burned", Timestamp),
        f("shared", Timestamp),
        f("v1_key", Str),
        f("migration_status", Str),
        f("migrated_at", Timestamp),
        f("_original_record", Verbatim),
    ],
    required: &[
        "objid",
        "state",
        "created",
        "v1_key",
        "migration_status",
        "migrated_at",
        "_original_record",
    ],
    unique: &[],
    foreign_keys: &[
        ForeignKey {
            field: "owner_id",
            target: "customer",
            participation: Some("receipts"),
        },
        ForeignKey {
            field: "secret_id",
            target: "secret",
            participation: None,
        },
    ],
    carries_original: true,
};

static V2_MODELS: [&ModelSchema; 6] = [
    &CUSTOMER,
    &ORGANIZATION,
    &ORG_MEMBERSHIP,
    &CUSTOM_DOMAIN,
    &SECRET,
    &RECEIPT,
];

pub fn v2_models() -> &'static [&'static ModelSchema] {
    &V2_MODELS
}

pub fn schema(name: &str) -> Option<&'static ModelSchema> {
    V2_MODELS.iter().copied().find(|model| model.name == name)
}
