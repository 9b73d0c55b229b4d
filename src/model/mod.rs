//! v2 model tables and shared field names.

mod schema;
mod status;

pub use schema::{
    CUSTOM_DOMAIN, CUSTOMER, CoerceError, FieldType, ForeignKey, ModelSchema, ORG_MEMBERSHIP,
    ORGANIZATION, RECEIPT, SECRET, schema, v2_models,
};
pub use status::MigrationStatus;
pub(crate) use schema::render_timestamp;

/// Owner value for records that never had an owner.
pub const ANON: &str = "anon";
/// Owner value for references that could not be resolved.
pub const UNRESOLVED: &str = "";

pub const OBJID: &str = "objid";
pub const EXTID: &str = "extid";
pub const CREATED: &str = "created";
pub const V1_KEY: &str = "v1_key";
pub const ORIGINAL_RECORD: &str = "_original_record";
pub const MIGRATION_STATUS: &str = "migration_status";
pub const MIGRATED_AT: &str = "migrated_at";

/// `{model}:{objid}:object`
pub fn object_key(model: &str, objid: &str) -> String {
    format!("{model}:{objid}:object")
}

/// `{model}:instances`
pub fn instance_index_key(model: &str) -> String {
    format!("{model}:instances")
}

/// `{model}:{field}_index`
pub fn unique_index_key(model: &str, field: &str) -> String {
    format!("{model}:{field}_index")
}

/// `{parent}:{parent_id}:{set}`
pub fn participation_key(parent: &str, parent_id: &str, set: &str) -> String {
    format!("{parent}:{parent_id}:{set}")
}
