use crate::model::EntityKind;

/// A foreign reference carried by one entity kind to another. The id lives
/// both in a column (`column`) and in the JSON payload (`field`), so an
/// identity remap has to rewrite both, plus any queued payload carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub from: EntityKind,
    pub column: &'static str,
    pub field: &'static str,
    pub to: EntityKind,
}

pub const REFERENCES: &[Reference] = &[Reference {
    from: EntityKind::Task,
    column: "project_id",
    field: "projectId",
    to: EntityKind::Project,
}];

/// References pointing at rows of `kind`.
pub fn references_to(kind: EntityKind) -> impl Iterator<Item = &'static Reference> {
    REFERENCES.iter().filter(move |r| r.to == kind)
}

/// References held by rows of `kind`.
pub fn references_from(kind: EntityKind) -> impl Iterator<Item = &'static Reference> {
    REFERENCES.iter().filter(move |r| r.from == kind)
}

/// Entity columns in the order `repository::row_to_record` reads them.
pub const ENTITY_COLUMNS: &str =
    "id, local_id, data, sync_status, is_deleted, created_at, updated_at";

/// Every table cleared on logout.
pub fn purgeable_tables() -> impl Iterator<Item = &'static str> {
    EntityKind::ALL
        .into_iter()
        .map(|k| k.table())
        .chain(std::iter::once("sync_queue"))
}
