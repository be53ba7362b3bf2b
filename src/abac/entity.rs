use crate::abac::types::TableEntityId;
use crate::formula::{AttributeBag, FieldDef};

/// A typed row the engine can filter, check and mask.
///
/// `fields` lists every column with its kind; it drives type checking of
/// conditions against the entity and the masking of hidden fields.
pub trait FilterableEntity {
    fn table_entity() -> TableEntityId
    where
        Self: Sized;

    fn fields() -> &'static [FieldDef]
    where
        Self: Sized;

    fn record_id(&self) -> String;

    fn attributes(&self) -> AttributeBag;

    /// Set a field to its absent value. Returns false for unknown fields.
    fn clear_field(&mut self, field: &str) -> bool;
}
