use thiserror::Error;

use crate::index::{DocumentIndex, RecordId};
use crate::request::Position;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("placement {class_name} at {position} has no writable {field} field")]
pub struct FieldNotFound {
    pub class_name: String,
    pub position: Position,
    pub field: &'static str,
}

/// Overwrite the identifier of one record, returning what it held before.
///
/// Exactly one attribute value changes in the document. Writing the same
/// record twice keeps the last value.
pub fn apply(
    index: &mut DocumentIndex,
    record: RecordId,
    new_identifier: u16,
) -> Result<Option<u16>, FieldNotFound> {
    let (node, class_name, position) = {
        let r = index.record(record);
        (r.identifier_node, r.class_name.clone(), r.position)
    };
    let not_found = || FieldNotFound {
        class_name: class_name.clone(),
        position,
        field: "ItemId",
    };

    let node = node.ok_or_else(not_found)?;
    let previous = index
        .document
        .set_attribute(node, "value", &new_identifier.to_string())
        .ok_or_else(not_found)?;

    let target = index.record_mut(record);
    let before = target.current_identifier;
    target.current_identifier = Some(new_identifier);

    Ok(before.or_else(|| previous.trim().parse().ok()))
}

/// The full document with every mutation applied since the index was built.
pub fn serialize(index: &DocumentIndex) -> Vec<u8> {
    index.document.to_xml().into_bytes()
}
