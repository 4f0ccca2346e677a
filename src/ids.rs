//! Opaque identifiers. All entity ids in this crate are UUID v4 strings.

use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
