//! PE directory reading (component B): header validation, export/import
//! directory walks, and base relocation. See `headers.rs`, `exports.rs`,
//! `imports.rs`, `relocation.rs`.

pub mod exports;
pub mod headers;
pub mod imports;
pub mod relocation;

pub use headers::{HeaderError, PeView};
