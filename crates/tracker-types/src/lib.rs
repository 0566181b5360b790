//! Core types and traits for the outreach tracker.
//!
//! Tracked rows are plain JSON objects ([`Snapshot`]); every mutation of a row produces one
//! [`AuditRecord`] in the same unit of work.

mod audit;
mod dto;
mod table;
mod traits;

pub use audit::*;
pub use dto::*;
pub use table::*;
pub use traits::*;
