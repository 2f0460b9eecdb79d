//! The backup catalog.
//!
//! Persists task, file-inventory, tape and backup-set records in an
//! embedded SQL engine. Every write is linearized through a single
//! writer thread behind a two-priority queue; reads run in parallel on a
//! separate connection.
//!
//! Each non-template task owns a physical inventory table
//! (`backup_files_<taskid>`) cloned from `backup_files_template`; the
//! `backup_files_groups` sidecar maps task ids to table names.

mod batch_update;
pub use batch_update::{mark_files_queued_tx, verify_files_queued_tx};

mod schema;
pub(crate) use schema::*;

mod store;
pub use store::*;

mod writer;
pub use writer::{CatalogWriter, Pending, Priority};
