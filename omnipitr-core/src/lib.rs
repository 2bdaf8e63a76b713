//! Shared orchestration primitives for OmniPITR: WAL segment naming, the
//! compression and destination vocabularies, the archive state file, digest
//! computation, the shell pipe builder, the parallel process supervisor,
//! `pg_controldata` parsing, backup-label synthesis and filename templates.

pub mod backup_label;
pub mod compression;
pub mod destination;
pub mod digest;
pub mod error;
pub mod pgcontrol;
pub mod pipeline;
pub mod segment;
pub mod state;
pub mod supervisor;
pub mod template;

pub use error::{Error, Result};
