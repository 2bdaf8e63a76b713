//! The per-segment archive state file (spec §3): lazily created when a
//! segment needs compression or multi-destination fan-out, deleted only
//! once every declared destination has the segment. This is what makes
//! repeated `archive` invocations for the same segment idempotent (P1) and
//! resumable (P2).

use std::{
	collections::{BTreeMap, BTreeSet},
	fs,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
	compression::CompressionType,
	destination::DestinationKind,
	error::{Error, Result},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveState {
	/// Compression type name -> hex md5 of the compressed artifact.
	#[serde(default)]
	compressed: BTreeMap<String, String>,
	/// Destination kind -> set of destination paths already delivered.
	#[serde(default)]
	sent: BTreeMap<String, BTreeSet<String>>,
}

impl ArchiveState {
	pub fn path_for(state_dir: &Path, segment_name: &str) -> PathBuf {
		state_dir.join(segment_name)
	}

	/// Loads the state file if it exists; a missing file is not an error,
	/// it just means nothing has been recorded yet for this segment.
	pub fn load(state_dir: &Path, segment_name: &str) -> Result<Option<Self>> {
		let path = Self::path_for(state_dir, segment_name);
		match fs::read(&path) {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(Error::io(path, e)),
		}
	}

	pub fn load_or_default(state_dir: &Path, segment_name: &str) -> Result<Self> {
		Ok(Self::load(state_dir, segment_name)?.unwrap_or_default())
	}

	/// Writes the state file atomically: serialize to a sibling temp file in
	/// the same directory, then rename over the target, so a concurrent
	/// reader (or a crash mid-write) never observes a partial file.
	pub fn save_atomic(&self, state_dir: &Path, segment_name: &str) -> Result<()> {
		fs::create_dir_all(state_dir).map_err(|e| Error::io(state_dir, e))?;
		let path = Self::path_for(state_dir, segment_name);
		let tmp = state_dir.join(format!(".{segment_name}.{}.tmp", Uuid::new_v4()));
		let bytes = serde_json::to_vec_pretty(self)?;
		fs::write(&tmp, &bytes).map_err(|e| Error::io(&tmp, e))?;
		fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
		Ok(())
	}

	pub fn delete(state_dir: &Path, segment_name: &str) -> Result<()> {
		let path = Self::path_for(state_dir, segment_name);
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(Error::io(path, e)),
		}
	}

	pub fn compressed_md5(&self, kind: CompressionType) -> Option<&str> {
		self.compressed.get(kind.program_name()).map(String::as_str)
	}

	pub fn set_compressed_md5(&mut self, kind: CompressionType, md5: impl Into<String>) {
		self.compressed.insert(kind.program_name().to_owned(), md5.into());
	}

	pub fn is_sent(&self, kind: DestinationKind, path: &str) -> bool {
		self.sent
			.get(kind.as_str())
			.is_some_and(|paths| paths.contains(path))
	}

	pub fn mark_sent(&mut self, kind: DestinationKind, path: impl Into<String>) {
		self.sent
			.entry(kind.as_str().to_owned())
			.or_default()
			.insert(path.into());
	}

	/// True once every one of `destinations` is recorded in `sent` — the
	/// condition under which the whole state file can be deleted (spec §3
	/// lifecycle, invariant I1).
	pub fn all_sent<'a>(
		&self,
		destinations: impl IntoIterator<Item = (DestinationKind, &'a str)>,
	) -> bool {
		destinations
			.into_iter()
			.all(|(kind, path)| self.is_sent(kind, path))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrips_through_disk() {
		let dir = tempfile::tempdir().unwrap();
		let mut state = ArchiveState::default();
		state.set_compressed_md5(CompressionType::Gzip, "deadbeef");
		state.mark_sent(DestinationKind::Local, "/a/");
		state.save_atomic(dir.path(), "seg1").unwrap();

		let loaded = ArchiveState::load(dir.path(), "seg1").unwrap().unwrap();
		assert_eq!(loaded.compressed_md5(CompressionType::Gzip), Some("deadbeef"));
		assert!(loaded.is_sent(DestinationKind::Local, "/a/"));
		assert!(!loaded.is_sent(DestinationKind::Local, "/b/"));
	}

	#[test]
	fn missing_file_loads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		assert!(ArchiveState::load(dir.path(), "nope").unwrap().is_none());
	}

	#[test]
	fn delete_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		ArchiveState::delete(dir.path(), "nope").unwrap();
		ArchiveState::delete(dir.path(), "nope").unwrap();
	}

	#[test]
	fn all_sent_checks_every_destination() {
		let mut state = ArchiveState::default();
		state.mark_sent(DestinationKind::Local, "/a/");
		assert!(!state.all_sent([(DestinationKind::Local, "/a/"), (DestinationKind::Remote, "h:/b/")]));
		state.mark_sent(DestinationKind::Remote, "h:/b/");
		assert!(state.all_sent([(DestinationKind::Local, "/a/"), (DestinationKind::Remote, "h:/b/")]));
	}
}
