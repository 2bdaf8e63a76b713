//! Destination descriptors: where a compressed (or raw) artifact ends up,
//! and how it got there. Parses the `[CMP=]path` CLI grammar shared by
//! `--dst-local`, `--dst-remote` and `--dst-pipe`.

use crate::compression::CompressionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
	Local,
	Remote,
	Pipe,
	/// The distinguished `dst-backup` path: failures here are logged, not
	/// fatal (spec §4.1 operation 4).
	Direct,
}

impl DestinationKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Local => "local",
			Self::Remote => "remote",
			Self::Pipe => "pipe",
			Self::Direct => "direct",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
	pub kind: DestinationKind,
	pub path: String,
	pub compression: CompressionType,
}

impl Destination {
	pub fn local(spec: &str) -> Result<Self, String> {
		Self::with_kind(DestinationKind::Local, spec)
	}

	pub fn remote(spec: &str) -> Result<Self, String> {
		Self::with_kind(DestinationKind::Remote, spec)
	}

	pub fn pipe(spec: &str) -> Result<Self, String> {
		Self::with_kind(DestinationKind::Pipe, spec)
	}

	pub fn backup(path: &str) -> Self {
		Self {
			kind: DestinationKind::Direct,
			path: path.to_owned(),
			compression: CompressionType::None,
		}
	}

	fn with_kind(kind: DestinationKind, spec: &str) -> Result<Self, String> {
		let (compression, path) = split_compression_prefix(spec);
		if path.is_empty() {
			return Err(format!("empty destination path in {spec:?}"));
		}
		Ok(Self {
			kind,
			path: path.to_owned(),
			compression,
		})
	}

	/// The key this destination is recorded under in
	/// [`state::ArchiveState::sent`](crate::state::ArchiveState::sent): kind
	/// plus path, since the same path could in principle appear under two
	/// kinds (unlikely, but the state file keys on both per spec §3).
	pub fn sent_key(&self) -> (&'static str, &str) {
		(self.kind.as_str(), &self.path)
	}
}

/// Splits a `[CMP=]rest` spec. Only strips the prefix if the text before the
/// first `=` is a recognised compression type name, so that values like
/// `user@host:/path` (no `=`) or pipe programs with `=` in their arguments
/// are left alone.
fn split_compression_prefix(spec: &str) -> (CompressionType, &str) {
	if let Some((prefix, rest)) = spec.split_once('=') {
		if let Ok(kind) = CompressionType::parse(prefix) {
			return (kind, rest);
		}
	}
	(CompressionType::None, spec)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_local_path_defaults_to_none() {
		let dst = Destination::local("/var/lib/wal-archive/").unwrap();
		assert_eq!(dst.compression, CompressionType::None);
		assert_eq!(dst.path, "/var/lib/wal-archive/");
	}

	#[test]
	fn compressed_local_path() {
		let dst = Destination::local("gzip=/var/lib/wal-archive-gz/").unwrap();
		assert_eq!(dst.compression, CompressionType::Gzip);
		assert_eq!(dst.path, "/var/lib/wal-archive-gz/");
	}

	#[test]
	fn remote_path_with_equals_free_spec_is_untouched() {
		let dst = Destination::remote("user@host:/data/wal/").unwrap();
		assert_eq!(dst.compression, CompressionType::None);
		assert_eq!(dst.path, "user@host:/data/wal/");
	}

	#[test]
	fn backup_destination_is_direct_kind() {
		let dst = Destination::backup("/var/lib/wal-archive/dst-backup/");
		assert_eq!(dst.kind, DestinationKind::Direct);
	}
}
