//! Digest registry backing the archive state file's cached-artifact
//! checksums (always md5, spec §3) and the backup engine's configurable
//! `--digest=a,b,…` outputs (spec §6). Streaming update is modelled the
//! same way `bestool::actions::tamanu::backup::copy_into_chunks` streams
//! bytes through a `blake3::Hasher` while copying.

use std::{fs::File, io::Read, path::Path};

use crc32c::Crc32cHasher;
use md5::{Digest as _, Md5};
use sha2::Sha256;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
	Md5,
	Sha256,
	Crc32c,
	Blake3,
}

impl DigestAlgorithm {
	pub fn name(self) -> &'static str {
		match self {
			Self::Md5 => "md5",
			Self::Sha256 => "sha256",
			Self::Crc32c => "crc32c",
			Self::Blake3 => "blake3",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s.to_ascii_lowercase().as_str() {
			"md5" => Ok(Self::Md5),
			"sha256" | "sha2" => Ok(Self::Sha256),
			"crc32c" | "crc32" => Ok(Self::Crc32c),
			"blake3" | "b3" => Ok(Self::Blake3),
			other => Err(Error::Configuration(format!("unknown digest algorithm: {other:?}"))),
		}
	}
}

/// An in-progress streaming digest: one of these per algorithm is fed bytes
/// as they flow through the backup engine's tee, then finalized to hex.
pub enum StreamingDigest {
	Md5(Md5),
	Sha256(Sha256),
	Crc32c(Crc32cHasher),
	Blake3(blake3::Hasher),
}

impl StreamingDigest {
	pub fn new(algorithm: DigestAlgorithm) -> Self {
		match algorithm {
			DigestAlgorithm::Md5 => Self::Md5(Md5::new()),
			DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
			DigestAlgorithm::Crc32c => Self::Crc32c(Crc32cHasher::default()),
			DigestAlgorithm::Blake3 => Self::Blake3(blake3::Hasher::new()),
		}
	}

	pub fn update(&mut self, bytes: &[u8]) {
		match self {
			Self::Md5(h) => h.update(bytes),
			Self::Sha256(h) => h.update(bytes),
			Self::Crc32c(h) => {
				use std::hash::Hasher as _;
				h.write(bytes)
			}
			Self::Blake3(h) => {
				h.update(bytes);
			}
		}
	}

	pub fn finalize_hex(self) -> String {
		match self {
			Self::Md5(h) => hex::encode(h.finalize()),
			Self::Sha256(h) => hex::encode(h.finalize()),
			Self::Crc32c(h) => {
				use std::hash::Hasher as _;
				format!("{:08x}", h.finish() as u32)
			}
			Self::Blake3(h) => h.finalize().to_hex().to_string(),
		}
	}
}

/// Hex md5 of a whole file, read in fixed-size chunks. Used for the archive
/// state file's `compressed[type]` entries (invariant I2).
pub fn hex_md5_of_file(path: &Path) -> Result<String> {
	let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
	let mut hasher = Md5::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hex::encode(hasher.finalize()))
}

/// Computes every requested digest over a file in one pass.
pub fn digest_file(path: &Path, algorithms: &[DigestAlgorithm]) -> Result<Vec<(DigestAlgorithm, String)>> {
	let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
	let mut streams: Vec<(DigestAlgorithm, StreamingDigest)> = algorithms
		.iter()
		.map(|&a| (a, StreamingDigest::new(a)))
		.collect();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
		if n == 0 {
			break;
		}
		for (_, stream) in streams.iter_mut() {
			stream.update(&buf[..n]);
		}
	}
	Ok(streams
		.into_iter()
		.map(|(a, s)| (a, s.finalize_hex()))
		.collect())
}

/// Writes `<digest>  <filename>\n` sidecar files, one per algorithm, next to
/// `artifact`, the conventional `*sum`-tool output format.
pub fn write_digest_files(
	artifact: &Path,
	algorithms: &[DigestAlgorithm],
) -> Result<Vec<(DigestAlgorithm, std::path::PathBuf)>> {
	let digests = digest_file(artifact, algorithms)?;
	let filename = artifact
		.file_name()
		.and_then(|n| n.to_str())
		.ok_or_else(|| Error::Configuration(format!("artifact path has no filename: {artifact:?}")))?;
	let mut written = Vec::new();
	for (algorithm, hex) in digests {
		let sidecar = artifact.with_file_name(format!("{filename}.{}", algorithm.name()));
		std::fs::write(&sidecar, format!("{hex}  {filename}\n")).map_err(|e| Error::io(&sidecar, e))?;
		written.push((algorithm, sidecar));
	}
	Ok(written)
}
