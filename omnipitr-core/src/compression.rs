//! Compression types, their file extensions, and the external programs they
//! bind to. OmniPITR never implements compression itself — it shells out to
//! `gzip`/`bzip2`/`lzma` (or whatever `--*-path` overrides to) the same way
//! `bestool`'s backup action shells out to `pg_dump` via [`duct`].

use std::{
	fs::{self, File},
	path::{Path, PathBuf},
};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompressionType {
	None,
	Gzip,
	Bzip2,
	Lzma,
}

impl CompressionType {
	pub fn extension(self) -> &'static str {
		match self {
			Self::None => "",
			Self::Gzip => ".gz",
			Self::Bzip2 => ".bz2",
			Self::Lzma => ".lzma",
		}
	}

	pub fn program_name(self) -> &'static str {
		match self {
			Self::None => "cat",
			Self::Gzip => "gzip",
			Self::Bzip2 => "bzip2",
			Self::Lzma => "lzma",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"none" | "" => Ok(Self::None),
			"gzip" | "gz" => Ok(Self::Gzip),
			"bzip2" | "bz2" => Ok(Self::Bzip2),
			"lzma" | "xz" => Ok(Self::Lzma),
			other => Err(Error::Configuration(format!(
				"unknown compression type: {other:?}"
			))),
		}
	}
}

/// A compression type bound to a concrete program path, e.g. `gzip` bound to
/// `/usr/bin/pigz` via `--gzip-path`.
#[derive(Debug, Clone)]
pub struct CompressionBinding {
	pub kind: CompressionType,
	pub program: PathBuf,
}

impl CompressionBinding {
	pub fn new(kind: CompressionType, program: Option<&Path>) -> Self {
		Self {
			kind,
			program: program
				.map(Path::to_path_buf)
				.unwrap_or_else(|| PathBuf::from(kind.program_name())),
		}
	}

	/// Compress `source` into `dest` (`dest` should already carry
	/// `kind.extension()`), preserving the source's mtime/atime as spec §4.1
	/// operation 3 requires.
	pub fn compress(&self, source: &Path, dest: &Path) -> Result<()> {
		if self.kind == CompressionType::None {
			fs::copy(source, dest).map_err(|e| Error::io(dest, e))?;
		} else {
			let input = File::open(source).map_err(|e| Error::io(source, e))?;
			let output = File::create(dest).map_err(|e| Error::io(dest, e))?;
			duct::cmd!(&self.program, "-c")
				.stdin_file(input)
				.stdout_file(output)
				.run()
				.map_err(|e| Error::transient(self.program.display().to_string(), e))?;
		}
		preserve_times(source, dest)?;
		Ok(())
	}

	/// The shell-ready decompression invocation for `restore`: `cat` for
	/// `none`, otherwise `<program> -dc` so it can be redirected from/to a
	/// file by the caller.
	pub fn decompress_argv(&self) -> Vec<String> {
		if self.kind == CompressionType::None {
			vec!["cat".into()]
		} else {
			vec![self.program.display().to_string(), "-dc".into()]
		}
	}
}

fn preserve_times(source: &Path, dest: &Path) -> Result<()> {
	let meta = fs::metadata(source).map_err(|e| Error::io(source, e))?;
	let accessed = meta.accessed().unwrap_or_else(|_| meta.modified().unwrap());
	let modified = meta.modified().map_err(|e| Error::io(source, e))?;
	let times = fs::FileTimes::new().set_accessed(accessed).set_modified(modified);
	File::options()
		.write(true)
		.open(dest)
		.map_err(|e| Error::io(dest, e))?
		.set_times(times)
		.map_err(|e| Error::io(dest, e))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extension_table() {
		assert_eq!(CompressionType::None.extension(), "");
		assert_eq!(CompressionType::Gzip.extension(), ".gz");
		assert_eq!(CompressionType::Bzip2.extension(), ".bz2");
		assert_eq!(CompressionType::Lzma.extension(), ".lzma");
	}

	#[test]
	fn parse_roundtrip() {
		assert_eq!(CompressionType::parse("gzip").unwrap(), CompressionType::Gzip);
		assert!(CompressionType::parse("rot13").is_err());
	}

	#[test]
	fn compress_none_copies_and_preserves_mtime() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("seg");
		fs::write(&src, b"hello").unwrap();
		let dest = dir.path().join("seg.copy");

		let binding = CompressionBinding::new(CompressionType::None, None);
		binding.compress(&src, &dest).unwrap();

		assert_eq!(fs::read(&dest).unwrap(), b"hello");
		let src_mtime = fs::metadata(&src).unwrap().modified().unwrap();
		let dest_mtime = fs::metadata(&dest).unwrap().modified().unwrap();
		assert_eq!(src_mtime, dest_mtime);
	}
}
