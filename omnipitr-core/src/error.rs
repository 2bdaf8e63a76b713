use std::path::PathBuf;

/// Errors shared by every OmniPITR orchestration primitive.
///
/// Variants line up with the error-kind table in the design: `Configuration`
/// and `Precondition` are always fatal, `TransientIo` is fatal for
/// archive/backup but retried by restore's polling loop, `BackupDestination`
/// is logged and otherwise ignored, `StateCorruption` triggers silent
/// recompression, and `ExternalCoordination` is backed off rather than
/// killing the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("configuration: {0}")]
	Configuration(String),

	#[error("precondition failed: {0}")]
	Precondition(String),

	#[error("transient I/O failure running {program}: {source}")]
	TransientIo {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("destination {path} failed: {source}")]
	BackupDestination {
		path: String,
		#[source]
		source: Box<Error>,
	},

	#[error("cached artifact at {path} no longer matches its recorded checksum")]
	StateCorruption { path: PathBuf },

	#[error("external coordination failure: {0}")]
	ExternalCoordination(String),

	#[error("io error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}

	pub fn transient(program: impl Into<String>, source: std::io::Error) -> Self {
		Self::TransientIo {
			program: program.into(),
			source,
		}
	}

	/// True for the one class of failure the archive pipeline is allowed to
	/// log and ignore: the distinguished `dst-backup` destination.
	pub fn is_backup_destination_only(&self) -> bool {
		matches!(self, Self::BackupDestination { .. })
	}
}
