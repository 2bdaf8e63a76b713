//! `archive` subcommand: PostgreSQL's `archive_command` entry point (spec
//! §4.1).

use std::path::{Path, PathBuf};

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use omnipitr_core::{
	compression::{CompressionBinding, CompressionType},
	destination::{Destination, DestinationKind},
	digest::hex_md5_of_file,
	segment::ArchiveEntry,
	state::ArchiveState,
	supervisor::{self, JobResult, JobSpec},
};
use tracing::{debug, info, warn};

use crate::{actions::Context, args::LoggingArgs};

/// Archive one completed WAL segment to every configured destination.
#[derive(Debug, Clone, Parser)]
pub struct ArchiveArgs {
	/// The PostgreSQL data directory; segments are read from `<dir>/pg_xlog/<segment>`
	#[arg(long, env = "OMNIPITR_DATA_DIR")]
	pub data_dir: Option<PathBuf>,

	/// A local filesystem destination, optionally `CMP=path`
	#[arg(long = "dst-local", value_name = "[CMP=]PATH", value_parser = Destination::local)]
	pub dst_local: Vec<Destination>,

	/// A remote rsync destination, optionally `CMP=user@host:path`
	#[arg(long = "dst-remote", value_name = "[CMP=]USER@HOST:PATH", value_parser = Destination::remote)]
	pub dst_remote: Vec<Destination>,

	/// A pipe-to-program destination, optionally `CMP=program`
	#[arg(long = "dst-pipe", value_name = "[CMP=]PROG", value_parser = Destination::pipe)]
	pub dst_pipe: Vec<Destination>,

	/// A destination whose failures are logged but never fatal
	#[arg(long = "dst-backup", value_name = "PATH")]
	pub dst_backup: Option<String>,

	/// Directory holding per-segment delivery state
	#[arg(long, value_name = "DIR")]
	pub state_dir: Option<PathBuf>,

	/// Directory used to stage compressed artifacts
	#[arg(long, value_name = "DIR", default_value = "/tmp")]
	pub temp_dir: PathBuf,

	/// Maximum concurrent deliveries
	#[arg(long, default_value_t = 2)]
	pub parallel_jobs: usize,

	#[arg(long, default_value = "gzip")]
	pub gzip_path: PathBuf,
	#[arg(long, default_value = "bzip2")]
	pub bzip2_path: PathBuf,
	#[arg(long, default_value = "lzma")]
	pub lzma_path: PathBuf,
	#[arg(long, default_value = "rsync")]
	pub rsync_path: PathBuf,
	#[arg(long, default_value = "nice")]
	pub nice_path: PathBuf,

	/// Don't prefix delivery commands with `nice`
	#[arg(long)]
	pub not_nice: bool,

	/// Don't validate `--data-dir` exists before use
	#[arg(long)]
	pub force_data_dir: bool,

	#[command(flatten)]
	pub logging: LoggingArgs,

	/// The segment (or `.history`/`.backup` sentinel) name to archive
	pub segment: String,
}

pub async fn run(ctx: Context<(), ArchiveArgs>) -> Result<()> {
	let args = ctx.args_sub;
	let _guard = crate::logging::setup(&args.logging, "omnipitr-archive")?;

	let entry = ArchiveEntry::parse(&args.segment).map_err(to_report)?;

	let source = resolve_source(&args, &entry.name())?;
	if let ArchiveEntry::Segment(_) = &entry {
		let len = std::fs::metadata(&source)
			.into_diagnostic()
			.wrap_err_with(|| format!("statting segment {source:?}"))?
			.len();
		if len != omnipitr_core::segment::SEGMENT_BYTES {
			return Err(miette!(
				"segment {source:?} is {len} bytes, expected {}",
				omnipitr_core::segment::SEGMENT_BYTES
			));
		}
	}

	let destinations = collect_destinations(&args);
	if destinations.is_empty() {
		return Err(miette!("no destinations configured"));
	}

	if needs_state_dir(&destinations) && args.state_dir.is_none() {
		return Err(miette!(
			"multiple destinations require --state-dir (invariant I3)"
		));
	}

	let mut state = match &args.state_dir {
		Some(dir) => ArchiveState::load_or_default(dir, &entry.name()).map_err(to_report)?,
		None => ArchiveState::default(),
	};

	std::fs::create_dir_all(&args.temp_dir)
		.into_diagnostic()
		.wrap_err("creating temp-dir")?;

	let required: std::collections::BTreeSet<CompressionType> =
		destinations.iter().map(|d| d.compression).collect();

	for kind in required.iter().copied().filter(|k| *k != CompressionType::None) {
		let artifact = args.temp_dir.join(format!("{}{}", entry.name(), kind.extension()));
		let cached_ok = state.compressed_md5(kind).is_some()
			&& artifact.exists()
			&& hex_md5_of_file(&artifact).ok().as_deref() == state.compressed_md5(kind);
		if cached_ok {
			debug!(?kind, "reusing cached compressed artifact");
			continue;
		}

		let program = match kind {
			CompressionType::Gzip => &args.gzip_path,
			CompressionType::Bzip2 => &args.bzip2_path,
			CompressionType::Lzma => &args.lzma_path,
			CompressionType::None => unreachable!(),
		};
		info!(?kind, ?artifact, "compressing segment");
		CompressionBinding::new(kind, Some(program))
			.compress(&source, &artifact)
			.map_err(to_report)?;

		let md5 = hex_md5_of_file(&artifact).map_err(to_report)?;
		state.set_compressed_md5(kind, md5);
		if let Some(dir) = &args.state_dir {
			state.save_atomic(dir, &entry.name()).map_err(to_report)?;
		}
	}

	let mut jobs = Vec::new();
	for dest in &destinations {
		if state.is_sent(dest.kind, &dest.path) {
			continue;
		}
		let file = if dest.compression == CompressionType::None {
			source.clone()
		} else {
			args.temp_dir.join(format!("{}{}", entry.name(), dest.compression.extension()))
		};
		jobs.push(build_job(&args, dest, &file));
	}

	let results = supervisor::run(
		jobs,
		args.parallel_jobs.max(1),
		|dest: &Destination| debug!(kind=?dest.kind, path=%dest.path, "starting delivery"),
		|_: &JobResult<Destination>| {},
	)
	.await;

	let mut fatal = false;
	for result in &results {
		let dest = &result.user;
		if result.success() {
			state.mark_sent(dest.kind, dest.path.clone());
		} else if dest.kind == DestinationKind::Direct {
			warn!(path=%dest.path, stderr=%String::from_utf8_lossy(&result.stderr), "backup-destination delivery failed (ignored)");
		} else {
			warn!(kind=?dest.kind, path=%dest.path, stderr=%String::from_utf8_lossy(&result.stderr), "delivery failed");
			fatal = true;
		}
	}

	if fatal {
		if let Some(dir) = &args.state_dir {
			state.save_atomic(dir, &entry.name()).map_err(to_report)?;
		}
		return Err(miette!("one or more non-backup destinations failed"));
	}

	if let Some(dir) = &args.state_dir {
		ArchiveState::delete(dir, &entry.name()).map_err(to_report)?;
	}
	for kind in required.iter().copied().filter(|k| *k != CompressionType::None) {
		let artifact = args.temp_dir.join(format!("{}{}", entry.name(), kind.extension()));
		let _ = std::fs::remove_file(artifact);
	}

	Ok(())
}

/// Invariant I3: a state file is mandatory once more than one destination
/// is configured, `dst-backup` included — its own `sent` bookkeeping is
/// lost between invocations just like any other destination's.
fn needs_state_dir(destinations: &[Destination]) -> bool {
	destinations.len() > 1
}

fn resolve_source(args: &ArchiveArgs, segment_name: &str) -> Result<PathBuf> {
	let path = match &args.data_dir {
		Some(dir) => dir.join("pg_xlog").join(segment_name),
		None => PathBuf::from(segment_name),
	};
	if !args.force_data_dir && args.data_dir.is_some() && !path.exists() {
		return Err(miette!("segment not found at {path:?}"));
	}
	Ok(path)
}

fn collect_destinations(args: &ArchiveArgs) -> Vec<Destination> {
	let mut out = Vec::new();
	out.extend(args.dst_local.iter().cloned());
	out.extend(args.dst_remote.iter().cloned());
	out.extend(args.dst_pipe.iter().cloned());
	if let Some(spec) = &args.dst_backup {
		out.push(Destination::backup(spec));
	}
	out
}

fn build_job(args: &ArchiveArgs, dest: &Destination, file: &Path) -> JobSpec<Destination> {
	match dest.kind {
		DestinationKind::Local | DestinationKind::Remote | DestinationKind::Direct => {
			let mut argv: Vec<String> = Vec::new();
			if !args.not_nice {
				argv.push(args.nice_path.display().to_string());
			}
			argv.push(args.rsync_path.display().to_string());
			argv.push("-t".to_string());
			argv.push(file.display().to_string());
			argv.push(dest.path.clone());
			JobSpec::new(argv, dest.clone())
		}
		DestinationKind::Pipe => {
			let basename = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
			JobSpec::new(vec![dest.path.clone(), basename], dest.clone()).with_stdin_file(file)
		}
	}
}

fn to_report(e: omnipitr_core::Error) -> miette::Report {
	miette::Report::msg(e.to_string())
}
