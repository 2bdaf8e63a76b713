//! `restore` subcommand: PostgreSQL's `restore_command` entry point, plus
//! the embedded retention/cleanup pass (spec §4.5).

use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use omnipitr_core::{
	compression::{CompressionBinding, CompressionType},
	segment::{ArchiveEntry, WalSegment},
};
use tracing::{debug, info, warn};

use crate::{actions::Context, args::LoggingArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PgControlDataErrorPolicy {
	Break,
	Ignore,
	Hang,
}

#[derive(Debug, Clone, Parser)]
pub struct RestoreArgs {
	/// The archive directory `restore_command` pulls segments from, optionally `CMP=DIR`
	#[arg(long, value_name = "[CMP=]DIR")]
	pub source: String,

	/// Don't deliver a segment whose mtime is newer than `now - delay`
	#[arg(long, default_value_t = 0)]
	pub recovery_delay: u64,

	/// File whose content (`NOW` vs. anything else) selects immediate vs. smart finish
	#[arg(long, value_name = "FILE")]
	pub finish_trigger: Option<PathBuf>,

	/// File whose presence tells retention to stand down (set by a concurrent backup)
	#[arg(long, value_name = "FILE")]
	pub removal_pause_trigger: Option<PathBuf>,

	/// Program run (via the shell) on each segment just before it's removed
	#[arg(long, value_name = "CMD")]
	pub pre_removal_processing: Option<String>,

	/// Cap on segments removed per retention pass
	#[arg(long, default_value_t = 1000)]
	pub remove_at_a_time: usize,

	/// Explicit retention boundary; segments lexicographically before this are eligible
	#[arg(long, value_name = "SEG")]
	pub remove_unneeded: Option<String>,

	/// Run one retention pass before the main wait loop
	#[arg(long)]
	pub remove_before: bool,

	/// Give up (fatal-exit) instead of waiting, so PostgreSQL can fail over to streaming replication
	#[arg(long)]
	pub streaming_replication: bool,

	/// How to react when `pg_controldata` can't be invoked during retention
	#[arg(long, value_enum, default_value_t = PgControlDataErrorPolicy::Hang)]
	pub error_pgcontroldata: PgControlDataErrorPolicy,

	/// The PostgreSQL data directory (for `pg_controldata` during retention)
	#[arg(long, env = "OMNIPITR_DATA_DIR")]
	pub data_dir: PathBuf,

	#[arg(long, default_value = "pg_controldata")]
	pub pgcontroldata_path: PathBuf,
	#[arg(long, default_value = "gzip")]
	pub gzip_path: PathBuf,
	#[arg(long, default_value = "bzip2")]
	pub bzip2_path: PathBuf,
	#[arg(long, default_value = "lzma")]
	pub lzma_path: PathBuf,
	#[arg(long, default_value = "sh")]
	pub shell_path: PathBuf,
	#[arg(long, value_name = "DIR", default_value = "/tmp")]
	pub temp_dir: PathBuf,

	#[command(flatten)]
	pub logging: LoggingArgs,

	/// The segment PostgreSQL is asking for
	pub segment: String,
	/// Where PostgreSQL wants the segment copied (relative to the data directory)
	pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishMode {
	None,
	Smart,
	Immediate,
}

pub async fn run(ctx: Context<(), RestoreArgs>) -> Result<()> {
	let args = ctx.args_sub;
	let guard = crate::logging::setup(&args.logging, "omnipitr-restore")?;

	let (compression, source_dir) = split_source(&args.source);

	if args.remove_before {
		retention_pass(&args).await?;
	}

	loop {
		let mode = finish_mode(&args)?;
		if mode == FinishMode::Immediate {
			return Err(miette!("finish-trigger requests immediate finish"));
		}

		let archived = find_archived(&source_dir, compression, &args.segment);
		if let Some(archived_path) = archived {
			let meta = std::fs::metadata(&archived_path).into_diagnostic().wrap_err_with(|| format!("statting {archived_path:?}"))?;
			let modified = meta.modified().into_diagnostic().wrap_err("reading archived segment mtime")?;
			let too_new = modified
				.elapsed()
				.map(|age| age < Duration::from_secs(args.recovery_delay))
				.unwrap_or(false);

			if too_new {
				debug!(segment = %args.segment, "recovery-delay not yet satisfied");
				tokio::time::sleep(Duration::from_secs(1)).await;
				continue;
			}

			deliver(&args, &archived_path, compression)?;
			info!(segment = %args.segment, "restored");
			return Ok(());
		}

		if mode == FinishMode::Smart {
			return Err(miette!("finish-trigger set and segment {} not present", args.segment));
		}

		if ArchiveEntry::parse(&args.segment).ok().map(|e| matches!(e, ArchiveEntry::History(_))).unwrap_or(false) {
			// Per spec: a missing .history file exits 1 without being logged
			// as a fatal error — PostgreSQL asks for these speculatively.
			info!(segment = %args.segment, "history file not in archive");
			drop(guard);
			std::process::exit(1);
		}

		if args.streaming_replication {
			return Err(miette!("segment {} absent; deferring to streaming replication", args.segment));
		}

		tokio::time::sleep(Duration::from_secs(1)).await;
		retention_pass(&args).await?;
	}
}

fn split_source(spec: &str) -> (CompressionType, String) {
	if let Some((prefix, rest)) = spec.split_once('=') {
		if let Ok(kind) = CompressionType::parse(prefix) {
			return (kind, rest.to_string());
		}
	}
	(CompressionType::None, spec.to_string())
}

fn finish_mode(args: &RestoreArgs) -> Result<FinishMode> {
	let Some(trigger) = &args.finish_trigger else {
		return Ok(FinishMode::None);
	};
	match std::fs::read_to_string(trigger) {
		Ok(content) if content.trim_end() == "NOW" => Ok(FinishMode::Immediate),
		Ok(_) => Ok(FinishMode::Smart),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FinishMode::None),
		Err(e) => Err(e).into_diagnostic().wrap_err("reading finish-trigger"),
	}
}

fn find_archived(source_dir: &str, compression: CompressionType, segment: &str) -> Option<PathBuf> {
	let candidate = PathBuf::from(source_dir).join(format!("{segment}{}", compression.extension()));
	candidate.exists().then_some(candidate)
}

fn deliver(args: &RestoreArgs, archived_path: &std::path::Path, compression: CompressionType) -> Result<()> {
	let binding = CompressionBinding::new(compression, Some(program_path(args, compression)));
	if compression == CompressionType::None {
		std::fs::copy(archived_path, &args.destination)
			.into_diagnostic()
			.wrap_err_with(|| format!("copying {archived_path:?} to {:?}", args.destination))?;
		return Ok(());
	}

	let input = std::fs::File::open(archived_path).into_diagnostic().wrap_err_with(|| format!("opening {archived_path:?}"))?;
	let output = std::fs::File::create(&args.destination)
		.into_diagnostic()
		.wrap_err_with(|| format!("creating {:?}", args.destination))?;
	let argv = binding.decompress_argv();
	let status = std::process::Command::new(&argv[0])
		.args(&argv[1..])
		.stdin(input)
		.stdout(output)
		.status()
		.into_diagnostic()
		.wrap_err("running decompressor")?;
	if !status.success() {
		return Err(miette!("decompressor exited with {status:?}"));
	}
	Ok(())
}

fn program_path(args: &RestoreArgs, kind: CompressionType) -> &std::path::Path {
	match kind {
		CompressionType::Gzip => &args.gzip_path,
		CompressionType::Bzip2 => &args.bzip2_path,
		CompressionType::Lzma => &args.lzma_path,
		CompressionType::None => std::path::Path::new("cat"),
	}
}

async fn retention_pass(args: &RestoreArgs) -> Result<()> {
	if let Some(trigger) = &args.removal_pause_trigger {
		if trigger.exists() {
			debug!("removal-pause-trigger present; skipping retention");
			return Ok(());
		}
	}

	let boundary = match retention_boundary(args) {
		Ok(boundary) => boundary,
		Err(e) => {
			return match args.error_pgcontroldata {
				PgControlDataErrorPolicy::Break => Err(e),
				PgControlDataErrorPolicy::Ignore => {
					warn!("pg_controldata failed during retention, ignoring: {e}");
					Ok(())
				}
				PgControlDataErrorPolicy::Hang => {
					warn!("pg_controldata failed during retention, suspending retention for 5 minutes");
					tokio::time::sleep(Duration::from_secs(300)).await;
					Ok(())
				}
			};
		}
	};

	let (compression, source_dir) = split_source(&args.source);
	let mut victims = list_removable(&source_dir, compression, &boundary)?;
	victims.sort();
	victims.truncate(args.remove_at_a_time);

	for victim in victims {
		let path = PathBuf::from(&source_dir).join(format!("{victim}{}", compression.extension()));
		if let Some(hook) = &args.pre_removal_processing {
			if let Err(e) = run_pre_removal_hook(args, hook, &path, &victim, compression) {
				warn!(segment = %victim, "pre-removal hook failed, abandoning remainder of batch: {e}");
				break;
			}
		}
		if let Err(e) = std::fs::remove_file(&path) {
			warn!(segment = %victim, "failed to remove archived segment: {e}");
		} else {
			debug!(segment = %victim, "removed by retention");
		}
	}

	Ok(())
}

fn retention_boundary(args: &RestoreArgs) -> Result<String> {
	if let Some(explicit) = &args.remove_unneeded {
		return Ok(explicit.clone());
	}
	let control = omnipitr_core::pgcontrol::invoke(&args.pgcontroldata_path, &args.data_dir).map_err(to_report)?;
	let redo_segment: WalSegment = control.redo_segment().map_err(to_report)?;
	Ok(redo_segment.name())
}

fn list_removable(source_dir: &str, compression: CompressionType, boundary: &str) -> Result<Vec<String>> {
	let ext = compression.extension();
	let mut out = Vec::new();
	let entries = std::fs::read_dir(source_dir).into_diagnostic().wrap_err_with(|| format!("reading {source_dir:?}"))?;
	for entry in entries {
		let entry = entry.into_diagnostic()?;
		let name = entry.file_name().to_string_lossy().into_owned();
		let stripped = if ext.is_empty() { name.as_str() } else { name.strip_suffix(ext).unwrap_or(&name) };
		if ArchiveEntry::parse(stripped).is_err() {
			continue;
		}
		if stripped < boundary {
			out.push(stripped.to_string());
		}
	}
	Ok(out)
}

fn run_pre_removal_hook(
	args: &RestoreArgs,
	hook: &str,
	archived_path: &std::path::Path,
	segment: &str,
	compression: CompressionType,
) -> Result<()> {
	let staging = tempfile::tempdir_in(&args.temp_dir).into_diagnostic().wrap_err("creating staging dir")?;
	let pg_xlog = staging.path().join("pg_xlog");
	std::fs::create_dir_all(&pg_xlog).into_diagnostic()?;
	let staged = pg_xlog.join(segment);

	if compression == CompressionType::None {
		std::fs::copy(archived_path, &staged).into_diagnostic().wrap_err("staging segment for pre-removal hook")?;
	} else {
		deliver(
			&RestoreArgs { destination: staged.clone(), ..args.clone() },
			archived_path,
			compression,
		)?;
	}

	let status = std::process::Command::new(&args.shell_path)
		.arg("-c")
		.arg(format!("{hook} pg_xlog/{segment}"))
		.current_dir(staging.path())
		.status()
		.into_diagnostic()
		.wrap_err("running pre-removal hook")?;
	if !status.success() {
		return Err(miette!("pre-removal hook exited with {status:?}"));
	}
	Ok(())
}

fn to_report(e: omnipitr_core::Error) -> miette::Report {
	miette::Report::msg(e.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_source_recognises_compression_prefix() {
		assert_eq!(split_source("/var/lib/wal-archive/"), (CompressionType::None, "/var/lib/wal-archive/".to_string()));
		assert_eq!(split_source("gzip=/var/lib/wal-archive/"), (CompressionType::Gzip, "/var/lib/wal-archive/".to_string()));
	}

	#[test]
	fn find_archived_respects_compression_extension() {
		let dir = tempfile::tempdir().unwrap();
		let segment = "000000010000000000000001";
		std::fs::write(dir.path().join(format!("{segment}.gz")), b"x").unwrap();

		assert!(find_archived(&dir.path().display().to_string(), CompressionType::Gzip, segment).is_some());
		assert!(find_archived(&dir.path().display().to_string(), CompressionType::None, segment).is_none());
	}

	#[test]
	fn list_removable_keeps_only_segments_before_boundary() {
		let dir = tempfile::tempdir().unwrap();
		for name in ["000000010000000000000001", "000000010000000000000005", "000000010000000000000009"] {
			std::fs::write(dir.path().join(format!("{name}.gz")), b"x").unwrap();
		}
		std::fs::write(dir.path().join("not-a-segment.gz"), b"x").unwrap();

		let mut victims = list_removable(&dir.path().display().to_string(), CompressionType::Gzip, "000000010000000000000005").unwrap();
		victims.sort();
		assert_eq!(victims, vec!["000000010000000000000001".to_string()]);
	}

	#[test]
	fn finish_mode_reads_now_as_immediate() {
		let dir = tempfile::tempdir().unwrap();
		let trigger = dir.path().join("finish");
		std::fs::write(&trigger, "NOW\n").unwrap();

		let args = sample_args(dir.path(), Some(trigger));
		assert_eq!(finish_mode(&args).unwrap(), FinishMode::Immediate);
	}

	#[test]
	fn finish_mode_missing_file_is_none() {
		let dir = tempfile::tempdir().unwrap();
		let args = sample_args(dir.path(), Some(dir.path().join("absent")));
		assert_eq!(finish_mode(&args).unwrap(), FinishMode::None);
	}

	fn sample_args(dir: &std::path::Path, finish_trigger: Option<PathBuf>) -> RestoreArgs {
		RestoreArgs {
			source: dir.display().to_string(),
			recovery_delay: 0,
			finish_trigger,
			removal_pause_trigger: None,
			pre_removal_processing: None,
			remove_at_a_time: 10,
			remove_unneeded: None,
			remove_before: false,
			streaming_replication: false,
			error_pgcontroldata: PgControlDataErrorPolicy::Break,
			data_dir: dir.to_path_buf(),
			pgcontroldata_path: PathBuf::from("pg_controldata"),
			gzip_path: PathBuf::from("gzip"),
			bzip2_path: PathBuf::from("bzip2"),
			lzma_path: PathBuf::from("lzma"),
			shell_path: PathBuf::from("sh"),
			temp_dir: dir.to_path_buf(),
			logging: crate::args::LoggingArgs { verbose: 0, log: None },
			segment: "000000010000000000000001".to_string(),
			destination: dir.join("dest"),
		}
	}
}
