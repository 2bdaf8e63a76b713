//! `backup-slave` subcommand: drives a hot-standby backup without (by
//! default) talking to the primary (spec §4.2).

use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use omnipitr_core::{
	backup_label::{BackupLabel, SLAVE_LABEL},
	compression::CompressionType,
	pgcontrol::{self, ControlData},
	segment::Lsn,
	supervisor,
	template::TemplateContext,
};
use tracing::info;

use crate::actions::{
	Context,
	backup::{self, BackupCommonArgs, pgconn::PgConn},
};

#[derive(Debug, Clone, Parser)]
pub struct BackupSlaveArgs {
	#[command(flatten)]
	pub common: BackupCommonArgs,

	/// Directory the xlog archive is sourced from, optionally `CMP=DIR`
	#[arg(long, value_name = "[CMP=]DIR")]
	pub source: String,

	/// File whose presence tells `restore`'s retention pass to stand down
	#[arg(long, value_name = "FILE")]
	pub removal_pause_trigger: Option<std::path::PathBuf>,

	/// Call the primary's `pg_start_backup`/`pg_stop_backup` instead of
	/// deriving backup-label fields from local `pg_controldata` snapshots
	#[arg(long)]
	pub call_master: bool,
}

pub async fn run(ctx: Context<(), BackupSlaveArgs>) -> Result<()> {
	let args = ctx.args_sub;
	let _guard = crate::logging::setup(&args.common.logging, "omnipitr-backup-slave")?;

	let destinations = args.common.destinations();
	if destinations.is_empty() {
		return Err(miette!("no destinations configured"));
	}

	if let Some(trigger) = &args.removal_pause_trigger {
		std::fs::write(trigger, b"").into_diagnostic().wrap_err("creating removal-pause-trigger")?;
	}

	let result = run_inner(&args, &destinations).await;

	if let Some(trigger) = &args.removal_pause_trigger {
		let _ = std::fs::remove_file(trigger);
	}

	result
}

async fn run_inner(args: &BackupSlaveArgs, destinations: &[omnipitr_core::destination::Destination]) -> Result<()> {
	let initial = invoke_controldata(&args.common)?;

	let hostname = hostname::get().into_diagnostic().wrap_err("reading hostname")?.to_string_lossy().into_owned();
	let start_time = chrono::Local::now().fixed_offset();
	let ctx_tpl = TemplateContext {
		hostname,
		filetype: String::new(),
		cext: String::new(),
		time: start_time,
	};
	let compressions: Vec<CompressionType> = destinations.iter().map(|d| d.compression).collect();

	let master_conn = if args.call_master {
		let conn = PgConn::connect(&args.common).await?;
		info!("calling master pg_start_backup via --call-master");
		let start_lsn = Lsn::parse(&conn.start_backup().await?).map_err(to_report)?;
		Some((conn, start_lsn))
	} else {
		None
	};

	let tar_argv = backup::tar_data_dir_argv(&args.common, &args.common.data_dir, &["recovery.conf"])?;
	let data_artifacts = backup::produce_compressed_artifacts(
		&args.common,
		&args.common.data_dir,
		tar_argv,
		"data",
		&ctx_tpl,
		&compressions,
	)
	.await?;

	let label = if let Some((conn, start_lsn)) = &master_conn {
		info!("calling master pg_stop_backup via --call-master");
		conn.stop_backup().await?;
		let label_text = conn.read_backup_label().await?;

		wait_checkpoint_passes(&args.common, *start_lsn).await?;

		BackupLabel::parse(&label_text).map_err(to_report)?
	} else {
		let final_control = wait_checkpoint_advance(&args.common, &initial).await?;
		synthesize_label(&initial, &final_control, start_time)?
	};

	std::fs::create_dir_all(&args.common.temp_dir).into_diagnostic().wrap_err("creating temp-dir")?;
	let label_path = args.common.temp_dir.join("backup_label");
	std::fs::write(&label_path, label.render()).into_diagnostic().wrap_err("writing backup_label")?;

	let (source_cext, source_dir) = split_source(&args.source);
	let _ = source_cext;
	let xlog_argv = vec![
		args.common.tar_path.display().to_string(),
		"--create".to_string(),
		"--file".to_string(),
		"-".to_string(),
		".".to_string(),
	];
	let xlog_artifacts = backup::produce_compressed_artifacts(
		&args.common,
		std::path::Path::new(&source_dir),
		xlog_argv,
		"xlog",
		&ctx_tpl,
		&compressions,
	)
	.await?;

	let mut files = data_artifacts.clone();
	files.extend(xlog_artifacts.clone());
	// backup_label accompanies the data tar, so it fans out to the same
	// destinations as each compression variant of that tar.
	files.extend(data_artifacts.iter().map(|(kind, _)| (*kind, label_path.clone())));
	files.extend(backup::write_digests(&args.common, &data_artifacts)?);
	files.extend(backup::write_digests(&args.common, &xlog_artifacts)?);

	backup::deliver(&args.common, destinations, &files).await?;

	info!("backup-slave complete");
	Ok(())
}

fn split_source(spec: &str) -> (CompressionType, String) {
	if let Some((prefix, rest)) = spec.split_once('=') {
		if let Ok(kind) = CompressionType::parse(prefix) {
			return (kind, rest.to_string());
		}
	}
	(CompressionType::None, spec.to_string())
}

fn invoke_controldata(args: &BackupCommonArgs) -> Result<ControlData> {
	pgcontrol::invoke(&args.pgcontroldata_path, &args.data_dir).map_err(to_report)
}

async fn wait_checkpoint_advance(args: &BackupCommonArgs, initial: &ControlData) -> Result<ControlData> {
	let initial_checkpoint = initial.checkpoint_location().map_err(to_report)?;
	loop {
		tokio::time::sleep(Duration::from_secs(5)).await;
		let snapshot = invoke_controldata(args)?;
		let current = snapshot.checkpoint_location().map_err(to_report)?;
		if current.series != initial_checkpoint.series || current.offset != initial_checkpoint.offset {
			return Ok(snapshot);
		}
	}
}

async fn wait_checkpoint_passes(args: &BackupCommonArgs, start_lsn: Lsn) -> Result<()> {
	let found = supervisor::poll_until(
		|| {
			let Ok(control) = invoke_controldata(args) else {
				return false;
			};
			let Ok(current) = control.checkpoint_location() else {
				return false;
			};
			current.series > start_lsn.series
				|| (current.series == start_lsn.series && current.offset >= start_lsn.offset)
		},
		Duration::from_secs(5),
		Duration::from_secs(3600),
	)
	.await;
	if !found {
		return Err(miette!("timed out waiting for standby checkpoint to pass master's start-backup location"));
	}
	Ok(())
}

fn synthesize_label(
	initial: &ControlData,
	final_control: &ControlData,
	start_time: chrono::DateTime<chrono::FixedOffset>,
) -> Result<BackupLabel> {
	let redo = initial.redo_location().map_err(to_report)?;
	let timeline = initial.timeline().map_err(to_report)?;
	let stop = final_control.checkpoint_location().map_err(to_report)?;
	let checkpoint = final_control.checkpoint_location().map_err(to_report)?;

	Ok(BackupLabel {
		start_wal_location: redo,
		start_timeline: timeline,
		stop_wal_location: Some(stop),
		stop_timeline: Some(timeline),
		checkpoint_location: checkpoint,
		start_time,
		stop_time: Some(chrono::Local::now().fixed_offset()),
		label: SLAVE_LABEL.to_string(),
	})
}

fn to_report(e: omnipitr_core::Error) -> miette::Report {
	miette::Report::msg(e.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	const INITIAL: &str = "\
Latest checkpoint location:           1/10000028
Latest checkpoint's REDO location:    1/10000000
Latest checkpoint's TimeLineID:       2
";

	const FINAL: &str = "\
Latest checkpoint location:           1/20000050
Latest checkpoint's REDO location:    1/20000000
Latest checkpoint's TimeLineID:       2
";

	#[test]
	fn split_source_recognises_compression_prefix() {
		assert_eq!(split_source("/var/lib/wal-archive/"), (CompressionType::None, "/var/lib/wal-archive/".to_string()));
		assert_eq!(split_source("gzip=/var/lib/wal-archive/"), (CompressionType::Gzip, "/var/lib/wal-archive/".to_string()));
	}

	#[test]
	fn synthesize_label_derives_fields_from_initial_and_final_snapshots() {
		let initial = ControlData::parse(INITIAL);
		let final_control = ControlData::parse(FINAL);
		let start_time = chrono::Local::now().fixed_offset();

		let label = synthesize_label(&initial, &final_control, start_time).unwrap();

		assert_eq!(label.start_wal_location, Lsn { series: 1, offset: 0x1000_0000 });
		assert_eq!(label.start_timeline, 2);
		assert_eq!(label.stop_wal_location, Some(Lsn { series: 1, offset: 0x2000_0050 }));
		assert_eq!(label.checkpoint_location, Lsn { series: 1, offset: 0x2000_0050 });
		assert_eq!(label.label, SLAVE_LABEL);
	}

	/// Writes an executable shell script standing in for `pg_controldata`
	/// whose reported checkpoint location advances once `counter_file` has
	/// been read a given number of times, mimicking a standby's checkpoint
	/// progressing across polls.
	#[cfg(unix)]
	fn fake_pgcontroldata_advancing_after(dir: &std::path::Path, calls_before_advance: u32) -> std::path::PathBuf {
		use std::{fs, os::unix::fs::PermissionsExt};

		let counter = dir.join("calls");
		fs::write(&counter, b"0").unwrap();
		let path = dir.join("fake-pg_controldata");
		fs::write(
			&path,
			format!(
				"#!/bin/sh\n\
				 n=$(cat {counter:?})\n\
				 n=$((n + 1))\n\
				 echo $n > {counter:?}\n\
				 if [ $n -gt {calls_before_advance} ]; then\n\
				 \techo \"Latest checkpoint location:           1/20000050\"\n\
				 else\n\
				 \techo \"Latest checkpoint location:           1/10000028\"\n\
				 fi\n\
				 echo \"Latest checkpoint's REDO location:    1/10000000\"\n\
				 echo \"Latest checkpoint's TimeLineID:       2\"\n"
			),
		)
		.unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn wait_checkpoint_advance_waits_until_checkpoint_location_changes() {
		let dir = tempfile::tempdir().unwrap();
		let mut args = crate::actions::backup::BackupCommonArgs {
			data_dir: dir.path().to_path_buf(),
			dst_local: Vec::new(),
			dst_remote: Vec::new(),
			dst_pipe: Vec::new(),
			temp_dir: dir.path().to_path_buf(),
			parallel_jobs: 2,
			filename_template: "__HOSTNAME__-^Y^m^d-__FILETYPE____CEXT__".to_string(),
			digest: Vec::new(),
			skip_xlogs: false,
			tar_path: "tar".into(),
			tee_path: "tee".into(),
			shell_path: "sh".into(),
			ssh_path: "ssh".into(),
			remote_cat_path: "cat".into(),
			rsync_path: "rsync".into(),
			gzip_path: "gzip".into(),
			bzip2_path: "bzip2".into(),
			lzma_path: "lzma".into(),
			psql_path: "psql".into(),
			pgcontroldata_path: "pg_controldata".into(),
			database: "omnipitr".to_string(),
			host: None,
			port: None,
			username: "postgres".to_string(),
			logging: crate::args::LoggingArgs { verbose: 0, log: None },
		};
		// First call establishes `initial`; the fake script advances starting
		// on its second invocation, so the wait loop must poll more than once.
		args.pgcontroldata_path = fake_pgcontroldata_advancing_after(dir.path(), 1);
		let initial = invoke_controldata(&args).unwrap();

		let result = tokio::time::timeout(Duration::from_secs(10), wait_checkpoint_advance(&args, &initial))
			.await
			.expect("wait_checkpoint_advance timed out");

		let advanced = result.unwrap();
		assert_eq!(advanced.checkpoint_location().unwrap(), Lsn { series: 1, offset: 0x2000_0050 });
	}
}
