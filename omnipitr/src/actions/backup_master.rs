//! `backup-master` subcommand: drives the primary side of the backup
//! protocol (spec §4.2).

use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use omnipitr_core::{
	compression::CompressionType,
	segment::{Lsn, WalSegment},
	supervisor,
	template::TemplateContext,
};
use tracing::info;

use crate::actions::{
	Context,
	backup::{self, BackupCommonArgs, pgconn::PgConn},
};

#[derive(Debug, Clone, Parser)]
pub struct BackupMasterArgs {
	#[command(flatten)]
	pub common: BackupCommonArgs,

	/// Directory holding the xlog segments archived during this backup
	#[arg(long, value_name = "DIR")]
	pub xlogs: std::path::PathBuf,
}

pub async fn run(ctx: Context<(), BackupMasterArgs>) -> Result<()> {
	let args = ctx.args_sub;
	let _guard = crate::logging::setup(&args.common.logging, "omnipitr-backup-master")?;

	let destinations = args.common.destinations();
	if destinations.is_empty() {
		return Err(miette!("no destinations configured"));
	}

	let conn = PgConn::connect(&args.common).await?;

	info!("starting pg_start_backup");
	let start_lsn = Lsn::parse(&conn.start_backup().await?).map_err(to_report)?;
	let start_time = chrono::Local::now().fixed_offset();

	let hostname = hostname::get().into_diagnostic().wrap_err("reading hostname")?.to_string_lossy().into_owned();
	let ctx_tpl = TemplateContext {
		hostname,
		filetype: String::new(),
		cext: String::new(),
		time: start_time,
	};

	let compressions: Vec<CompressionType> = destinations.iter().map(|d| d.compression).collect();
	let tar_argv = backup::tar_data_dir_argv(&args.common, &args.common.data_dir, &[])?;
	let data_artifacts = backup::produce_compressed_artifacts(
		&args.common,
		&args.common.data_dir,
		tar_argv,
		"data",
		&ctx_tpl,
		&compressions,
	)
	.await?;

	info!("stopping pg_start_backup");
	let stop_lsn = Lsn::parse(&conn.stop_backup().await?).map_err(to_report)?;

	let timeline = detect_timeline(&args.common).await?;
	let stop_segment = WalSegment::from_lsn(stop_lsn, timeline);

	if !args.common.skip_xlogs {
		wait_for_backup_sentinel(&args).await?;
		wait_for_segment(&args, &stop_segment).await?;

		let xlog_argv = vec![
			args.common.tar_path.display().to_string(),
			"--create".to_string(),
			"--file".to_string(),
			"-".to_string(),
			".".to_string(),
		];
		let xlog_artifacts = backup::produce_compressed_artifacts(
			&args.common,
			&args.xlogs,
			xlog_argv,
			"xlog",
			&ctx_tpl,
			&compressions,
		)
		.await?;

		let mut files = data_artifacts.clone();
		files.extend(xlog_artifacts.clone());
		files.extend(backup::write_digests(&args.common, &data_artifacts)?);
		files.extend(backup::write_digests(&args.common, &xlog_artifacts)?);
		backup::deliver(&args.common, &destinations, &files).await?;
	} else {
		let mut files = data_artifacts.clone();
		files.extend(backup::write_digests(&args.common, &data_artifacts)?);
		backup::deliver(&args.common, &destinations, &files).await?;
	}

	info!(start=%start_lsn, stop=%stop_lsn, "backup-master complete");
	Ok(())
}

async fn detect_timeline(args: &BackupCommonArgs) -> Result<u32> {
	let control = omnipitr_core::pgcontrol::invoke(&args.pgcontroldata_path, &args.data_dir).map_err(to_report)?;
	control.timeline().map_err(to_report)
}

async fn wait_for_backup_sentinel(args: &BackupMasterArgs) -> Result<()> {
	let xlogs = args.xlogs.clone();
	let found = supervisor::poll_until(
		move || {
			std::fs::read_dir(&xlogs)
				.map(|mut entries| {
					entries.any(|e| {
						e.ok()
							.map(|e| e.file_name().to_string_lossy().ends_with(".backup"))
							.unwrap_or(false)
					})
				})
				.unwrap_or(false)
		},
		Duration::from_secs(1),
		Duration::from_secs(3600),
	)
	.await;
	if !found {
		return Err(miette!("timed out waiting for .backup sentinel in {:?}", args.xlogs));
	}
	Ok(())
}

async fn wait_for_segment(args: &BackupMasterArgs, segment: &WalSegment) -> Result<()> {
	let path = args.xlogs.join(segment.name());
	let exists_path = path.clone();
	let found = supervisor::poll_until(
		move || exists_path.exists(),
		Duration::from_secs(1),
		Duration::from_secs(3600),
	)
	.await;
	if !found {
		return Err(miette!("timed out waiting for final xlog segment {path:?}"));
	}
	Ok(())
}

fn to_report(e: omnipitr_core::Error) -> miette::Report {
	miette::Report::msg(e.to_string())
}
