//! Shared backup engine (spec §4.2-§4.3): the common skeleton both
//! `backup-master` and `backup-slave` drive, built on the pipe builder and
//! the parallel supervisor from `omnipitr-core`.

use std::path::{Path, PathBuf};

use clap::Args as ClapArgs;
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use omnipitr_core::{
	compression::CompressionType,
	destination::{Destination, DestinationKind},
	digest::{self, DigestAlgorithm},
	pipeline::{self, Node},
	supervisor::{self, JobSpec},
	template::{self, TemplateContext},
};
use tracing::{debug, info, warn};

use crate::args::LoggingArgs;

pub mod pgconn;
pub mod tablespaces;

/// Flags shared by the master and slave backup subcommands (spec §6
/// "Backup CLI").
#[derive(Debug, Clone, ClapArgs)]
pub struct BackupCommonArgs {
	/// The PostgreSQL data directory being backed up
	#[arg(long, env = "OMNIPITR_DATA_DIR")]
	pub data_dir: PathBuf,

	/// A local filesystem destination for the produced archives
	#[arg(long = "dst-local", value_name = "[CMP=]PATH", value_parser = Destination::local)]
	pub dst_local: Vec<Destination>,

	/// A remote rsync destination for the produced archives
	#[arg(long = "dst-remote", value_name = "[CMP=]USER@HOST:PATH", value_parser = Destination::remote)]
	pub dst_remote: Vec<Destination>,

	/// A pipe-to-program destination for the produced archives
	#[arg(long = "dst-pipe", value_name = "[CMP=]PROG", value_parser = Destination::pipe)]
	pub dst_pipe: Vec<Destination>,

	/// Directory used to stage tar/compressed artifacts before delivery
	#[arg(long, value_name = "DIR", default_value = "/tmp")]
	pub temp_dir: PathBuf,

	/// Maximum concurrent deliveries
	#[arg(long, default_value_t = 2)]
	pub parallel_jobs: usize,

	/// Filename template for produced artifacts (spec §4.2, §6)
	#[arg(long, default_value = "__HOSTNAME__-^Y^m^d-__FILETYPE____CEXT__")]
	pub filename_template: String,

	/// Comma-separated digest algorithms to compute for each artifact
	#[arg(long, value_delimiter = ',', value_name = "ALGO,...")]
	pub digest: Vec<String>,

	/// Don't produce/deliver a xlog archive
	#[arg(long)]
	pub skip_xlogs: bool,

	#[arg(long, default_value = "tar")]
	pub tar_path: PathBuf,
	#[arg(long, default_value = "tee")]
	pub tee_path: PathBuf,
	#[arg(long, default_value = "sh")]
	pub shell_path: PathBuf,
	#[arg(long, default_value = "ssh")]
	pub ssh_path: PathBuf,
	#[arg(long, default_value = "cat")]
	pub remote_cat_path: PathBuf,
	#[arg(long, default_value = "rsync")]
	pub rsync_path: PathBuf,
	#[arg(long, default_value = "gzip")]
	pub gzip_path: PathBuf,
	#[arg(long, default_value = "bzip2")]
	pub bzip2_path: PathBuf,
	#[arg(long, default_value = "lzma")]
	pub lzma_path: PathBuf,
	#[arg(long, default_value = "psql")]
	pub psql_path: PathBuf,
	#[arg(long, default_value = "pg_controldata")]
	pub pgcontroldata_path: PathBuf,

	#[arg(long, default_value = "omnipitr")]
	pub database: String,
	#[arg(long)]
	pub host: Option<String>,
	#[arg(long)]
	pub port: Option<u16>,
	#[arg(long, default_value = "postgres")]
	pub username: String,

	#[command(flatten)]
	pub logging: LoggingArgs,
}

impl BackupCommonArgs {
	pub fn digest_algorithms(&self) -> Result<Vec<DigestAlgorithm>> {
		self.digest
			.iter()
			.map(|s| DigestAlgorithm::parse(s).map_err(|e| miette!("{e}")))
			.collect()
	}

	pub fn destinations(&self) -> Vec<Destination> {
		let mut out = Vec::new();
		out.extend(self.dst_local.iter().cloned());
		out.extend(self.dst_remote.iter().cloned());
		out.extend(self.dst_pipe.iter().cloned());
		out
	}

	fn compression_program(&self, kind: CompressionType) -> &Path {
		match kind {
			CompressionType::Gzip => &self.gzip_path,
			CompressionType::Bzip2 => &self.bzip2_path,
			CompressionType::Lzma => &self.lzma_path,
			CompressionType::None => Path::new("cat"),
		}
	}
}

/// Builds the `tar` argv for the data directory: tablespace `--transform`
/// mappings plus the standard exclusions (spec §4.2).
pub fn tar_data_dir_argv(args: &BackupCommonArgs, data_dir: &Path, extra_excludes: &[&str]) -> Result<Vec<String>> {
	let mut argv = vec![
		args.tar_path.display().to_string(),
		"--create".to_string(),
		"--file".to_string(),
		"-".to_string(),
	];

	for exclude in ["pg_log/*", "pg_xlog/0*", "pg_xlog/archive_status/*", "postmaster.pid"]
		.into_iter()
		.chain(extra_excludes.iter().copied())
	{
		argv.push("--exclude".to_string());
		argv.push(exclude.to_string());
	}

	for ts in tablespaces::discover(data_dir)? {
		argv.push("--transform".to_string());
		argv.push(format!("s#^{}#tablespaces/{}#", regex_escape(&ts.target.display().to_string()), ts.oid));
		argv.push(ts.target.display().to_string());
	}

	argv.push(".".to_string());
	Ok(argv)
}

fn regex_escape(s: &str) -> String {
	s.chars()
		.flat_map(|c| {
			if "\\^$.|?*+()[]{}#".contains(c) {
				vec!['\\', c]
			} else {
				vec![c]
			}
		})
		.collect()
}

/// Runs `argv` (as the root of a pipe-builder tree) inside `cwd`, teeing its
/// stdout through one compressor per distinct compression among
/// `destinations`, each writing a local artifact named via the filename
/// template. Returns the produced artifact paths alongside their
/// destination compression kind.
pub async fn produce_compressed_artifacts(
	args: &BackupCommonArgs,
	cwd: &Path,
	source_argv: Vec<String>,
	filetype: &str,
	ctx: &TemplateContext,
	compressions: &[CompressionType],
) -> Result<Vec<(CompressionType, PathBuf)>> {
	std::fs::create_dir_all(&args.temp_dir).into_diagnostic().wrap_err("creating temp-dir")?;
	let fifo_dir = args.temp_dir.join("fifos");
	std::fs::create_dir_all(&fifo_dir).into_diagnostic().wrap_err("creating fifo-dir")?;

	let mut root = Node::new(source_argv);
	let mut artifacts = Vec::new();

	for &kind in compressions {
		let cext = kind.extension();
		let filetype_with_ext = template::expand(&args.filename_template, &TemplateContext {
			filetype: filetype.to_string(),
			cext: cext.to_string(),
			..ctx.clone()
		})
		.map_err(|e| miette!("{e}"))?;
		let artifact = args.temp_dir.join(&filetype_with_ext);
		artifacts.push((kind, artifact.clone()));

		let program = args.compression_program(kind);
		let mut argv = vec![program.display().to_string()];
		if kind != CompressionType::None {
			argv.push("-c".to_string());
		}
		let consumer = Node::new(argv).with_stdout_file(artifact.display().to_string());
		root = root.with_stdout_program(consumer);
	}

	let rendered = pipeline::render(&root, &fifo_dir.display().to_string());
	debug!(script = %rendered.script, "rendered backup pipeline");

	let status = tokio::process::Command::new(&args.shell_path)
		.arg("-c")
		.arg(&rendered.script)
		.current_dir(cwd)
		.status()
		.await
		.into_diagnostic()
		.wrap_err("running backup pipeline shell script")?;
	if !status.success() {
		return Err(miette!("backup pipeline script exited with {status:?}"));
	}

	Ok(artifacts)
}

/// Computes every configured digest for each produced artifact, writing
/// sidecar files the delivery step will fan out alongside it. Each sidecar
/// keeps the compression tag of the artifact it digests, so it travels to
/// the same destinations as that artifact.
pub fn write_digests(
	args: &BackupCommonArgs,
	artifacts: &[(CompressionType, PathBuf)],
) -> Result<Vec<(CompressionType, PathBuf)>> {
	let algorithms = args.digest_algorithms()?;
	if algorithms.is_empty() {
		return Ok(Vec::new());
	}
	let mut sidecars = Vec::new();
	for (kind, artifact) in artifacts {
		let written = digest::write_digest_files(artifact, &algorithms).map_err(|e| miette!("{e}"))?;
		sidecars.extend(written.into_iter().map(|(_, path)| (*kind, path)));
	}
	Ok(sidecars)
}

/// Delivers every produced file to every configured destination whose
/// compression matches the file's own compression tag, via the parallel
/// supervisor.
pub async fn deliver(
	args: &BackupCommonArgs,
	destinations: &[Destination],
	files: &[(CompressionType, PathBuf)],
) -> Result<()> {
	let mut jobs = Vec::new();
	for dest in destinations {
		for (compression, file) in files {
			if *compression != dest.compression {
				continue;
			}
			let mut argv = vec![args.rsync_path.display().to_string(), "-t".to_string()];
			let target = if dest.path.ends_with('/') {
				format!("{}{}", dest.path, file.file_name().unwrap().to_string_lossy())
			} else {
				dest.path.clone()
			};
			argv.push(file.display().to_string());
			argv.push(target);
			jobs.push(JobSpec::new(argv, dest.clone()));
		}
	}

	let results = supervisor::run(
		jobs,
		args.parallel_jobs.max(1),
		|dest: &Destination| debug!(kind=?dest.kind, path=%dest.path, "delivering backup artifact"),
		|_| {},
	)
	.await;

	let mut failed = false;
	for result in &results {
		if !result.success() {
			warn!(kind=?result.user.kind, path=%result.user.path, stderr=%String::from_utf8_lossy(&result.stderr), "backup delivery failed");
			if result.user.kind != DestinationKind::Direct {
				failed = true;
			}
		}
	}
	if failed {
		return Err(miette!("one or more backup destinations failed"));
	}
	info!("backup delivered to {} destination(s)", destinations.len());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_args(temp_dir: &Path) -> BackupCommonArgs {
		BackupCommonArgs {
			data_dir: temp_dir.to_path_buf(),
			dst_local: Vec::new(),
			dst_remote: Vec::new(),
			dst_pipe: Vec::new(),
			temp_dir: temp_dir.to_path_buf(),
			parallel_jobs: 2,
			filename_template: "__FILETYPE____CEXT__".to_string(),
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
			logging: LoggingArgs { verbose: 0, log: None },
		}
	}

	fn sample_ctx() -> TemplateContext {
		TemplateContext {
			hostname: "testhost".to_string(),
			filetype: String::new(),
			cext: String::new(),
			time: chrono::Local::now().fixed_offset(),
		}
	}

	/// Regression test for the `cat -c` bug: `-c` is only valid on the real
	/// compressors, and passing it to `cat` used to make the "none"
	/// destination's consumer exit immediately, truncating the artifact.
	#[tokio::test]
	async fn none_compression_artifact_is_byte_identical_to_source() {
		let dir = tempfile::tempdir().unwrap();
		let args = sample_args(dir.path());
		let source_file = dir.path().join("input.txt");
		std::fs::write(&source_file, b"some tar-shaped bytes\n").unwrap();

		let artifacts = produce_compressed_artifacts(
			&args,
			dir.path(),
			vec!["cat".to_string(), "input.txt".to_string()],
			"data",
			&sample_ctx(),
			&[CompressionType::None],
		)
		.await
		.unwrap();

		assert_eq!(artifacts.len(), 1);
		let (kind, path) = &artifacts[0];
		assert_eq!(*kind, CompressionType::None);
		assert_eq!(std::fs::read(path).unwrap(), b"some tar-shaped bytes\n");
	}

	#[tokio::test]
	async fn gzip_compression_artifact_decompresses_to_source() {
		let dir = tempfile::tempdir().unwrap();
		let args = sample_args(dir.path());
		let source_file = dir.path().join("input.txt");
		std::fs::write(&source_file, b"some tar-shaped bytes\n").unwrap();

		let artifacts = produce_compressed_artifacts(
			&args,
			dir.path(),
			vec!["cat".to_string(), "input.txt".to_string()],
			"data",
			&sample_ctx(),
			&[CompressionType::Gzip],
		)
		.await
		.unwrap();

		let (kind, path) = &artifacts[0];
		assert_eq!(*kind, CompressionType::Gzip);
		let decompressed = std::process::Command::new("gzip").arg("-dc").arg(path).output().unwrap();
		assert!(decompressed.status.success());
		assert_eq!(decompressed.stdout, b"some tar-shaped bytes\n");
	}

	/// Writes an executable shell script standing in for `rsync -t SRC DST`
	/// that just copies, for sandboxes without `rsync` installed.
	#[cfg(unix)]
	fn fake_rsync(dir: &Path) -> PathBuf {
		use std::{fs, os::unix::fs::PermissionsExt};

		let path = dir.join("fake-rsync");
		fs::write(&path, "#!/bin/sh\ncp \"$2\" \"$3\"\n").unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	/// Regression test for the cross-product delivery bug: a `none`
	/// destination must not receive the `gzip` artifact and vice versa.
	#[cfg(unix)]
	#[tokio::test]
	async fn deliver_only_sends_matching_compression_to_each_destination() {
		let dir = tempfile::tempdir().unwrap();
		let mut args = sample_args(dir.path());
		args.rsync_path = fake_rsync(dir.path());

		let none_artifact = dir.path().join("data.tar");
		std::fs::write(&none_artifact, b"none-bytes").unwrap();
		let gzip_artifact = dir.path().join("data.tar.gz");
		std::fs::write(&gzip_artifact, b"gzip-bytes").unwrap();

		let none_dst_dir = dir.path().join("dst-none");
		let gzip_dst_dir = dir.path().join("dst-gzip");
		std::fs::create_dir_all(&none_dst_dir).unwrap();
		std::fs::create_dir_all(&gzip_dst_dir).unwrap();

		let destinations = vec![
			Destination::local(&format!("{}/", none_dst_dir.display())).unwrap(),
			Destination::local(&format!("gzip={}/", gzip_dst_dir.display())).unwrap(),
		];
		let files = vec![(CompressionType::None, none_artifact.clone()), (CompressionType::Gzip, gzip_artifact.clone())];

		deliver(&args, &destinations, &files).await.unwrap();

		assert!(none_dst_dir.join("data.tar").exists());
		assert!(!none_dst_dir.join("data.tar.gz").exists());
		assert!(gzip_dst_dir.join("data.tar.gz").exists());
		assert!(!gzip_dst_dir.join("data.tar").exists());
	}

	#[test]
	fn write_digests_tags_sidecars_with_source_artifact_compression() {
		let dir = tempfile::tempdir().unwrap();
		let mut args = sample_args(dir.path());
		args.digest = vec!["sha256".to_string()];

		let artifact = dir.path().join("data.tar.gz");
		std::fs::write(&artifact, b"some bytes").unwrap();

		let sidecars = write_digests(&args, &[(CompressionType::Gzip, artifact)]).unwrap();
		assert_eq!(sidecars.len(), 1);
		assert_eq!(sidecars[0].0, CompressionType::Gzip);
		assert!(sidecars[0].1.to_string_lossy().ends_with(".sha256"));
	}

	#[test]
	fn tar_argv_includes_standard_exclusions_and_extra_excludes() {
		let dir = tempfile::tempdir().unwrap();
		let args = sample_args(dir.path());
		let argv = tar_data_dir_argv(&args, dir.path(), &["recovery.conf"]).unwrap();

		assert!(argv.contains(&"pg_log/*".to_string()));
		assert!(argv.contains(&"recovery.conf".to_string()));
		assert_eq!(argv.last().unwrap(), ".");
	}

	#[test]
	fn regex_escape_escapes_metacharacters() {
		assert_eq!(regex_escape("a.b*c"), "a\\.b\\*c");
	}
}
