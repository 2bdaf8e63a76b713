//! The bounded parallel process supervisor (spec §4.4), used by the archive
//! pipeline to fan transfers out to many destinations at once and by the
//! backup engine's rsync delivery step. Realised over `tokio::process`
//! rather than raw `fork`/`SIGCHLD`, the Rust-idiomatic form of the
//! "asynchronous notification primitive" called for in spec §9.

use std::{
	path::PathBuf,
	process::{ExitStatus, Stdio},
	sync::Arc,
	time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use tokio::{io::AsyncReadExt, process::Command, sync::Semaphore, task::JoinSet};

/// One unit of work. `user` carries whatever the caller needs to correlate
/// a result back to its origin (a destination descriptor, a segment name,
/// …) — it travels through untouched.
#[derive(Debug, Clone)]
pub struct JobSpec<T> {
	pub argv: Vec<String>,
	/// Pipe-kind destinations set this so the child's stdin is reopened
	/// from a file instead of inherited (spec §4.4 "special stdin
	/// mapping").
	pub stdin_file: Option<PathBuf>,
	pub user: T,
}

impl<T> JobSpec<T> {
	pub fn new(argv: impl IntoIterator<Item = impl Into<String>>, user: T) -> Self {
		Self {
			argv: argv.into_iter().map(Into::into).collect(),
			stdin_file: None,
			user,
		}
	}

	pub fn with_stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.stdin_file = Some(path.into());
		self
	}
}

#[derive(Debug)]
pub struct JobResult<T> {
	pub user: T,
	pub argv: Vec<String>,
	pub started: Instant,
	pub ended: Instant,
	/// Exit status encoded the same way the host's child-exit convention
	/// does: low byte carries the terminating signal (0 if none), high byte
	/// carries the exit code.
	pub status: i32,
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
}

impl<T> JobResult<T> {
	pub fn success(&self) -> bool {
		self.status == 0
	}
}

fn encode_status(status: ExitStatus) -> i32 {
	#[cfg(unix)]
	{
		if let Some(signal) = status.signal() {
			return signal & 0xff;
		}
		(status.code().unwrap_or(0) & 0xff) << 8
	}
	#[cfg(not(unix))]
	{
		(status.code().unwrap_or(0) & 0xff) << 8
	}
}

/// Runs every job in `jobs` concurrently, capped at `max_jobs` in flight.
/// Blocks until all jobs have completed; there is no mid-flight
/// cancellation (spec §4.4).
pub async fn run<T, OnStart, OnFinish>(
	jobs: Vec<JobSpec<T>>,
	max_jobs: usize,
	on_start: OnStart,
	on_finish: OnFinish,
) -> Vec<JobResult<T>>
where
	T: Send + 'static,
	OnStart: Fn(&T) + Send + Sync + 'static,
	OnFinish: Fn(&JobResult<T>) + Send + Sync + 'static,
{
	let semaphore = Arc::new(Semaphore::new(max_jobs.max(1)));
	let on_start = Arc::new(on_start);
	let on_finish = Arc::new(on_finish);
	let mut set: JoinSet<JobResult<T>> = JoinSet::new();

	for job in jobs {
		let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
		let on_start = on_start.clone();
		set.spawn(async move {
			let result = execute(job, on_start.as_ref()).await;
			drop(permit);
			result
		});
	}

	let mut results = Vec::new();
	while let Some(joined) = set.join_next().await {
		let result = joined.expect("supervisor worker task panicked");
		on_finish(&result);
		results.push(result);
	}
	results
}

async fn execute<T, OnStart>(job: JobSpec<T>, on_start: &OnStart) -> JobResult<T>
where
	OnStart: Fn(&T),
{
	let started = Instant::now();
	let (argv, stdin_file, user) = (job.argv, job.stdin_file, job.user);

	let mut command = Command::new(&argv[0]);
	command
		.args(&argv[1..])
		.stdout(Stdio::piped())
		.stderr(Stdio::piped());
	command.stdin(match &stdin_file {
		Some(_) => Stdio::piped(),
		None => Stdio::null(),
	});

	let spawned = command.spawn();
	let mut child = match spawned {
		Ok(child) => child,
		Err(e) => {
			return JobResult {
				user,
				argv,
				started,
				ended: Instant::now(),
				status: 0xff << 8,
				stdout: Vec::new(),
				stderr: format!("failed to spawn: {e}").into_bytes(),
			};
		}
	};
	on_start(&user);

	if let Some(path) = &stdin_file {
		if let (Ok(bytes), Some(mut stdin)) = (tokio::fs::read(path).await, child.stdin.take()) {
			use tokio::io::AsyncWriteExt;
			let _ = stdin.write_all(&bytes).await;
		}
	}

	let mut stdout = Vec::new();
	let mut stderr = Vec::new();
	if let Some(mut out) = child.stdout.take() {
		let _ = out.read_to_end(&mut stdout).await;
	}
	if let Some(mut err) = child.stderr.take() {
		let _ = err.read_to_end(&mut stderr).await;
	}

	let status = child.wait().await;
	let ended = Instant::now();
	let status = match status {
		Ok(status) => encode_status(status),
		Err(_) => 0xff << 8,
	};

	JobResult {
		user,
		argv,
		started,
		ended,
		status,
		stdout,
		stderr,
	}
}

/// Convenience for callers that don't need per-job user data or callbacks.
pub async fn run_simple(argvs: Vec<Vec<String>>, max_jobs: usize) -> Vec<JobResult<()>> {
	let jobs = argvs.into_iter().map(|argv| JobSpec::new(argv, ())).collect();
	run(jobs, max_jobs, |_| {}, |_| {}).await
}

/// Waits up to `ceiling` for `exists` to report `true`, polling every
/// `interval` — the 1-second-granularity, 1-hour-ceiling suspension point
/// from spec §5(a). Returns `false` if the ceiling was hit.
pub async fn poll_until<F>(mut exists: F, interval: Duration, ceiling: Duration) -> bool
where
	F: FnMut() -> bool,
{
	let deadline = Instant::now() + ceiling;
	loop {
		if exists() {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(interval).await;
	}
}
