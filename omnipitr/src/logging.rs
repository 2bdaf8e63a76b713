use std::path::Path;

use chrono::Local;
use miette::{IntoDiagnostic, Result, WrapErr};
use omnipitr_core::template::{self, TemplateContext};
use tracing_subscriber::EnvFilter;

use crate::args::LoggingArgs;

/// Installs the process-wide `tracing` subscriber: stderr by default, or an
/// append-only templated log file with `--log=TMPL` (spec §6 ambient
/// logging flag surface). Flushes after every record either way — stderr
/// is line-buffered by the OS, and the file writer never buffers in
/// user-space, matching §5's "logger opens append-only and flushes after
/// each record" requirement.
pub fn setup(logging: &LoggingArgs, program: &str) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
	let filter = if std::env::var_os("RUST_LOG").is_some() {
		EnvFilter::from_default_env()
	} else {
		EnvFilter::new(match logging.verbose {
			0 => "info",
			1 => "debug",
			2 => "omnipitr=trace,info",
			_ => "trace",
		})
	};

	let builder = tracing_subscriber::fmt().with_env_filter(filter);

	match &logging.log {
		None => {
			builder.with_writer(std::io::stderr).init();
			Ok(None)
		}
		Some(template) => {
			let path = expand_log_path(template, program)?;
			let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
			let filename = path
				.file_name()
				.ok_or_else(|| miette::miette!("log template expanded to a path with no filename: {path:?}"))?;

			let appender = tracing_appender::rolling::never(dir, filename);
			let (non_blocking, guard) = tracing_appender::non_blocking(appender);
			builder.with_writer(non_blocking).with_ansi(false).init();
			Ok(Some(guard))
		}
	}
}

fn expand_log_path(template: &str, program: &str) -> Result<std::path::PathBuf> {
	let hostname = hostname::get()
		.into_diagnostic()
		.wrap_err("reading local hostname")?
		.to_string_lossy()
		.into_owned();

	let ctx = TemplateContext {
		hostname,
		filetype: "log".to_string(),
		cext: String::new(),
		time: Local::now().fixed_offset(),
	};

	let expanded = template::expand_unchecked(template, &ctx);
	let expanded = if expanded.is_empty() { format!("{program}.log") } else { expanded };
	Ok(std::path::PathBuf::from(expanded))
}
