use clap::{ArgAction, Args as ClapArgs, Parser};

/// OmniPITR: Point-In-Time-Recovery toolkit for PostgreSQL
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help."
)]
pub struct Args {
	/// What to do
	#[command(subcommand)]
	pub action: crate::actions::Action,
}

/// Logging options shared by every subcommand (spec §6 ambient logging
/// flag surface): a stacking `-v` verbosity ladder and an optional
/// templated destination file.
#[derive(Debug, Clone, ClapArgs)]
pub struct LoggingArgs {
	/// Set diagnostic log level
	///
	/// Use multiple times to increase verbosity: info, then debug, then trace.
	#[arg(long, short, action = ArgAction::Count, num_args = 0, env = "OMNIPITR_VERBOSE")]
	pub verbose: u8,

	/// Write diagnostic logs to a templated file path instead of stderr
	///
	/// Accepts the same `__HOSTNAME__`/`__FILETYPE__`/`__CEXT__`/`^`-strftime
	/// placeholders as backup filenames (spec §6). `__FILETYPE__` expands to
	/// `log`.
	#[arg(long, value_name = "TMPL", env = "OMNIPITR_LOG")]
	pub log: Option<String>,
}

pub fn get_args() -> Args {
	tracing::trace!("parsing arguments");
	Args::parse()
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
