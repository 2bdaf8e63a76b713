use clap::Subcommand;
use miette::Result;
use tracing::debug;

pub use context::Context;
pub mod backup;
pub mod context;

macro_rules! subcommands {
	(
		[$argtype:ty => $ctxcode:block]
		$($modname:ident => $enumname:ident($argname:ident)),+
	) => {
		$(
			pub mod $modname;
		)*

		#[derive(Debug, Clone, Subcommand)]
		pub enum Action {
			$(
				$enumname($modname::$argname),
			)*
		}

		pub async fn run(ctx: $argtype) -> Result<()> {
			let ctxfn = $ctxcode;
			match ctxfn(ctx)? {
				$(
					(Action::$enumname(args), ctx) => $modname::run(ctx.with_sub(args)).await,
				)*
			}
		}
	};
}

use crate::args::Args;

subcommands! {
	[Args => {|args: Args| -> Result<(Action, Context<()>)> {
		let ctx = Context::new().with_top(args.action);
		debug!(version=%env!("CARGO_PKG_VERSION"), "starting up");
		Ok(ctx.take_top())
	}}]

	archive => Archive(ArchiveArgs),
	backup_master => BackupMaster(BackupMasterArgs),
	backup_slave => BackupSlave(BackupSlaveArgs),
	restore => Restore(RestoreArgs)
}
