mod actions;
mod args;
mod logging;

fn main() -> miette::Result<()> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.unwrap()
		.block_on(async {
			let args = args::get_args();
			actions::run(args).await
		})
}
