//! `pg_start_backup`/`pg_stop_backup`/`pg_read_file` over a direct
//! `tokio_postgres` simple-query connection (spec §4.2 supplement: the
//! original tool shells out to `psql`, this instead speaks the ordinary
//! query protocol — still not streaming replication).

use miette::{IntoDiagnostic, Result, WrapErr, miette};
use tokio_postgres::NoTls;

use super::BackupCommonArgs;

pub struct PgConn {
	client: tokio_postgres::Client,
}

impl PgConn {
	pub async fn connect(args: &BackupCommonArgs) -> Result<Self> {
		let mut config = tokio_postgres::Config::new();
		config.dbname(&args.database).user(&args.username);
		if let Some(host) = &args.host {
			config.host(host);
		}
		if let Some(port) = args.port {
			config.port(port);
		}

		let (client, connection) = config
			.connect(NoTls)
			.await
			.into_diagnostic()
			.wrap_err("connecting to postgres for backup coordination")?;

		tokio::spawn(async move {
			if let Err(e) = connection.await {
				tracing::warn!("postgres backup connection closed: {e}");
			}
		});

		Ok(Self { client })
	}

	async fn scalar(&self, sql: &str) -> Result<String> {
		let row = self
			.client
			.query_one(sql, &[])
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("running {sql:?}"))?;
		row.try_get::<_, String>(0).into_diagnostic().wrap_err("reading query result")
	}

	/// `pg_start_backup('omnipitr')` — returns the start WAL location text.
	pub async fn start_backup(&self) -> Result<String> {
		self.scalar("SELECT pg_start_backup('omnipitr')::text").await
	}

	/// `pg_stop_backup()` — returns the stop WAL location text.
	pub async fn stop_backup(&self) -> Result<String> {
		self.scalar("SELECT pg_stop_backup()::text").await
	}

	/// Retrieves the primary's synthesized `backup_label` contents for the
	/// `--call-master` slave path. Surfaces a configuration error rather
	/// than silently falling back if the server can't expose it (spec §9
	/// Open Question).
	pub async fn read_backup_label(&self) -> Result<String> {
		self.client
			.query_one(
				"SELECT pg_read_file('backup_label', 0, 1000000)",
				&[],
			)
			.await
			.into_diagnostic()
			.map_err(|e| {
				miette!(
					"server does not support pg_read_file('backup_label', ...) needed by --call-master: {e}"
				)
			})?
			.try_get::<_, String>(0)
			.into_diagnostic()
			.wrap_err("reading backup_label contents")
	}
}
