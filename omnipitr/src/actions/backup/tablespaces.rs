//! Tablespace discovery for the backup engine: `pg_tblspc/` holds a symlink
//! per non-default tablespace, named after its OID, pointing at the real
//! storage location outside the data directory (spec §4.2 "additional
//! tablespaces").

use std::path::PathBuf;

use miette::{IntoDiagnostic, Result, WrapErr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
	pub oid: String,
	pub target: PathBuf,
}

/// Enumerates `<data_dir>/pg_tblspc/*` symlinks. A data directory with no
/// extra tablespaces yields an empty list; that's not an error.
pub fn discover(data_dir: &std::path::Path) -> Result<Vec<Tablespace>> {
	let tblspc_dir = data_dir.join("pg_tblspc");
	if !tblspc_dir.exists() {
		return Ok(Vec::new());
	}

	let mut out = Vec::new();
	for entry in std::fs::read_dir(&tblspc_dir)
		.into_diagnostic()
		.wrap_err_with(|| format!("reading {tblspc_dir:?}"))?
	{
		let entry = entry.into_diagnostic()?;
		let path = entry.path();
		if !path.is_symlink() {
			continue;
		}
		let oid = entry.file_name().to_string_lossy().into_owned();
		let target = std::fs::read_link(&path)
			.into_diagnostic()
			.wrap_err_with(|| format!("reading tablespace symlink {path:?}"))?;
		out.push(Tablespace { oid, target });
	}
	out.sort_by(|a, b| a.oid.cmp(&b.oid));
	Ok(out)
}
