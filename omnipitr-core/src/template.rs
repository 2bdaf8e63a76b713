//! Filename template expansion (spec §4.2, §6): `__HOSTNAME__`,
//! `__FILETYPE__`, `__CEXT__` placeholders plus `^`-sigil strftime escapes
//! (rewritten to `%` before formatting, so a literal `%` in a destination
//! path never gets mistaken for a format directive).

use chrono::{DateTime, FixedOffset};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TemplateContext {
	pub hostname: String,
	pub filetype: String,
	pub cext: String,
	pub time: DateTime<FixedOffset>,
}

/// A template must name `__FILETYPE__` (otherwise multiple artifacts from
/// the same backup would collide) and must not contain a path separator
/// (the rendered name is a single filename, not a path).
pub fn validate(template: &str) -> Result<()> {
	if !template.contains("__FILETYPE__") {
		return Err(Error::Configuration(
			"filename template must contain __FILETYPE__".into(),
		));
	}
	if template.contains('/') || template.contains('\\') {
		return Err(Error::Configuration(
			"filename template must not contain a path separator".into(),
		));
	}
	Ok(())
}

pub fn expand(template: &str, ctx: &TemplateContext) -> Result<String> {
	validate(template)?;
	Ok(expand_unchecked(template, ctx))
}

/// Same substitution as [`expand`], without the filename-only validation —
/// for the `--log=TMPL` destination, which names a path, not a bare
/// filename (spec §6 ambient logging flag surface).
pub fn expand_unchecked(template: &str, ctx: &TemplateContext) -> String {
	let substituted = template
		.replace("__HOSTNAME__", &ctx.hostname)
		.replace("__FILETYPE__", &ctx.filetype)
		.replace("__CEXT__", &ctx.cext);

	let rewritten = substituted.replace('^', "%");

	ctx.time.format(&rewritten).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn ctx() -> TemplateContext {
		TemplateContext {
			hostname: "db1".into(),
			filetype: "data".into(),
			cext: ".gz".into(),
			time: FixedOffset::east_opt(0)
				.unwrap()
				.with_ymd_and_hms(2026, 7, 31, 9, 5, 0)
				.unwrap(),
		}
	}

	#[test]
	fn substitutes_placeholders_and_strftime() {
		let out = expand("__HOSTNAME__-^Y^m^d-__FILETYPE____CEXT__", &ctx()).unwrap();
		assert_eq!(out, "db1-20260731-data.gz");
	}

	#[test]
	fn rejects_missing_filetype() {
		assert!(validate("__HOSTNAME__-^Y^m^d").is_err());
	}

	#[test]
	fn rejects_path_separators() {
		assert!(validate("a/__FILETYPE__").is_err());
		assert!(validate("a\\__FILETYPE__").is_err());
	}

	/// P6: rewriting `^` to `%` and then applying strftime gives the same
	/// result as applying strftime directly to a template that already
	/// used `%`, for any template/time pair.
	#[test]
	fn caret_rewrite_is_equivalent_to_percent_directly() {
		let time = ctx().time;
		let caret_tmpl = "__FILETYPE__-^Y-^m";
		let percent_tmpl = "__FILETYPE__-%Y-%m";

		let via_caret = expand(caret_tmpl, &ctx()).unwrap();
		let via_percent_direct = time.format(&percent_tmpl.replace("__FILETYPE__", "data")).to_string();
		assert_eq!(via_caret, via_percent_direct);
	}

	#[test]
	fn expand_is_deterministic() {
		assert_eq!(expand("__FILETYPE__-^Y", &ctx()).unwrap(), expand("__FILETYPE__-^Y", &ctx()).unwrap());
	}
}
