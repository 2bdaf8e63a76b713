//! Synthesis and parsing of `backup_label` and the `.backup` sentinel (spec
//! §3, §4.2). Both share the same field layout, so one type models both.

use chrono::{DateTime, FixedOffset};

use crate::{
	error::{Error, Result},
	segment::{Lsn, WalSegment},
};

pub const SLAVE_LABEL: &str = "OmniPITR_Slave_Hot_Backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLabel {
	pub start_wal_location: Lsn,
	pub start_timeline: u32,
	pub stop_wal_location: Option<Lsn>,
	pub stop_timeline: Option<u32>,
	pub checkpoint_location: Lsn,
	pub start_time: DateTime<FixedOffset>,
	pub stop_time: Option<DateTime<FixedOffset>>,
	pub label: String,
}

impl BackupLabel {
	/// Renders the text spec §4.2 prescribes for the slave's
	/// not-calling-master backup-label synthesis.
	pub fn render(&self) -> String {
		let mut out = format!(
			"START WAL LOCATION: {} (file {})\n",
			self.start_wal_location,
			WalSegment::from_lsn(self.start_wal_location, self.start_timeline)
		);
		if let (Some(stop_loc), Some(stop_timeline)) = (self.stop_wal_location, self.stop_timeline) {
			out += &format!(
				"STOP WAL LOCATION: {} (file {})\n",
				stop_loc,
				WalSegment::from_lsn(stop_loc, stop_timeline)
			);
		}
		out += &format!("CHECKPOINT LOCATION: {}\n", self.checkpoint_location);
		out += &format!("START TIME: {}\n", self.start_time.format("%Y-%m-%d %H:%M:%S %z"));
		if let Some(stop_time) = self.stop_time {
			out += &format!("STOP TIME: {}\n", stop_time.format("%Y-%m-%d %H:%M:%S %z"));
		}
		out += &format!("LABEL: {}\n", self.label);
		out
	}

	/// Parses a `backup_label`/`.backup` sentinel's `KEY: VALUE` lines,
	/// including the `(file …)` suffix on the WAL location fields.
	pub fn parse(text: &str) -> Result<Self> {
		let mut start_wal_location = None;
		let mut start_timeline = None;
		let mut stop_wal_location = None;
		let mut stop_timeline = None;
		let mut checkpoint_location = None;
		let mut start_time = None;
		let mut stop_time = None;
		let mut label = None;

		for line in text.lines() {
			let Some((key, value)) = line.split_once(':') else {
				continue;
			};
			let key = key.trim();
			let value = value.trim();
			match key {
				"START WAL LOCATION" => {
					let (loc, timeline) = parse_location_with_file(value)?;
					start_wal_location = Some(loc);
					start_timeline = Some(timeline);
				}
				"STOP WAL LOCATION" => {
					let (loc, timeline) = parse_location_with_file(value)?;
					stop_wal_location = Some(loc);
					stop_timeline = Some(timeline);
				}
				"CHECKPOINT LOCATION" => checkpoint_location = Some(Lsn::parse(value)?),
				"START TIME" => start_time = Some(parse_timestamp(value)?),
				"STOP TIME" => stop_time = Some(parse_timestamp(value)?),
				"LABEL" => label = Some(value.to_owned()),
				_ => {}
			}
		}

		Ok(Self {
			start_wal_location: start_wal_location
				.ok_or_else(|| Error::Precondition("backup label missing START WAL LOCATION".into()))?,
			start_timeline: start_timeline.unwrap_or(1),
			stop_wal_location,
			stop_timeline,
			checkpoint_location: checkpoint_location
				.ok_or_else(|| Error::Precondition("backup label missing CHECKPOINT LOCATION".into()))?,
			start_time: start_time
				.ok_or_else(|| Error::Precondition("backup label missing START TIME".into()))?,
			stop_time,
			label: label.unwrap_or_default(),
		})
	}
}

fn parse_location_with_file(value: &str) -> Result<(Lsn, u32)> {
	let (loc, rest) = value
		.split_once(" (file ")
		.ok_or_else(|| Error::Precondition(format!("malformed WAL location field: {value:?}")))?;
	let name = rest.trim_end_matches(')');
	let segment = WalSegment::parse(name)?;
	Ok((Lsn::parse(loc)?, segment.timeline))
}

fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
	DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z")
		.map_err(|e| Error::Precondition(format!("malformed timestamp {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn renders_then_parses_back_identically() {
		let label = BackupLabel {
			start_wal_location: Lsn { series: 0, offset: 0x2000000 },
			start_timeline: 1,
			stop_wal_location: Some(Lsn { series: 0, offset: 0x3000000 }),
			stop_timeline: Some(1),
			checkpoint_location: Lsn { series: 0, offset: 0x2000028 },
			start_time: FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2026, 7, 31, 10, 0, 0).unwrap(),
			stop_time: Some(FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2026, 7, 31, 10, 5, 0).unwrap()),
			label: SLAVE_LABEL.to_owned(),
		};

		let rendered = label.render();
		assert!(rendered.contains("LABEL: OmniPITR_Slave_Hot_Backup"));
		assert!(rendered.contains("(file 000000010000000000000002)"));

		let parsed = BackupLabel::parse(&rendered).unwrap();
		assert_eq!(parsed, label);
	}
}
