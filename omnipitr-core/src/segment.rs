//! The WAL segment name model: a 24 hex-character name encoding
//! `<timeline:8><logical-series:8><offset:8>`, plus its two siblings in the
//! archive namespace, `.history` files and `.backup` sentinels.

use std::fmt;

use crate::error::{Error, Result};

/// Segments are fixed at 16 MiB (`256^3` bytes), the historical PostgreSQL
/// default WAL segment size.
pub const SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

/// A 16 MiB WAL segment's name: 24 hex characters, ordered lexicographically
/// (equivalently, numerically on `(timeline, series, segno)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
	pub timeline: u32,
	pub series: u32,
	/// Index of this 16 MiB segment within the 4 GiB logical series
	/// (`0..=255`, since `4 GiB / 16 MiB == 256`).
	pub segno: u32,
}

/// A WAL log sequence number, as used in `pg_controldata`/`.backup` text:
/// `<series>/<offset>` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lsn {
	pub series: u32,
	pub offset: u32,
}

impl fmt::Display for Lsn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:X}/{:X}", self.series, self.offset)
	}
}

impl Lsn {
	pub fn parse(s: &str) -> Result<Self> {
		let (series, offset) = s
			.split_once('/')
			.ok_or_else(|| Error::Precondition(format!("malformed LSN: {s:?}")))?;
		Ok(Self {
			series: u32::from_str_radix(series, 16)
				.map_err(|_| Error::Precondition(format!("malformed LSN series: {s:?}")))?,
			offset: u32::from_str_radix(offset, 16)
				.map_err(|_| Error::Precondition(format!("malformed LSN offset: {s:?}")))?,
		})
	}
}

impl WalSegment {
	/// `sprintf("%08X%08X%08X", timeline, series, offset>>24)`, the formula
	/// used throughout the backup engine and retention controller to turn an
	/// LSN plus timeline into the name of the segment that contains it.
	pub fn from_lsn(lsn: Lsn, timeline: u32) -> Self {
		Self {
			timeline,
			series: lsn.series,
			segno: lsn.offset >> 24,
		}
	}

	pub fn name(&self) -> String {
		format!("{:08X}{:08X}{:08X}", self.timeline, self.series, self.segno)
	}

	pub fn parse(s: &str) -> Result<Self> {
		if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
			return Err(Error::Precondition(format!(
				"segment name {s:?} is not 24 hex characters"
			)));
		}
		let timeline = u32::from_str_radix(&s[0..8], 16).unwrap();
		let series = u32::from_str_radix(&s[8..16], 16).unwrap();
		let segno = u32::from_str_radix(&s[16..24], 16).unwrap();
		Ok(Self {
			timeline,
			series,
			segno,
		})
	}
}

impl fmt::Display for WalSegment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name())
	}
}

/// A name found in the archive namespace: a plain segment, a timeline
/// history file, or a `.backup` sentinel. `.history` and `.backup` entries
/// share the namespace with segments but aren't 16 MiB blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEntry {
	Segment(WalSegment),
	History(u32),
	BackupSentinel { segment: WalSegment, offset: u32 },
}

impl ArchiveEntry {
	/// Validates a segment/history/backup-sentinel name against
	/// `^[0-9a-fA-F]{24}(\.[0-9a-fA-F]{8}\.backup)?$` or
	/// `^[0-9a-fA-F]{8}\.history$`.
	pub fn parse(s: &str) -> Result<Self> {
		if let Some(timeline_hex) = s.strip_suffix(".history") {
			if timeline_hex.len() == 8 && timeline_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
				let timeline = u32::from_str_radix(timeline_hex, 16).unwrap();
				return Ok(Self::History(timeline));
			}
			return Err(invalid_name(s));
		}

		if let Some(rest) = s.strip_suffix(".backup") {
			let mut parts = rest.rsplitn(2, '.');
			let offset_hex = parts.next().ok_or_else(|| invalid_name(s))?;
			let seg_part = parts.next().ok_or_else(|| invalid_name(s))?;
			if offset_hex.len() == 8 && offset_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
				let segment = WalSegment::parse(seg_part)?;
				let offset = u32::from_str_radix(offset_hex, 16).unwrap();
				return Ok(Self::BackupSentinel { segment, offset });
			}
			return Err(invalid_name(s));
		}

		WalSegment::parse(s).map(Self::Segment)
	}

	pub fn name(&self) -> String {
		match self {
			Self::Segment(seg) => seg.name(),
			Self::History(timeline) => format!("{timeline:08X}.history"),
			Self::BackupSentinel { segment, offset } => {
				format!("{}.{:08X}.backup", segment.name(), offset)
			}
		}
	}

	/// `None` for `.history`/`.backup` entries, which don't carry the fixed
	/// 16 MiB size invariant plain segments do.
	pub fn as_segment(&self) -> Option<WalSegment> {
		match self {
			Self::Segment(seg) => Some(*seg),
			_ => None,
		}
	}
}

fn invalid_name(s: &str) -> Error {
	Error::Precondition(format!("{s:?} is not a valid WAL archive entry name"))
}
