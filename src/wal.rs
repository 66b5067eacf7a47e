//! WAL positions and segment arithmetic.
//!
//! An archive stores received WAL in segment files named by the standard
//! timeline/log/segment rule, e.g. `0000000100000000000000AB`, with the
//! segment currently being written carrying a `.partial` suffix:
//! - 000000010000000000000001
//! - 000000010000000000000002.partial

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// Timeline identifier; unique per promotion event in the WAL history.
pub type TimeLineId = u32;

/// Sequential number of a WAL segment within the server lifetime.
pub type SegmentNo = u64;

/// Length of a WAL segment file name, without the `.partial` suffix.
pub const SEGMENT_FNAME_LEN: usize = 24;

/// Segment size servers use unless configured otherwise at initdb time.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// A position in the WAL stream (a Postgres XLogRecPtr), monotonic per
/// server lifetime.
#[derive(Debug, Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Lsn(pub u64);

/// We tried to parse an LSN from a string, but failed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN")]
pub struct LsnParseError;

impl Lsn {
    /// Invalid position, used where the server has not reported one yet.
    pub const INVALID: Lsn = Lsn(0);

    /// True unless this is [`Lsn::INVALID`].
    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// Parse an LSN from a plain hex string, as stored in file names.
    pub fn from_hex<S: AsRef<str>>(s: S) -> Result<Self, LsnParseError> {
        let n = u64::from_str_radix(s.as_ref(), 16).or(Err(LsnParseError))?;
        Ok(Lsn(n))
    }

    /// Subtract a number of bytes, returning None on underflow.
    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }

    /// Number of the segment containing this position.
    pub fn segment_number(self, seg_size: u64) -> SegmentNo {
        self.0 / seg_size
    }

    /// Offset of this position into its segment.
    pub fn segment_offset(self, seg_size: u64) -> u64 {
        self.0 % seg_size
    }

    /// Position of the first byte of the segment containing this position.
    pub fn segment_start(self, seg_size: u64) -> Lsn {
        Lsn(self.0 - self.0 % seg_size)
    }
}

impl serde::Serialize for Lsn {
    /// Serialized in the `X/Y` text form the server reports.
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parse an LSN from the `XXXXXXXX/XXXXXXXX` form the server reports:
    /// two hex halves of at most eight digits each.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.trim().split_once('/').ok_or(LsnParseError)?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(LsnParseError);
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError)?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError)?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hi, lo) = ((self.0 >> 32) as u32, self.0 as u32);
        write!(f, "{hi:X}/{lo:X}")
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, bytes: u64) -> Lsn {
        Lsn(self.0.checked_add(bytes).expect("LSN overflow"))
    }
}

/// File name of a completed WAL segment: the timeline and the two halves
/// of the segment's start position, eight hex digits each, with the low
/// half counted in whole segments.
pub fn segment_file_name(tli: TimeLineId, segno: SegmentNo, seg_size: u64) -> String {
    let start = Lsn(segno * seg_size);
    let hi = (start.0 >> 32) as u32;
    let lo = (start.0 as u32) / (seg_size as u32);
    format!("{tli:08X}{hi:08X}{lo:08X}")
}

/// Decode `(segno, tli)` from a segment file name; `None` when the name
/// is not a completed WAL segment.
pub fn segment_from_file_name(fname: &str, seg_size: u64) -> Option<(SegmentNo, TimeLineId)> {
    if fname.len() != SEGMENT_FNAME_LEN {
        return None;
    }
    let mut fields = fname.as_bytes().chunks(8).map(|chunk| {
        let digits = std::str::from_utf8(chunk).ok()?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(digits, 16).ok()
    });
    let tli = fields.next().flatten()?;
    let hi = fields.next().flatten()?;
    let lo = fields.next().flatten()?;
    let start = Lsn(((hi as u64) << 32) + (lo as u64) * seg_size);
    Some((start.segment_number(seg_size), tli))
}

pub fn is_segment_file_name(fname: &str) -> bool {
    segment_from_file_name(fname, DEFAULT_WAL_SEGMENT_SIZE).is_some()
}

pub fn is_partial_segment_file_name(fname: &str) -> bool {
    fname
        .strip_suffix(".partial")
        .map_or(false, is_segment_file_name)
}

/// Parse a `wal_segment_size` value as the server reports it via SHOW,
/// e.g. `16MB` or `1GB`, into bytes.
pub fn parse_wal_segment_size(s: &str) -> Result<u64, LsnParseError> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().map_err(|_| LsnParseError)?;
    let mult = match unit.trim() {
        "" | "B" => 1,
        "kB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return Err(LsnParseError),
    };
    Ok(num * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_strings() {
        assert_eq!("12345678/AAAA5555".parse(), Ok(Lsn(0x12345678AAAA5555)));
        assert_eq!("0/16B3748".parse(), Ok(Lsn(0x016B3748)));
        assert_eq!("0/0".parse(), Ok(Lsn(0)));
        "ABCDEFG/12345678".parse::<Lsn>().unwrap_err();
        "16B3748".parse::<Lsn>().unwrap_err();
        "0/1/2".parse::<Lsn>().unwrap_err();

        assert_eq!(format!("{}", Lsn(0x12345678AAAA5555)), "12345678/AAAA5555");
        assert_eq!(format!("{}", Lsn(0x016B3748)), "0/16B3748");
        assert_eq!(Lsn::from_hex("16B3748"), Ok(Lsn(0x016B3748)));
        assert_eq!(Lsn::from_hex("zzz"), Err(LsnParseError));
    }

    #[test]
    fn lsn_segment_math() {
        let seg_size = DEFAULT_WAL_SEGMENT_SIZE;
        assert_eq!(Lsn(0x1000007).segment_number(seg_size), 1);
        assert_eq!(Lsn(0x1000007).segment_offset(seg_size), 7);
        assert_eq!(Lsn(0x1000007).segment_start(seg_size), Lsn(0x1000000));
        assert_eq!(Lsn(1234).checked_sub(1233u64), Some(Lsn(1)));
        assert_eq!(Lsn(1234).checked_sub(1235u64), None);
        assert_eq!(Lsn(1234) + 11u64, Lsn(1245));
    }

    #[test]
    fn segment_names() {
        let seg_size = DEFAULT_WAL_SEGMENT_SIZE;
        assert_eq!(segment_file_name(1, 1, seg_size), "000000010000000000000001");
        // segno 256 wraps into the next xlog id at 16MB segments.
        assert_eq!(
            segment_file_name(1, 256, seg_size),
            "000000010000000100000000"
        );
        assert_eq!(
            segment_from_file_name("000000010000000100000000", seg_size),
            Some((256, 1))
        );
        for segno in [0, 1, 255, 256, 100_000] {
            let name = segment_file_name(3, segno, seg_size);
            assert_eq!(segment_from_file_name(&name, seg_size), Some((segno, 3)));
        }
        assert_eq!(segment_from_file_name("notasegmentname", seg_size), None);
        assert_eq!(
            segment_from_file_name("00000001000000000000000X", seg_size),
            None
        );
        assert!(is_segment_file_name("000000010000000000000001"));
        assert!(!is_segment_file_name("00000001000000000000001"));
        assert!(is_partial_segment_file_name(
            "000000010000000000000002.partial"
        ));
        assert!(!is_partial_segment_file_name("000000010000000000000002"));
    }

    #[test]
    fn segment_size_units() {
        assert_eq!(parse_wal_segment_size("16MB"), Ok(16 * 1024 * 1024));
        assert_eq!(parse_wal_segment_size("1GB"), Ok(1024 * 1024 * 1024));
        assert_eq!(parse_wal_segment_size("16777216"), Ok(16 * 1024 * 1024));
        assert!(parse_wal_segment_size("16 parsecs").is_err());
    }
}
