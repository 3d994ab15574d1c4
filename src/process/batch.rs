use std::fmt;

use thiserror::Error;
use tracing::debug;

/// Records per batch on the compute topic.
pub const BATCH_SIZE: usize = 10;

/// Malformed wire payloads. Callers discard these rather than surface them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("invalid year {0:?}")]
    Year(String),
    #[error("missing ':' separator in {0:?}")]
    Separator(String),
}

/// A year marker plus up to `BATCH_SIZE` raw fixed-width records. Records
/// are kept as bytes so field offsets stay byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub year: i32,
    pub records: Vec<Vec<u8>>,
}

impl Batch {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            records: Vec::with_capacity(BATCH_SIZE),
        }
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= BATCH_SIZE
    }

    /// `"<year>\n<record>\n...<record>\n"`
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = format!("{}\n", self.year).into_bytes();
        for r in &self.records {
            out.extend_from_slice(r);
            out.push(b'\n');
        }
        out
    }

    /// Parses the wire form. The first line, trimmed, must be the year; every
    /// following line is a record, kept verbatim apart from a trailing `\r`.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut lines = payload
            .strip_suffix(b"\n")
            .unwrap_or(payload)
            .split(|&b| b == b'\n')
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l));
        let year_line = lines.next().filter(|l| !l.is_empty()).ok_or(ParseError::Empty)?;
        let year = parse_year(&String::from_utf8_lossy(year_line))?;
        let records: Vec<Vec<u8>> = lines.map(<[u8]>::to_vec).collect();
        if records.len() > BATCH_SIZE {
            debug!(year, records = records.len(), "oversized batch");
        }
        Ok(Self { year, records })
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_wire()))
    }
}

pub(crate) fn parse_year(s: &str) -> Result<i32, ParseError> {
    let t = s.trim();
    t.parse().map_err(|_| ParseError::Year(t.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_has_year_first_and_trailing_newlines() {
        let mut b = Batch::new(2020);
        b.records.push(b"aaa".to_vec());
        b.records.push(b"bbb".to_vec());
        assert_eq!(b.to_wire(), b"2020\naaa\nbbb\n");
    }

    #[test]
    fn parse_reads_year_and_records() {
        let b = Batch::parse(b" 2019 \nrec one\r\nrec two\n").unwrap();
        assert_eq!(b.year, 2019);
        assert_eq!(b.records, vec![b"rec one".to_vec(), b"rec two".to_vec()]);
    }

    #[test]
    fn parse_keeps_non_utf8_bytes_verbatim() {
        let b = Batch::parse(b"2020\nab\xe9cd\n").unwrap();
        assert_eq!(b.records, vec![b"ab\xe9cd".to_vec()]);
    }

    #[test]
    fn parse_rejects_bad_year() {
        assert_eq!(Batch::parse(b""), Err(ParseError::Empty));
        assert_eq!(Batch::parse(b"\n"), Err(ParseError::Empty));
        assert_eq!(
            Batch::parse(b"twenty\nx\n"),
            Err(ParseError::Year("twenty".into()))
        );
    }

    #[test]
    fn oversized_batch_still_parses() {
        crate::init_test_logging();
        let payload = format!("2020\n{}", "r\n".repeat(BATCH_SIZE + 2));
        let b = Batch::parse(payload.as_bytes()).unwrap();
        assert_eq!(b.records.len(), BATCH_SIZE + 2);
    }

    #[test]
    fn full_at_batch_size() {
        let mut b = Batch::new(1999);
        for i in 0..BATCH_SIZE {
            assert!(!b.is_full());
            b.records.push(i.to_string().into_bytes());
        }
        assert!(b.is_full());
    }
}
