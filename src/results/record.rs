use std::fmt;

use crate::process::batch::{parse_year, ParseError};

/// Ordered classification codes extracted from one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub year: i32,
    pub codes: Vec<i32>,
}

impl ResultRecord {
    /// `"<year>:<code>,<code>,..."`; no codes gives `"<year>:"`.
    pub fn to_wire(&self) -> String {
        let codes: Vec<String> = self.codes.iter().map(i32::to_string).collect();
        format!("{}:{}", self.year, codes.join(","))
    }

    /// Lenient parse: the year must be an integer, code tokens that are not
    /// are dropped.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(ParseError::Empty);
        }
        let (year, codes) = payload
            .split_once(':')
            .ok_or_else(|| ParseError::Separator(payload.to_string()))?;
        Ok(Self {
            year: parse_year(year)?,
            codes: codes
                .split(',')
                .filter_map(|c| c.trim().parse().ok())
                .collect(),
        })
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
