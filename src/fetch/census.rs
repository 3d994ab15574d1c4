use std::fmt;
use std::str::FromStr;

use url::Url;

const CPS_BASIC: &str = "https://www2.census.gov/programs-surveys/cps/datasets";

/// Calendar month, spelled the way CPS file names abbreviate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Month {
    Jan,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

impl Month {
    pub const ALL: [Month; 12] = [
        Month::Jan,
        Month::Feb,
        Month::Mar,
        Month::Apr,
        Month::May,
        Month::Jun,
        Month::Jul,
        Month::Aug,
        Month::Sep,
        Month::Oct,
        Month::Nov,
        Month::Dec,
    ];

    pub fn abbrev(self) -> &'static str {
        match self {
            Month::Jan => "jan",
            Month::Feb => "feb",
            Month::Mar => "mar",
            Month::Apr => "apr",
            Month::May => "may",
            Month::Jun => "jun",
            Month::Jul => "jul",
            Month::Aug => "aug",
            Month::Sep => "sep",
            Month::Oct => "oct",
            Month::Nov => "nov",
            Month::Dec => "dec",
        }
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

impl FromStr for Month {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Month::ALL
            .into_iter()
            .find(|m| m.abbrev() == s)
            .ok_or_else(|| format!("unknown month {:?}", s))
    }
}

/// Public-use basic monthly file, e.g. `.../2020/basic/jan20pub.dat.gz`.
pub fn census_url(year: i32, month: Month) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{}/basic/{}{:02}pub.dat.gz",
        CPS_BASIC,
        year,
        month,
        year.rem_euclid(100)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_census_urls() {
        assert_eq!(
            census_url(2020, Month::Jan).unwrap().as_str(),
            "https://www2.census.gov/programs-surveys/cps/datasets/2020/basic/jan20pub.dat.gz"
        );
        assert_eq!(
            census_url(2005, Month::Dec).unwrap().as_str(),
            "https://www2.census.gov/programs-surveys/cps/datasets/2005/basic/dec05pub.dat.gz"
        );
    }

    #[test]
    fn parses_month_abbreviations() {
        assert_eq!("feb".parse::<Month>(), Ok(Month::Feb));
        assert_eq!(" DEC ".parse::<Month>(), Ok(Month::Dec));
        assert!("february".parse::<Month>().is_err());
    }

    #[test]
    fn all_is_calendar_ordered() {
        let mut sorted = Month::ALL;
        sorted.sort();
        assert_eq!(sorted, Month::ALL);
        assert_eq!(Month::ALL[11].to_string(), "dec");
    }
}
