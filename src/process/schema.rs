/// One fixed-width column of a CPS public-use record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWidthField {
    pub name: &'static str,
    /// zero-based byte offset
    pub offset: usize,
    pub len: usize,
}

/// Type of housing unit, `" 1"` through `"12"` (zero-relative bytes 30..32).
pub const HEHOUSUT: FixedWidthField = FixedWidthField {
    name: "HEHOUSUT",
    offset: 30,
    len: 2,
};

impl FixedWidthField {
    /// The field's bytes with surrounding whitespace trimmed, or `None` when
    /// the record is too short or the slice is not valid text. Bytes outside
    /// the field are never inspected.
    pub fn decode<'a>(&self, record: &'a [u8]) -> Option<&'a str> {
        let raw = record.get(self.offset..self.offset + self.len)?;
        std::str::from_utf8(raw).ok().map(str::trim)
    }

    /// `decode` followed by an integer parse.
    pub fn decode_int(&self, record: &[u8]) -> Option<i32> {
        self.decode(record)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(code: &str) -> Vec<u8> {
        format!("{}{}{}", "x".repeat(30), code, "y".repeat(20)).into_bytes()
    }

    #[test]
    fn decodes_and_trims_housing_type() {
        assert_eq!(HEHOUSUT.decode(&record_with(" 1")), Some("1"));
        assert_eq!(HEHOUSUT.decode(&record_with("12")), Some("12"));
        assert_eq!(HEHOUSUT.decode_int(&record_with("1 ")), Some(1));
    }

    #[test]
    fn short_or_blank_records_yield_nothing() {
        assert_eq!(HEHOUSUT.decode(b"too short"), None);
        assert_eq!(HEHOUSUT.decode("x".repeat(31).as_bytes()), None);
        assert_eq!(HEHOUSUT.decode_int(&record_with("  ")), None);
        assert_eq!(HEHOUSUT.decode_int(&record_with("ab")), None);
    }

    #[test]
    fn exact_length_record_is_enough() {
        assert_eq!(HEHOUSUT.decode_int(&record_with("7 ")[..32]), Some(7));
    }

    #[test]
    fn offsets_count_bytes_not_characters() {
        let mut record = b"x".repeat(28);
        record[5] = 0xe9;
        record.extend_from_slice(b" 71 yyyy");
        assert_eq!(HEHOUSUT.decode_int(&record), Some(1));

        // multi-byte text before the field does not shift it
        let mut accented = "é".repeat(14).into_bytes();
        accented.extend_from_slice(b"xx 9yyyy");
        assert_eq!(HEHOUSUT.decode_int(&accented), Some(9));
    }

    #[test]
    fn non_text_field_bytes_yield_nothing() {
        let mut record = b"x".repeat(30);
        record.extend_from_slice(b"\xff1yyyy");
        assert_eq!(HEHOUSUT.decode(&record), None);
    }
}
