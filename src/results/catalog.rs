/// Immutable code → description table, shared by every year of the
/// aggregate. Codes are dense from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCatalog {
    descriptions: Vec<&'static str>,
}

const HOUSING_UNIT_TYPES: [&str; 13] = [
    "OTHER UNIT",
    "HOUSE, APARTMENT, FLAT",
    "HU IN NONTRANSIENT HOTEL, MOTEL, ETC.",
    "HU PERMANENT IN TRANSIENT HOTEL, MOTEL",
    "HU IN ROOMING HOUSE",
    "MOBILE HOME OR TRAILER W/NO PERM. ROOM ADDED",
    "MOBILE HOME OR TRAILER W/1 OR MORE PERM. ROOMS ADDED",
    "HU NOT SPECIFIED ABOVE",
    "QUARTERS NOT HU IN ROOMING OR BRDING HS",
    "UNIT NOT PERM. IN TRANSIENT HOTL, MOTL",
    "UNOCCUPIED TENT SITE OR TRLR SITE",
    "STUDENT QUARTERS IN COLLEGE DORM",
    "OTHER UNIT NOT SPECIFIED ABOVE",
];

impl CodeCatalog {
    pub fn new(descriptions: Vec<&'static str>) -> Self {
        Self { descriptions }
    }

    /// CPS HEHOUSUT housing unit types, codes 0 through 12.
    pub fn housing_unit_types() -> Self {
        Self::new(HOUSING_UNIT_TYPES.to_vec())
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    /// Slot of `code` in a per-year count vector, if the code is known.
    pub fn index(&self, code: i32) -> Option<usize> {
        usize::try_from(code)
            .ok()
            .filter(|&i| i < self.descriptions.len())
    }

    pub fn contains(&self, code: i32) -> bool {
        self.index(code).is_some()
    }

    pub fn description(&self, code: i32) -> Option<&'static str> {
        self.index(code).map(|i| self.descriptions[i])
    }

    /// `(code, description)` in code order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &'static str)> + '_ {
        self.descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| (i as i32, *d))
    }
}
