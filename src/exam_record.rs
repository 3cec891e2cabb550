use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the exam statistics: a province/center/school/section/period/type/permit
/// combination with its pass and fail counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExamRecord {
    pub province: String,
    pub exam_center: String,
    pub school_code: String,
    pub school_name: String,
    pub section_code: String,
    pub month: u32,
    pub year: u32,
    pub exam_type: String,
    pub permit_name: String,
    pub passed: u32,
    pub passed_1conv: u32,
    pub passed_2conv: u32,
    pub passed_3or4conv: u32,
    pub passed_5plus: u32,
    pub failed: u32,
}

impl ExamRecord {
    pub fn period(&self) -> Period {
        Period::new(self.year, self.month)
    }

    /// Records missing any mandatory field are never stored.
    pub fn is_complete(&self) -> bool {
        !self.province.is_empty()
            && !self.exam_center.is_empty()
            && self.year > 0
            && (1..=12).contains(&self.month)
    }

    pub fn presented(&self) -> u64 {
        u64::from(self.passed) + u64::from(self.failed)
    }
}

/// A reporting cycle. Ordered by year, then month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: u32,
    pub month: u32,
}

impl Period {
    pub fn new(year: u32, month: u32) -> Self {
        Self { year, month }
    }

    /// Composite `year * 100 + month` key used by range filters. Widened so any
    /// `u32` year fits.
    pub fn key(&self) -> u64 {
        u64::from(self.year) * 100 + u64::from(self.month)
    }

    /// `None` when the year part does not fit a `u32`.
    pub fn from_key(key: u64) -> Option<Self> {
        let year = u32::try_from(key / 100).ok()?;
        let month = u32::try_from(key % 100).ok()?;
        Some(Self::new(year, month))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Text columns that can be listed with `distinct_values` and filtered by substring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    Province,
    ExamCenter,
    DrivingSchool,
    ExamType,
    Permit,
}

impl TextField {
    pub const ALL: [TextField; 5] = [
        TextField::Province,
        TextField::ExamCenter,
        TextField::DrivingSchool,
        TextField::ExamType,
        TextField::Permit,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            TextField::Province => "province",
            TextField::ExamCenter => "exam_center",
            TextField::DrivingSchool => "driving_school_name",
            TextField::ExamType => "exam_type",
            TextField::Permit => "permit_name",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_lowercase().replace('-', "_");
        match key.as_str() {
            "province" => Some(TextField::Province),
            "exam_center" | "center" => Some(TextField::ExamCenter),
            "driving_school" | "school" | "driving_school_name" => Some(TextField::DrivingSchool),
            "exam_type" | "type" => Some(TextField::ExamType),
            "permit" | "permit_name" => Some(TextField::Permit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_requires_mandatory_fields_and_valid_month() {
        let mut record = ExamRecord {
            province: "Madrid".to_string(),
            exam_center: "Madrid".to_string(),
            year: 2023,
            month: 1,
            ..Default::default()
        };
        assert!(record.is_complete());

        record.month = 13;
        assert!(!record.is_complete());
        record.month = 0;
        assert!(!record.is_complete());
        record.month = 12;
        record.exam_center.clear();
        assert!(!record.is_complete());
    }

    #[test]
    fn period_key_orders_like_periods() {
        let a = Period::new(2022, 12);
        let b = Period::new(2023, 1);
        assert!(a < b);
        assert!(a.key() < b.key());
        assert_eq!(Period::from_key(202301), Some(b));
        assert_eq!(b.to_string(), "2023-01");
    }

    #[test]
    fn period_key_holds_years_beyond_four_digits() {
        let far = Period::new(50_000_000, 1);
        assert_eq!(far.key(), 5_000_000_001);
        assert_eq!(Period::from_key(far.key()), Some(far));

        let max = Period::new(u32::MAX, 12);
        assert_eq!(Period::from_key(max.key()), Some(max));
        assert_eq!(Period::from_key(u64::MAX), None);
    }

    #[test]
    fn text_field_parse_accepts_cli_spellings() {
        assert_eq!(TextField::parse("exam-type"), Some(TextField::ExamType));
        assert_eq!(TextField::parse(" Province "), Some(TextField::Province));
        assert_eq!(TextField::parse("school"), Some(TextField::DrivingSchool));
        assert_eq!(TextField::parse("year"), None);
    }
}
