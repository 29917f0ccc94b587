use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Calendar covariates derived from a date. Training rows and rollout rows
/// both go through `TimeFeatures::from_date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFeatures {
    /// 1..=366
    pub day_of_year: u32,
    /// Monday = 0 .. Sunday = 6
    pub day_of_week: u32,
    pub iso_week: u32,
    pub month: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalendarField {
    DayOfYear,
    DayOfWeek,
    IsoWeek,
    Month,
}

impl CalendarField {
    pub const ALL: [CalendarField; 4] = [
        CalendarField::DayOfYear,
        CalendarField::DayOfWeek,
        CalendarField::IsoWeek,
        CalendarField::Month,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Self::DayOfYear => "doy",
            Self::DayOfWeek => "dow",
            Self::IsoWeek => "week",
            Self::Month => "month",
        }
    }

    pub fn from_column_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.column_name() == name)
    }
}

impl TimeFeatures {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            day_of_year: date.ordinal(),
            day_of_week: date.weekday().num_days_from_monday(),
            iso_week: date.iso_week().week(),
            month: date.month(),
        }
    }

    pub fn value(&self, field: CalendarField) -> f64 {
        match field {
            CalendarField::DayOfYear => self.day_of_year as f64,
            CalendarField::DayOfWeek => self.day_of_week as f64,
            CalendarField::IsoWeek => self.iso_week as f64,
            CalendarField::Month => self.month as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_year_in_iso_week_of_previous_year() {
        // 2021-01-01 is a Friday that belongs to ISO week 53 of 2020.
        let tf = TimeFeatures::from_date(NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        assert_eq!(tf.day_of_year, 1);
        assert_eq!(tf.day_of_week, 4);
        assert_eq!(tf.iso_week, 53);
        assert_eq!(tf.month, 1);
    }

    #[test]
    fn leap_day_ordinal() {
        let tf = TimeFeatures::from_date(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(tf.day_of_year, 366);
        assert_eq!(tf.day_of_week, 1);
        assert_eq!(tf.iso_week, 1);
        assert_eq!(tf.month, 12);
    }

    #[test]
    fn column_names_round_trip() {
        for field in CalendarField::ALL {
            assert_eq!(CalendarField::from_column_name(field.column_name()), Some(field));
        }
        assert_eq!(CalendarField::from_column_name("weekday"), None);
    }
}
