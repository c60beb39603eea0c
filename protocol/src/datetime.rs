//! Integer forms of temporal values: dates travel as `YYYYMMDD`, datetimes
//! as `YYYYMMDDhhmmss` (second precision).

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

pub fn date_to_int8(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

pub fn int8_to_date(value: i32) -> Option<NaiveDate> {
    let (year, rest) = (value / 10_000, value % 10_000);
    NaiveDate::from_ymd_opt(year, (rest / 100) as u32, (rest % 100) as u32)
}

pub fn datetime_to_int14(datetime: NaiveDateTime) -> i64 {
    let date = date_to_int8(datetime.date()) as i64;
    date * 1_000_000
        + datetime.hour() as i64 * 10_000
        + datetime.minute() as i64 * 100
        + datetime.second() as i64
}

pub fn int14_to_datetime(value: i64) -> Option<NaiveDateTime> {
    let date = int8_to_date((value / 1_000_000) as i32)?;
    let rest = value % 1_000_000;
    date.and_hms_opt(
        (rest / 10_000) as u32,
        (rest / 100 % 100) as u32,
        (rest % 100) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_round_trip() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 14).unwrap();
        assert_eq!(date_to_int8(date), 20210314);
        assert_eq!(int8_to_date(20210314), Some(date));
    }

    #[test]
    fn test_datetime_round_trip() {
        let datetime = NaiveDate::from_ymd_opt(1999, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 58)
            .unwrap();
        assert_eq!(datetime_to_int14(datetime), 19991231235958);
        assert_eq!(int14_to_datetime(19991231235958), Some(datetime));
    }

    #[test]
    fn test_invalid_components() {
        assert_eq!(int8_to_date(20211301), None);
        assert_eq!(int8_to_date(20210230), None);
        assert_eq!(int14_to_datetime(20210101250000), None);
    }
}
