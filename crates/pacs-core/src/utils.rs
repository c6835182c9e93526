//! 通用工具函数

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// HL7时间格式: YYYYMMDDHHMMSS
pub fn format_hl7_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d%H%M%S").to_string()
}

/// 解析HL7日期时间
///
/// 接受 `YYYYMMDD[HH[MM[SS[.S+]]]][+/-ZZZZ]`，时区偏移被忽略并按UTC处理。
pub fn parse_hl7_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let cleaned = value
        .split(&['+', '-'][..])
        .next()
        .unwrap_or(value)
        .split('.')
        .next()
        .unwrap_or(value)
        .trim();

    if !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let naive = match cleaned.len() {
        8 => NaiveDate::parse_from_str(cleaned, "%Y%m%d").ok()?.and_hms_opt(0, 0, 0)?,
        10 => NaiveDateTime::parse_from_str(&format!("{cleaned}0000"), "%Y%m%d%H%M%S").ok()?,
        12 => NaiveDateTime::parse_from_str(&format!("{cleaned}00"), "%Y%m%d%H%M%S").ok()?,
        14 => NaiveDateTime::parse_from_str(cleaned, "%Y%m%d%H%M%S").ok()?,
        _ => return None,
    };

    Utc.from_local_datetime(&naive).single()
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1..2"));
    }

    #[test]
    fn test_hl7_timestamp_formats() {
        let full = parse_hl7_timestamp("20241030120545").unwrap();
        assert_eq!((full.hour(), full.minute(), full.second()), (12, 5, 45));

        let with_zone = parse_hl7_timestamp("20241030120545.1234+0800").unwrap();
        assert_eq!(with_zone, full);

        let date_only = parse_hl7_timestamp("20241030").unwrap();
        assert_eq!((date_only.year(), date_only.month(), date_only.day()), (2024, 10, 30));
        assert_eq!(date_only.hour(), 0);

        assert!(parse_hl7_timestamp("").is_none());
        assert!(parse_hl7_timestamp("2024AB30").is_none());
        assert!(parse_hl7_timestamp("20241340").is_none());
    }

    #[test]
    fn test_format_roundtrip() {
        let ts = parse_hl7_timestamp("19991227140800").unwrap();
        assert_eq!(format_hl7_timestamp(&ts), "19991227140800");
    }
}
