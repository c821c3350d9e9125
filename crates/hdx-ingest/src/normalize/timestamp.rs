//! Timestamp normalization into the reference timezone

use crate::config::DstPolicy;
use crate::error::{AmbiguityKind, RecordError};
use chrono::{Duration, FixedOffset, LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

const LOCAL_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// A timezone-naive value in the reference frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTimestamp {
    pub value: NaiveDateTime,
    /// The offset was missing or unusable and the reference zone was assumed
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TimestampNormalizer {
    reference: Tz,
    policy: DstPolicy,
}

impl TimestampNormalizer {
    pub fn new(reference: Tz, policy: DstPolicy) -> Self {
        Self { reference, policy }
    }

    /// Normalize a raw timestamp.
    ///
    /// `raw_offset` takes precedence over an offset embedded in `raw`
    /// (`2023-01-01 23:50:00 +0530`, `2023-01-01T23:50:00+05:30`, `...Z`).
    pub fn normalize(
        &self,
        raw: &str,
        raw_offset: Option<&str>,
    ) -> Result<NormalizedTimestamp, RecordError> {
        let (local_part, embedded) = split_offset(raw);
        let local = parse_local(local_part)
            .ok_or_else(|| RecordError::InvalidTimestamp(raw.to_string()))?;

        match raw_offset.or(embedded).and_then(parse_offset) {
            Some(offset) => {
                let instant = offset
                    .from_local_datetime(&local)
                    .single()
                    .ok_or_else(|| RecordError::InvalidTimestamp(raw.to_string()))?;
                Ok(NormalizedTimestamp {
                    value: instant.with_timezone(&self.reference).naive_local(),
                    fallback: false,
                })
            },
            None => self.assume_reference(local, raw),
        }
    }

    fn assume_reference(
        &self,
        local: NaiveDateTime,
        raw: &str,
    ) -> Result<NormalizedTimestamp, RecordError> {
        let value = match self.reference.from_local_datetime(&local) {
            LocalResult::Single(dt) => dt.naive_local(),
            LocalResult::Ambiguous(earliest, latest) => match self.policy {
                DstPolicy::Earliest => earliest.naive_local(),
                DstPolicy::Latest => latest.naive_local(),
                DstPolicy::Reject => {
                    return Err(RecordError::ambiguity(
                        AmbiguityKind::Timestamp,
                        format!("{raw:?} occurs twice in {}", self.reference),
                    ))
                },
            },
            LocalResult::None => match self.policy {
                DstPolicy::Reject => {
                    return Err(RecordError::ambiguity(
                        AmbiguityKind::Timestamp,
                        format!("{raw:?} does not exist in {}", self.reference),
                    ))
                },
                _ => local + Duration::hours(1),
            },
        };

        Ok(NormalizedTimestamp {
            value,
            fallback: true,
        })
    }
}

/// Split `raw` into its local part and an offset token, if any
fn split_offset(raw: &str) -> (&str, Option<&str>) {
    let raw = raw.trim();
    let Some(tail) = raw.get(10..) else {
        return (raw, None);
    };

    if let Some(idx) = tail.rfind(['+', '-']) {
        let split = 10 + idx;
        return (raw[..split].trim_end(), Some(raw[split..].trim()));
    }
    if let Some(local) = raw.strip_suffix(['Z', 'z']) {
        return (local.trim_end(), Some("Z"));
    }
    (raw, None)
}

fn parse_local(s: &str) -> Option<NaiveDateTime> {
    LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// `Z`, `±HH`, `±HHMM` or `±HH:MM`
fn parse_offset(token: &str) -> Option<FixedOffset> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }

    let (sign, digits) = match token.split_at_checked(1)? {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn utc() -> TimestampNormalizer {
        TimestampNormalizer::new(Tz::UTC, DstPolicy::Earliest)
    }

    #[test]
    fn test_offset_sign_decides_day_boundary() {
        // East of UTC: same day, two hours earlier
        let ts = utc().normalize("2023-01-01 23:30:00 +0200", None).unwrap();
        assert_eq!(ts.value, at(2023, 1, 1, 21, 30, 0));

        // West of UTC: next day

        let ts = utc().normalize("2023-01-01T23:30:00-02:00", None).unwrap();
        assert_eq!(ts.value, at(2023, 1, 2, 1, 30, 0));
        assert!(!ts.fallback);
    }

    #[test]
    fn test_iso_forms() {
        let n = utc();
        assert_eq!(
            n.normalize("2023-01-01T23:50:00+05:30", None).unwrap().value,
            at(2023, 1, 1, 18, 20, 0)
        );
        assert_eq!(
            n.normalize("2023-06-01T08:00:00.250Z", None).unwrap().value,
            at(2023, 6, 1, 8, 0, 0) + Duration::milliseconds(250)
        );
        assert_eq!(
            n.normalize("2023-06-01 08:00:00", Some("+01:00")).unwrap().value,
            at(2023, 6, 1, 7, 0, 0)
        );
    }

    #[test]
    fn test_reference_timezone_rendering() {
        let n = TimestampNormalizer::new(chrono_tz::Asia::Kolkata, DstPolicy::Earliest);
        let ts = n.normalize("2023-01-01 18:20:00 +0000", None).unwrap();
        assert_eq!(ts.value, at(2023, 1, 1, 23, 50, 0));
    }

    #[test]
    fn test_missing_or_malformed_offset_falls_back() {
        let n = TimestampNormalizer::new(chrono_tz::Europe::Berlin, DstPolicy::Earliest);

        let ts = n.normalize("2023-03-01 10:00:00", None).unwrap();
        assert_eq!(ts.value, at(2023, 3, 1, 10, 0, 0));
        assert!(ts.fallback);

        let ts = n.normalize("2023-03-01 10:00:00 +99x", None).unwrap();
        assert_eq!(ts.value, at(2023, 3, 1, 10, 0, 0));
        assert!(ts.fallback);
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        // 02:30 does not exist in Berlin on 2023-03-26
        let n = TimestampNormalizer::new(chrono_tz::Europe::Berlin, DstPolicy::Earliest);
        let ts = n.normalize("2023-03-26 02:30:00", None).unwrap();
        assert_eq!(ts.value, at(2023, 3, 26, 3, 30, 0));

        let n = TimestampNormalizer::new(chrono_tz::Europe::Berlin, DstPolicy::Reject);
        assert!(matches!(
            n.normalize("2023-03-26 02:30:00", None),
            Err(RecordError::Ambiguity {
                kind: AmbiguityKind::Timestamp,
                ..
            })
        ));
    }

    #[test]
    fn test_dst_overlap() {
        // 02:30 happens twice in Berlin on 2023-10-29
        let n = TimestampNormalizer::new(chrono_tz::Europe::Berlin, DstPolicy::Latest);
        let ts = n.normalize("2023-10-29 02:30:00", None).unwrap();
        assert_eq!(ts.value, at(2023, 10, 29, 2, 30, 0));
        assert!(ts.fallback);

        let n = TimestampNormalizer::new(chrono_tz::Europe::Berlin, DstPolicy::Reject);
        assert!(n.normalize("2023-10-29 02:30:00", None).is_err());
        // With an explicit offset there is nothing to resolve
        assert!(n.normalize("2023-10-29 02:30:00 +0100", None).is_ok());
    }

    #[test]
    fn test_invalid_local_part() {
        for raw in ["", "yesterday", "2023-13-01 00:00:00 +0000", "2023-01-01"] {
            assert!(
                matches!(utc().normalize(raw, None), Err(RecordError::InvalidTimestamp(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("+0530"), FixedOffset::east_opt(19800));
        assert_eq!(parse_offset("-08:00"), FixedOffset::east_opt(-28800));
        assert_eq!(parse_offset("+02"), FixedOffset::east_opt(7200));
        assert_eq!(parse_offset("0530"), None);
        assert_eq!(parse_offset("+2460"), None);
    }
}
