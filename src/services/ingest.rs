// src/services/ingest.rs
//
// Wire bodies for the four submission endpoints and their conversion into validated records.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{ReportSource, ReportType};

pub const MAX_HOURS_PER_REPORT: Decimal = Decimal::from_parts(24, 0, 0, false, 0);

// ─────────────────────────────────────────────────────────────────────────────
// Request bodies
// ─────────────────────────────────────────────────────────────────────────────

/// Body shared by the operator, SMT and manager endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportSubmission {
    pub workorder_id: Option<i64>,
    pub process: String,
    pub product_code: Option<String>,
    #[serde(alias = "operator_code", alias = "equipment_code")]
    pub operator_or_equipment: String,
    /// Used when `report_time` is a bare `HH:MM`; defaults to today in the canonical timezone.
    pub report_date: Option<NaiveDate>,
    pub report_time: String,
    pub quantity: i64,
    #[serde(default)]
    pub hours: Decimal,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub abnormal_notes: String,
    pub rd_workorder_number: Option<String>,
    pub rd_product_code: Option<String>,
    pub rd_sample_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnsiteStart {
    pub workorder_id: Option<i64>,
    pub process: String,
    pub product_code: Option<String>,
    #[serde(alias = "operator_code", alias = "equipment_code")]
    pub operator_or_equipment: String,
    pub report_date: Option<NaiveDate>,
    /// Defaults to now.
    pub started_at: Option<String>,
    #[serde(default)]
    pub remarks: String,
    pub rd_workorder_number: Option<String>,
    pub rd_product_code: Option<String>,
    pub rd_sample_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnsiteStop {
    pub quantity: i64,
    /// Derived from the session's elapsed time when omitted.
    pub hours: Option<Decimal>,
    pub report_date: Option<NaiveDate>,
    pub stopped_at: Option<String>,
    #[serde(default)]
    pub abnormal_notes: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportPatch {
    pub quantity: Option<i64>,
    pub hours: Option<Decimal>,
    pub report_date: Option<NaiveDate>,
    pub report_time: Option<String>,
    pub remarks: Option<String>,
    pub abnormal_notes: Option<String>,
}

impl ReportPatch {
    pub fn is_empty(&self) -> bool {
        self.quantity.is_none()
            && self.hours.is_none()
            && self.report_time.is_none()
            && self.remarks.is_none()
            && self.abnormal_notes.is_none()
    }

    pub fn touches_counted_fields(&self) -> bool {
        self.quantity.is_some() || self.hours.is_some() || self.report_time.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validated records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// A report that passed wire validation, ready for classification and insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    pub source: ReportSource,
    pub workorder_id: Option<i64>,
    pub process_name: String,
    pub product_code: String,
    pub operator_or_equipment: String,
    pub report_time: DateTime<Utc>,
    pub quantity: i64,
    pub hours: Decimal,
    pub report_type: ReportType,
    pub remarks: String,
    pub abnormal_notes: String,
    pub rd_workorder_number: Option<String>,
    pub rd_product_code: Option<String>,
    pub rd_sample_name: Option<String>,
    pub session: Option<NewSession>,
}

impl NewReport {
    pub fn dedup_key(&self) -> String {
        dedup_key(
            self.source,
            &self.operator_or_equipment,
            self.workorder_id,
            &self.process_name,
            self.report_time,
            self.quantity,
        )
    }
}

/// SHA-256 over `(source, operator_or_equipment, process_ref, report_time, quantity)`.
///
/// A process is referenced by its work-order and name, so the same process name on two
/// work-orders never collides. RD samples carry no work-order and hash a fixed marker instead.
pub fn dedup_key(
    source: ReportSource,
    operator_or_equipment: &str,
    workorder_id: Option<i64>,
    process: &str,
    report_time: DateTime<Utc>,
    quantity: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(operator_or_equipment.as_bytes());
    hasher.update(b"\x1f");
    match workorder_id {
        Some(id) => hasher.update(id.to_be_bytes()),
        None => hasher.update(b"rd"),
    }
    hasher.update(b"/");
    hasher.update(process.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(report_time.timestamp_millis().to_be_bytes());
    hasher.update(b"\x1f");
    hasher.update(quantity.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

impl ReportSubmission {
    pub fn into_new_report(
        self,
        source: ReportSource,
        tz: FixedOffset,
        now: DateTime<Utc>,
    ) -> CoreResult<NewReport> {
        if source == ReportSource::OnsiteLive {
            return Err(CoreError::invalid(
                "onsite reports are recorded through session start/stop",
            ));
        }
        let process_name = required("process", &self.process)?;
        let operator_or_equipment = required("operator_or_equipment", &self.operator_or_equipment)?;
        validate_quantity(self.quantity)?;
        let hours = validate_hours(self.hours)?;
        let report_time = parse_report_time(&self.report_time, self.report_date, tz, now)?;

        Ok(NewReport {
            source,
            workorder_id: self.workorder_id,
            process_name,
            product_code: self.product_code.map(|p| p.trim().to_string()).unwrap_or_default(),
            operator_or_equipment,
            report_time,
            quantity: self.quantity,
            hours,
            report_type: ReportType::Normal,
            remarks: self.remarks,
            abnormal_notes: self.abnormal_notes,
            rd_workorder_number: non_blank(self.rd_workorder_number),
            rd_product_code: non_blank(self.rd_product_code),
            rd_sample_name: non_blank(self.rd_sample_name),
            session: None,
        })
    }
}

impl OnsiteStart {
    pub fn into_new_report(self, tz: FixedOffset, now: DateTime<Utc>) -> CoreResult<NewReport> {
        let process_name = required("process", &self.process)?;
        let operator_or_equipment = required("operator_or_equipment", &self.operator_or_equipment)?;
        let started_at = match &self.started_at {
            Some(raw) => parse_report_time(raw, self.report_date, tz, now)?,
            None => now,
        };

        Ok(NewReport {
            source: ReportSource::OnsiteLive,
            workorder_id: self.workorder_id,
            process_name,
            product_code: self.product_code.map(|p| p.trim().to_string()).unwrap_or_default(),
            operator_or_equipment,
            report_time: started_at,
            quantity: 0,
            hours: Decimal::ZERO,
            report_type: ReportType::Normal,
            remarks: self.remarks,
            abnormal_notes: String::new(),
            rd_workorder_number: non_blank(self.rd_workorder_number),
            rd_product_code: non_blank(self.rd_product_code),
            rd_sample_name: non_blank(self.rd_sample_name),
            session: Some(NewSession {
                session_id: Uuid::new_v4(),
                started_at,
            }),
        })
    }
}

/// Closing values for an onsite session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub stopped_at: DateTime<Utc>,
    pub quantity: i64,
    pub hours: Decimal,
    pub abnormal_notes: String,
}

impl OnsiteStop {
    pub fn into_close(
        self,
        started_at: DateTime<Utc>,
        tz: FixedOffset,
        now: DateTime<Utc>,
    ) -> CoreResult<SessionClose> {
        validate_quantity(self.quantity)?;
        let stopped_at = match &self.stopped_at {
            Some(raw) => parse_report_time(raw, self.report_date, tz, now)?,
            None => now,
        };
        if stopped_at < started_at {
            return Err(CoreError::invalid("session cannot stop before it started"));
        }
        let hours = match self.hours {
            Some(h) => h,
            None => elapsed_hours(started_at, stopped_at),
        };
        Ok(SessionClose {
            stopped_at,
            quantity: self.quantity,
            hours: validate_hours(hours)?,
            abnormal_notes: self.abnormal_notes,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field rules
// ─────────────────────────────────────────────────────────────────────────────

pub fn validate_quantity(quantity: i64) -> CoreResult<()> {
    if quantity < 0 {
        return Err(CoreError::invalid(format!("quantity must be >= 0, got {quantity}")));
    }
    Ok(())
}

/// `0 <= hours <= 24`, rounded to two decimal places.
pub fn validate_hours(hours: Decimal) -> CoreResult<Decimal> {
    if hours < Decimal::ZERO {
        return Err(CoreError::invalid(format!("hours must be >= 0, got {hours}")));
    }
    if hours > MAX_HOURS_PER_REPORT {
        return Err(CoreError::invalid(format!("hours must be <= 24, got {hours}")));
    }
    Ok(hours.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

fn elapsed_hours(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    let seconds = (to - from).num_seconds().max(0);
    (Decimal::from(seconds) / Decimal::from(3600)).round_dp(2)
}

/// Accepts `HH:MM` (combined with `date` or today in `tz`), RFC 3339, or a naive
/// `YYYY-MM-DD HH:MM[:SS]` read in `tz`.
pub fn parse_report_time(
    raw: &str,
    date: Option<NaiveDate>,
    tz: FixedOffset,
    now: DateTime<Utc>,
) -> CoreResult<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CoreError::invalid("report_time is required"));
    }

    if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M") {
        let day = date.unwrap_or_else(|| now.with_timezone(&tz).date_naive());
        return local_to_utc(day.and_time(time), tz, raw);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return local_to_utc(naive, tz, raw);
        }
    }

    Err(CoreError::invalid(format!(
        "report_time '{raw}' is neither HH:MM nor a timestamp"
    )))
}

fn local_to_utc(naive: NaiveDateTime, tz: FixedOffset, raw: &str) -> CoreResult<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| CoreError::invalid(format!("report_time '{raw}' is ambiguous")))
}

fn required(field: &str, value: &str) -> CoreResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taipei() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).expect("valid offset")
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    fn submission(json: serde_json::Value) -> ReportSubmission {
        serde_json::from_value(json).expect("valid body")
    }

    #[test]
    fn hh_mm_is_read_in_taipei_on_the_given_day() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 2);
        let parsed = parse_report_time("09:30", day, taipei(), at("2026-03-05T00:00:00Z"))
            .expect("parses");
        assert_eq!(parsed, at("2026-03-02T01:30:00Z"));
    }

    #[test]
    fn hh_mm_without_date_uses_local_today() {
        // 17:00 UTC on the 1st is already 01:00 on the 2nd in Taipei.
        let now = at("2026-03-01T17:00:00Z");
        let parsed = parse_report_time("08:00", None, taipei(), now).expect("parses");
        assert_eq!(parsed, at("2026-03-02T00:00:00Z"));
    }

    #[test]
    fn full_timestamps_are_accepted() {
        let now = at("2026-03-05T00:00:00Z");
        assert_eq!(
            parse_report_time("2026-03-02T10:00:00+08:00", None, taipei(), now).expect("rfc3339"),
            at("2026-03-02T02:00:00Z")
        );
        assert_eq!(
            parse_report_time("2026-03-02 10:00", None, taipei(), now).expect("naive"),
            at("2026-03-02T02:00:00Z")
        );
        assert!(parse_report_time("25:99", None, taipei(), now).is_err());
        assert!(parse_report_time("  ", None, taipei(), now).is_err());
    }

    #[test]
    fn hours_above_a_day_are_rejected() {
        assert!(validate_hours(Decimal::new(2401, 2)).is_err());
        assert!(validate_hours(Decimal::new(-1, 0)).is_err());
        assert_eq!(validate_hours(Decimal::new(24, 0)).expect("24h ok"), Decimal::new(24, 0));
        assert_eq!(
            validate_hours(Decimal::new(12345, 3)).expect("rounds"),
            Decimal::new(1235, 2)
        );
    }

    #[test]
    fn negative_quantity_is_invalid_input() {
        let body = submission(serde_json::json!({
            "workorder_id": 1, "process": "SMT", "operator_or_equipment": "OP-1",
            "report_time": "09:00", "quantity": -5
        }));
        let err = body
            .into_new_report(ReportSource::OperatorSupplement, taipei(), at("2026-03-02T00:00:00Z"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn unknown_fields_are_rejected_at_the_wire() {
        let result: Result<ReportSubmission, _> = serde_json::from_value(serde_json::json!({
            "workorder_id": 1, "process": "SMT", "operator_or_equipment": "OP-1",
            "report_time": "09:00", "quantity": 5, "shift": "night"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn operator_code_alias_is_accepted() {
        let body = submission(serde_json::json!({
            "process": "assembly", "operator_code": "OP-9",
            "report_time": "2026-03-02 09:00", "quantity": 3, "hours": "1.5"
        }));
        let report = body
            .into_new_report(ReportSource::OperatorSupplement, taipei(), at("2026-03-02T00:00:00Z"))
            .expect("valid");
        assert_eq!(report.operator_or_equipment, "OP-9");
        assert_eq!(report.hours, Decimal::new(150, 2));
        assert_eq!(report.workorder_id, None);
    }

    #[test]
    fn dedup_key_changes_with_quantity_only_when_it_should() {
        let t = at("2026-03-02T01:00:00Z");
        let a = dedup_key(ReportSource::SmtProduction, "LINE-1", Some(7), "SMT", t, 10);
        let b = dedup_key(ReportSource::SmtProduction, "LINE-1", Some(7), "SMT", t, 10);
        let c = dedup_key(ReportSource::SmtProduction, "LINE-1", Some(7), "SMT", t, 11);
        let d = dedup_key(ReportSource::OperatorSupplement, "LINE-1", Some(7), "SMT", t, 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn same_process_name_on_another_workorder_is_a_different_report() {
        let body = |workorder_id: i64| {
            submission(serde_json::json!({
                "workorder_id": workorder_id, "process": "SMT", "operator_or_equipment": "OP-1",
                "report_date": "2026-03-02", "report_time": "09:00", "quantity": 30
            }))
            .into_new_report(ReportSource::OperatorSupplement, taipei(), at("2026-03-02T00:00:00Z"))
            .expect("valid")
        };
        let first = body(1);
        let second = body(2);
        assert_ne!(first.dedup_key(), second.dedup_key());
        assert_eq!(first.dedup_key(), body(1).dedup_key());

        let t = at("2026-03-02T01:00:00Z");
        assert_ne!(
            dedup_key(ReportSource::OperatorSupplement, "OP-1", None, "SMT", t, 30),
            dedup_key(ReportSource::OperatorSupplement, "OP-1", Some(1), "SMT", t, 30)
        );
    }

    #[test]
    fn onsite_stop_derives_hours_from_elapsed_time() {
        let started = at("2026-03-02T01:00:00Z");
        let stop = OnsiteStop {
            quantity: 20,
            hours: None,
            report_date: None,
            stopped_at: None,
            abnormal_notes: String::new(),
        };
        let close = stop
            .into_close(started, taipei(), at("2026-03-02T02:30:00Z"))
            .expect("valid close");
        assert_eq!(close.hours, Decimal::new(150, 2));
        assert_eq!(close.quantity, 20);
    }

    #[test]
    fn onsite_stop_before_start_is_rejected() {
        let stop = OnsiteStop {
            quantity: 1,
            hours: None,
            report_date: None,
            stopped_at: Some("2026-03-02T00:00:00Z".into()),
            abnormal_notes: String::new(),
        };
        assert!(stop
            .into_close(at("2026-03-02T01:00:00Z"), taipei(), at("2026-03-02T02:00:00Z"))
            .is_err());
    }
}
