// src/models/report.rs

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::permission::PermissionType;
use super::UnknownVariant;

/// Product code stamped on reports that carry no work-order.
pub const RD_SAMPLE_PRODUCT_CODE: &str = "RD樣品產品";

// ───────────────────────────────────────
// Enumerations
// ───────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSource {
    #[serde(rename = "operator")]
    OperatorSupplement,
    #[serde(rename = "smt")]
    SmtProduction,
    #[serde(rename = "onsite")]
    OnsiteLive,
    #[serde(rename = "manager")]
    ManagerReport,
}

impl ReportSource {
    pub const ALL: [ReportSource; 4] = [
        Self::OperatorSupplement,
        Self::SmtProduction,
        Self::OnsiteLive,
        Self::ManagerReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperatorSupplement => "operator",
            Self::SmtProduction => "smt",
            Self::OnsiteLive => "onsite",
            Self::ManagerReport => "manager",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::OperatorSupplement => "workorder_operator_supplement_report",
            Self::SmtProduction => "workorder_smt_production_report",
            Self::OnsiteLive => "workorder_onsite_report",
            Self::ManagerReport => "workorder_manager_production_report",
        }
    }

    /// Which work permission an actor needs to submit or decide this kind of report.
    pub fn permission(&self) -> PermissionType {
        match self {
            Self::OnsiteLive => PermissionType::OnsiteReporting,
            _ => PermissionType::FillWork,
        }
    }
}

impl FromStr for ReportSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(Self::OperatorSupplement),
            "smt" => Ok(Self::SmtProduction),
            "onsite" => Ok(Self::OnsiteLive),
            "manager" => Ok(Self::ManagerReport),
            other => Err(UnknownVariant::new("report source", other)),
        }
    }
}

text_enum!(ReportSource);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Normal,
    RdSample,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::RdSample => "rd_sample",
        }
    }
}

impl FromStr for ReportType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "rd_sample" => Ok(Self::RdSample),
            other => Err(UnknownVariant::new("report type", other)),
        }
    }
}

text_enum!(ReportType);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant::new("approval state", other)),
        }
    }
}

text_enum!(ApprovalState);

// ───────────────────────────────────────
// Report record (tagged variant over a shared header)
// ───────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub report_id: i64,
    pub workorder_id: Option<i64>,
    pub process_id: Option<i64>,
    pub process_name: String,
    pub product_code: String,
    pub operator_or_equipment: String,
    pub report_time: DateTime<Utc>,
    pub quantity: i64,
    pub hours: Decimal,
    pub report_type: ReportType,
    pub approval_state: ApprovalState,
    pub approved_at: Option<DateTime<Utc>>,
    pub approver: Option<String>,
    pub remarks: String,
    pub abnormal_notes: String,
    pub auto_completed: bool,
    pub completion_time: Option<DateTime<Utc>>,
    pub cumulative_quantity: i64,
    pub cumulative_hours: Decimal,
    pub rd_workorder_number: Option<String>,
    pub rd_product_code: Option<String>,
    pub rd_sample_name: Option<String>,
    pub submitted_by: String,
    pub needs_reconciliation: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnsiteSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Report {
    #[serde(rename = "operator")]
    OperatorSupplement(ReportHeader),
    #[serde(rename = "smt")]
    SmtProduction(ReportHeader),
    #[serde(rename = "onsite")]
    OnsiteLive {
        #[serde(flatten)]
        header: ReportHeader,
        #[serde(flatten)]
        session: OnsiteSession,
    },
    #[serde(rename = "manager")]
    ManagerReport(ReportHeader),
}

impl Report {
    pub fn source(&self) -> ReportSource {
        match self {
            Self::OperatorSupplement(_) => ReportSource::OperatorSupplement,
            Self::SmtProduction(_) => ReportSource::SmtProduction,
            Self::OnsiteLive { .. } => ReportSource::OnsiteLive,
            Self::ManagerReport(_) => ReportSource::ManagerReport,
        }
    }

    pub fn header(&self) -> &ReportHeader {
        match self {
            Self::OperatorSupplement(h) | Self::SmtProduction(h) | Self::ManagerReport(h) => h,
            Self::OnsiteLive { header, .. } => header,
        }
    }
}

/// Flat row as read from the `production_report_all` view.
#[derive(Debug, Clone, FromRow)]
pub struct ReportRow {
    pub source: ReportSource,
    pub report_id: i64,
    pub workorder_id: Option<i64>,
    pub process_id: Option<i64>,
    pub process_name: String,
    pub product_code: String,
    pub operator_or_equipment: String,
    pub report_time: DateTime<Utc>,
    pub quantity: i64,
    pub hours: Decimal,
    pub report_type: ReportType,
    pub approval_state: ApprovalState,
    pub approved_at: Option<DateTime<Utc>>,
    pub approver: Option<String>,
    pub remarks: String,
    pub abnormal_notes: String,
    pub auto_completed: bool,
    pub completion_time: Option<DateTime<Utc>>,
    pub cumulative_quantity: i64,
    pub cumulative_hours: Decimal,
    pub rd_workorder_number: Option<String>,
    pub rd_product_code: Option<String>,
    pub rd_sample_name: Option<String>,
    pub submitted_by: String,
    pub needs_reconciliation: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ReportRow {
    /// An onsite session only produces countable quantity once it is closed.
    pub fn is_open_session(&self) -> bool {
        self.source == ReportSource::OnsiteLive && self.stopped_at.is_none()
    }
}

pub const REPORT_VIEW_COLUMNS: &str = "source, report_id, workorder_id, process_id, process_name, \
     product_code, operator_or_equipment, report_time, quantity, hours, report_type, approval_state, \
     approved_at, approver, remarks, abnormal_notes, auto_completed, completion_time, \
     cumulative_quantity, cumulative_hours, rd_workorder_number, rd_product_code, rd_sample_name, \
     submitted_by, needs_reconciliation, archived_at, created_at, updated_at, session_id, \
     started_at, stopped_at";

impl From<ReportRow> for Report {
    fn from(row: ReportRow) -> Self {
        let header = ReportHeader {
            report_id: row.report_id,
            workorder_id: row.workorder_id,
            process_id: row.process_id,
            process_name: row.process_name,
            product_code: row.product_code,
            operator_or_equipment: row.operator_or_equipment,
            report_time: row.report_time,
            quantity: row.quantity,
            hours: row.hours,
            report_type: row.report_type,
            approval_state: row.approval_state,
            approved_at: row.approved_at,
            approver: row.approver,
            remarks: row.remarks,
            abnormal_notes: row.abnormal_notes,
            auto_completed: row.auto_completed,
            completion_time: row.completion_time,
            cumulative_quantity: row.cumulative_quantity,
            cumulative_hours: row.cumulative_hours,
            rd_workorder_number: row.rd_workorder_number,
            rd_product_code: row.rd_product_code,
            rd_sample_name: row.rd_sample_name,
            submitted_by: row.submitted_by,
            needs_reconciliation: row.needs_reconciliation,
            archived_at: row.archived_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };

        match row.source {
            ReportSource::OperatorSupplement => Self::OperatorSupplement(header),
            ReportSource::SmtProduction => Self::SmtProduction(header),
            ReportSource::ManagerReport => Self::ManagerReport(header),
            ReportSource::OnsiteLive => {
                // session columns are NOT NULL on the onsite table
                let session = OnsiteSession {
                    session_id: row.session_id.unwrap_or_default(),
                    started_at: row.started_at.unwrap_or(header.report_time),
                    stopped_at: row.stopped_at,
                };
                Self::OnsiteLive { header, session }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ReportHeader {
        let at = DateTime::parse_from_rfc3339("2026-03-02T01:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        ReportHeader {
            report_id: 11,
            workorder_id: Some(3),
            process_id: Some(5),
            process_name: "SMT".into(),
            product_code: "P-100".into(),
            operator_or_equipment: "OP-7".into(),
            report_time: at,
            quantity: 40,
            hours: Decimal::new(150, 2),
            report_type: ReportType::Normal,
            approval_state: ApprovalState::Approved,
            approved_at: Some(at),
            approver: Some("lead".into()),
            remarks: String::new(),
            abnormal_notes: String::new(),
            auto_completed: false,
            completion_time: None,
            cumulative_quantity: 40,
            cumulative_hours: Decimal::new(150, 2),
            rd_workorder_number: None,
            rd_product_code: None,
            rd_sample_name: None,
            submitted_by: "lead".into(),
            needs_reconciliation: false,
            archived_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn report_serializes_with_source_tag() {
        let report = Report::SmtProduction(header());
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["source"], "smt");
        assert_eq!(json["report_id"], 11);
        assert_eq!(json["approval_state"], "approved");
    }

    #[test]
    fn onsite_rows_keep_their_session_fields() {
        let h = header();
        let session_id = Uuid::new_v4();
        let row = ReportRow {
            source: ReportSource::OnsiteLive,
            report_id: h.report_id,
            workorder_id: h.workorder_id,
            process_id: h.process_id,
            process_name: h.process_name.clone(),
            product_code: h.product_code.clone(),
            operator_or_equipment: h.operator_or_equipment.clone(),
            report_time: h.report_time,
            quantity: 0,
            hours: Decimal::ZERO,
            report_type: h.report_type,
            approval_state: ApprovalState::Pending,
            approved_at: None,
            approver: None,
            remarks: String::new(),
            abnormal_notes: String::new(),
            auto_completed: false,
            completion_time: None,
            cumulative_quantity: 0,
            cumulative_hours: Decimal::ZERO,
            rd_workorder_number: None,
            rd_product_code: None,
            rd_sample_name: None,
            submitted_by: h.submitted_by.clone(),
            needs_reconciliation: false,
            archived_at: None,
            created_at: h.created_at,
            updated_at: h.updated_at,
            session_id: Some(session_id),
            started_at: Some(h.report_time),
            stopped_at: None,
        };
        assert!(row.is_open_session());

        let mut closed = row.clone();
        closed.stopped_at = Some(h.report_time);
        assert!(!closed.is_open_session());

        let report = Report::from(row);
        assert_eq!(report.source(), ReportSource::OnsiteLive);
        assert_eq!(report.header().report_id, 11);
        match report {
            Report::OnsiteLive { session, .. } => {
                assert_eq!(session.session_id, session_id);
                assert_eq!(session.stopped_at, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn onsite_reports_need_onsite_permission() {
        assert_eq!(ReportSource::OnsiteLive.permission(), PermissionType::OnsiteReporting);
        assert_eq!(ReportSource::SmtProduction.permission(), PermissionType::FillWork);
        assert_eq!("manager".parse::<ReportSource>(), Ok(ReportSource::ManagerReport));
    }
}
