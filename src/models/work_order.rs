// src/models/work_order.rs

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::UnknownVariant;

// ───────────────────────────────────────
// Work-order lifecycle
// ───────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Pending,
    InProduction,
    Completed,
    Archived,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProduction => "in_production",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Forward edges of `pending → in_production → completed → archived`.
    pub fn can_advance_to(self, next: WorkOrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProduction)
                | (Self::InProduction, Self::Completed)
                | (Self::Completed, Self::Archived)
        )
    }

    /// Statuses whose work-order still accepts production reports.
    pub fn accepts_reports(self) -> bool {
        !matches!(self, Self::Archived)
    }
}

impl FromStr for WorkOrderStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_production" => Ok(Self::InProduction),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownVariant::new("work-order status", other)),
        }
    }
}

text_enum!(WorkOrderStatus);

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkOrder {
    pub workorder_id: i64,
    pub company_code: String,
    pub order_number: String,
    pub product_code: String,
    pub planned_quantity: i64,
    pub status: WorkOrderStatus,
    pub manual_completion: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub inconsistency_streak: i32,
    pub needs_reconciliation: bool,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const WORKORDER_COLUMNS: &str = "workorder_id, company_code, order_number, product_code, \
     planned_quantity, status, manual_completion, completed_at, inconsistency_streak, \
     needs_reconciliation, last_evaluated_at, is_visible, created_at, updated_at";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Process {
    pub process_id: i64,
    pub workorder_id: i64,
    pub name: String,
    pub seq: i32,
    pub planned_quantity: Option<i64>, // override; NULL → work-order planned quantity
}

impl Process {
    pub fn effective_planned(&self, workorder_planned: i64) -> i64 {
        self.planned_quantity.unwrap_or(workorder_planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_has_no_back_edges() {
        use WorkOrderStatus::*;
        assert!(Pending.can_advance_to(InProduction));
        assert!(InProduction.can_advance_to(Completed));
        assert!(Completed.can_advance_to(Archived));

        assert!(!Completed.can_advance_to(InProduction));
        assert!(!Archived.can_advance_to(Completed));
        assert!(!Pending.can_advance_to(Completed));
        assert!(!InProduction.can_advance_to(Archived));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            WorkOrderStatus::Pending,
            WorkOrderStatus::InProduction,
            WorkOrderStatus::Completed,
            WorkOrderStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<WorkOrderStatus>(), Ok(status));
        }
        assert!("closed".parse::<WorkOrderStatus>().is_err());
    }

    #[test]
    fn process_plan_defaults_to_workorder_plan() {
        let mut process = Process {
            process_id: 1,
            workorder_id: 7,
            name: "SMT".into(),
            seq: 1,
            planned_quantity: None,
        };
        assert_eq!(process.effective_planned(100), 100);
        process.planned_quantity = Some(80);
        assert_eq!(process.effective_planned(100), 80);
    }
}
