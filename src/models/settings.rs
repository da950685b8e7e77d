// src/models/settings.rs

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::report::ReportSource;

/// Singleton row of `system_completion_check_config`, loaded at the start of each task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CompletionCheckConfig {
    pub enabled: bool,
    pub interval_minutes: i32,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub max_workorders_per_check: i32,
    pub enable_notifications: bool,
    /// Largest |Q_proc − Q_fill| still treated as agreement.
    pub inconsistency_tolerance: i64,
    /// Consecutive disagreeing ticks before an inconsistency alert.
    pub inconsistency_ticks: i32,
    pub auto_approve_min_age_minutes: i32,
    pub auto_approve_tolerance: i64,
    pub auto_approve_disabled_sources: Vec<ReportSource>,
    pub fill_work_sources: Vec<ReportSource>,
    pub count_pending: bool,
    /// Grace period between completion and archiving; reports are still accepted meanwhile.
    pub archive_after_minutes: i32,
    pub updated_at: DateTime<Utc>,
}

pub const COMPLETION_CONFIG_COLUMNS: &str = "enabled, interval_minutes, window_start, window_end, \
     max_workorders_per_check, enable_notifications, inconsistency_tolerance, inconsistency_ticks, \
     auto_approve_min_age_minutes, auto_approve_tolerance, auto_approve_disabled_sources, \
     fill_work_sources, count_pending, archive_after_minutes, updated_at";

impl CompletionCheckConfig {
    pub fn daily_window(&self) -> DailyWindow {
        DailyWindow {
            start: self.window_start,
            end: self.window_end,
        }
    }

    pub fn credits_fill_work(&self, source: ReportSource) -> bool {
        self.fill_work_sources.contains(&source)
    }

    pub fn auto_approval_enabled_for(&self, source: ReportSource) -> bool {
        !self.auto_approve_disabled_sources.contains(&source)
    }
}

impl Default for CompletionCheckConfig {
    fn default() -> Self {
        let midnight = NaiveTime::default();
        Self {
            enabled: true,
            interval_minutes: 5,
            window_start: midnight,
            window_end: midnight,
            max_workorders_per_check: 100,
            enable_notifications: false,
            inconsistency_tolerance: 0,
            inconsistency_ticks: 3,
            auto_approve_min_age_minutes: 30,
            auto_approve_tolerance: 0,
            auto_approve_disabled_sources: Vec::new(),
            fill_work_sources: vec![
                ReportSource::OperatorSupplement,
                ReportSource::SmtProduction,
                ReportSource::ManagerReport,
            ],
            count_pending: false,
            archive_after_minutes: 60,
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

/// Wall-clock interval (inclusive on both ends) in which periodic evaluation may run.
///
/// `start == end` means the window never closes; `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DailyWindow {
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= local && local <= self.end
        } else {
            local >= self.start || local <= self.end
        }
    }

    pub fn is_open_at(&self, now: DateTime<Utc>, tz: FixedOffset) -> bool {
        self.contains(now.with_timezone(&tz).time())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PeriodicTaskRow {
    pub name: String,
    pub interval_minutes: i32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<i64>,
    pub scanned: i64,
    pub completed: i64,
    pub errored: i64,
    pub skipped: i64,
    pub overran: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    #[test]
    fn window_is_inclusive_within_a_day() {
        let w = DailyWindow { start: hm(8, 0), end: hm(18, 0) };
        assert!(w.contains(hm(8, 0)));
        assert!(w.contains(hm(12, 30)));
        assert!(w.contains(hm(18, 0)));
        assert!(!w.contains(hm(7, 59)));
        assert!(!w.contains(hm(18, 1)));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let w = DailyWindow { start: hm(22, 0), end: hm(6, 0) };
        assert!(w.contains(hm(23, 0)));
        assert!(w.contains(hm(3, 0)));
        assert!(!w.contains(hm(12, 0)));
    }

    #[test]
    fn equal_bounds_mean_always_open() {
        let w = DailyWindow { start: hm(0, 0), end: hm(0, 0) };
        assert!(w.contains(hm(0, 0)));
        assert!(w.contains(hm(13, 45)));
    }

    #[test]
    fn window_is_evaluated_in_taipei_time() {
        let taipei = FixedOffset::east_opt(8 * 3600).expect("valid offset");
        let w = DailyWindow { start: hm(8, 0), end: hm(18, 0) };
        // 23:00 UTC is 07:00 the next morning in Taipei.
        let before_open = DateTime::parse_from_rfc3339("2026-05-04T23:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        assert!(!w.is_open_at(before_open, taipei));
        // 01:00 UTC is 09:00 in Taipei.
        let open = DateTime::parse_from_rfc3339("2026-05-05T01:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        assert!(w.is_open_at(open, taipei));
    }

    #[test]
    fn default_fill_work_sources_exclude_onsite() {
        let cfg = CompletionCheckConfig::default();
        assert!(cfg.credits_fill_work(ReportSource::OperatorSupplement));
        assert!(!cfg.credits_fill_work(ReportSource::OnsiteLive));
        assert!(cfg.auto_approval_enabled_for(ReportSource::SmtProduction));
    }
}
