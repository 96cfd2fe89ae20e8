use chrono::NaiveDateTime;

use crate::business_time::BusinessCalendar;
use crate::db::models::{CachedOpportunity, Opportunity, OpportunityStatus};
use crate::error::{AppError, AppResult};

/// SLA thresholds for one monitored status, in business hours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaThresholds {
    pub violation_hours: f64,
    pub standard_hours: f64,
    pub escalation_hours: f64,
}

impl SlaThresholds {
    pub fn new(violation: f64, standard: f64, escalation: f64) -> AppResult<Self> {
        if violation <= 0.0 || violation > standard || standard > escalation {
            return Err(AppError::BusinessLogic(format!(
                "invalid SLA thresholds: violation={} standard={} escalation={}",
                violation, standard, escalation
            )));
        }
        Ok(Self {
            violation_hours: violation,
            standard_hours: standard,
            escalation_hours: escalation,
        })
    }

    /// Threshold table per monitored status; non-monitored statuses have no
    /// SLA.
    pub fn for_status(status: &OpportunityStatus) -> Option<Self> {
        match status {
            OpportunityStatus::PendingAppointment => Some(Self {
                violation_hours: 12.0,
                standard_hours: 24.0,
                escalation_hours: 48.0,
            }),
            OpportunityStatus::TemporarilyNotVisiting => Some(Self {
                violation_hours: 24.0,
                standard_hours: 48.0,
                escalation_hours: 72.0,
            }),
            OpportunityStatus::Other(_) => None,
        }
    }
}

/// Classifies opportunities against their SLA thresholds using business-hour
/// arithmetic. Pure: same inputs, same answer.
#[derive(Debug, Clone)]
pub struct SlaEvaluator {
    calendar: BusinessCalendar,
}

impl SlaEvaluator {
    pub fn new(calendar: BusinessCalendar) -> Self {
        Self { calendar }
    }

    /// Recompute all derived fields for a cached snapshot at `now`.
    ///
    /// Non-monitored statuses short-circuit: elapsed time is still reported
    /// but no flag is ever raised for them.
    pub fn evaluate(&self, cached: &CachedOpportunity, now: NaiveDateTime) -> Opportunity {
        let status = OpportunityStatus::parse(&cached.order_status);
        let elapsed = self
            .calendar
            .elapsed_business_hours(cached.create_time, now);

        let (is_violation, is_overdue, escalation_level, ratio) =
            match SlaThresholds::for_status(&status) {
                Some(thresholds) => (
                    elapsed >= thresholds.violation_hours,
                    elapsed >= thresholds.standard_hours,
                    u8::from(elapsed >= thresholds.escalation_hours),
                    elapsed / thresholds.standard_hours,
                ),
                None => (false, false, 0, 0.0),
            };

        Opportunity {
            order_num: cached.order_num.clone(),
            name: cached.name.clone(),
            address: cached.address.clone(),
            supervisor_name: cached.supervisor_name.clone(),
            org_name: cached.org_name.clone(),
            status,
            create_time: cached.create_time,
            elapsed_business_hours: elapsed,
            is_violation,
            is_overdue,
            escalation_level,
            sla_progress_ratio: ratio,
        }
    }

    pub fn evaluate_all(
        &self,
        cached: &[CachedOpportunity],
        now: NaiveDateTime,
    ) -> Vec<Opportunity> {
        cached.iter().map(|c| self.evaluate(c, now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn cached(status: &str, create_time: NaiveDateTime) -> CachedOpportunity {
        CachedOpportunity {
            order_num: "GD2024001".to_string(),
            org_name: "Alpha".to_string(),
            name: "客户A".to_string(),
            address: "".to_string(),
            supervisor_name: "王五".to_string(),
            order_status: status.to_string(),
            create_time,
            last_updated: create_time,
        }
    }

    fn evaluator() -> SlaEvaluator {
        SlaEvaluator::new(BusinessCalendar::default())
    }

    #[test]
    fn threshold_table_matches_policy() {
        let pending = SlaThresholds::for_status(&OpportunityStatus::PendingAppointment).unwrap();
        assert_eq!(
            (
                pending.violation_hours,
                pending.standard_hours,
                pending.escalation_hours
            ),
            (12.0, 24.0, 48.0)
        );
        let not_visiting =
            SlaThresholds::for_status(&OpportunityStatus::TemporarilyNotVisiting).unwrap();
        assert_eq!(
            (
                not_visiting.violation_hours,
                not_visiting.standard_hours,
                not_visiting.escalation_hours
            ),
            (24.0, 48.0, 72.0)
        );
        assert!(SlaThresholds::for_status(&OpportunityStatus::Other("done".into())).is_none());
    }

    #[test]
    fn threshold_constructor_enforces_ordering() {
        assert!(SlaThresholds::new(12.0, 24.0, 48.0).is_ok());
        assert!(SlaThresholds::new(24.0, 12.0, 48.0).is_err());
        assert!(SlaThresholds::new(12.0, 48.0, 24.0).is_err());
        assert!(SlaThresholds::new(0.0, 24.0, 48.0).is_err());
    }

    #[test]
    fn healthy_opportunity_raises_no_flags() {
        // Monday 09:00 creation, evaluated at 10:00: one business hour.
        let opp = evaluator().evaluate(
            &cached("待预约", dt(2024, 1, 1, 9, 0)),
            dt(2024, 1, 1, 10, 0),
        );
        assert!((opp.elapsed_business_hours - 1.0).abs() < 1e-9);
        assert!(!opp.is_violation);
        assert!(!opp.is_overdue);
        assert_eq!(opp.escalation_level, 0);
        assert!((opp.sla_progress_ratio - 1.0 / 24.0).abs() < 1e-9);
    }

    #[test]
    fn created_now_has_zero_elapsed() {
        let now = dt(2024, 1, 1, 10, 0);
        let opp = evaluator().evaluate(&cached("待预约", now), now);
        assert_eq!(opp.elapsed_business_hours, 0.0);
        assert!(!opp.is_violation && !opp.is_overdue);
    }

    #[test]
    fn violation_crosses_twelve_hour_threshold() {
        // Created Monday 10:00, evaluated Tuesday 14:00 = 14 business hours.
        let opp = evaluator().evaluate(
            &cached("待预约", dt(2024, 1, 1, 10, 0)),
            dt(2024, 1, 2, 14, 0),
        );
        assert!((opp.elapsed_business_hours - 14.0).abs() < 1e-9);
        assert!(opp.is_violation);
        assert!(!opp.is_overdue);
        assert_eq!(opp.escalation_level, 0);
    }

    #[test]
    fn threshold_equality_triggers_the_flag() {
        // Exactly 12 business hours: Monday 09:00 -> Tuesday 11:00.
        let opp = evaluator().evaluate(
            &cached("待预约", dt(2024, 1, 1, 9, 0)),
            dt(2024, 1, 2, 11, 0),
        );
        assert_eq!(opp.elapsed_business_hours, 12.0);
        assert!(opp.is_violation);

        // Exactly 24 hours: Monday 09:00 -> Wednesday 13:00... 10 + 10 + 4.
        let opp = evaluator().evaluate(
            &cached("待预约", dt(2024, 1, 1, 9, 0)),
            dt(2024, 1, 3, 13, 0),
        );
        assert_eq!(opp.elapsed_business_hours, 24.0);
        assert!(opp.is_overdue);
        assert_eq!(opp.escalation_level, 0);
    }

    #[test]
    fn flags_are_monotone_in_elapsed_time() {
        let eval = evaluator();
        let create = dt(2024, 1, 1, 9, 0);
        let mut prev = (false, false, 0u8);
        for hours in 0..120 {
            let now = create + chrono::Duration::hours(hours);
            let opp = eval.evaluate(&cached("待预约", create), now);
            let flags = (opp.is_violation, opp.is_overdue, opp.escalation_level);
            assert!(
                flags.0 >= prev.0 && flags.1 >= prev.1 && flags.2 >= prev.2,
                "flags regressed at +{}h: {:?} -> {:?}",
                hours,
                prev,
                flags
            );
            prev = flags;
        }
    }

    #[test]
    fn temporarily_not_visiting_uses_relaxed_thresholds() {
        // 30 business hours: violation for the 24h threshold, not overdue.
        let opp = evaluator().evaluate(
            &cached("暂不上门", dt(2024, 1, 1, 9, 0)),
            dt(2024, 1, 4, 9, 0),
        );
        assert_eq!(opp.elapsed_business_hours, 30.0);
        assert!(opp.is_violation);
        assert!(!opp.is_overdue);
    }

    #[test]
    fn non_monitored_status_never_flags() {
        // A year-old completed order stays quiet.
        let opp = evaluator().evaluate(
            &cached("已完成", dt(2023, 1, 2, 9, 0)),
            dt(2024, 1, 1, 10, 0),
        );
        assert!(opp.elapsed_business_hours > 1000.0);
        assert!(!opp.is_violation);
        assert!(!opp.is_overdue);
        assert_eq!(opp.escalation_level, 0);
        assert_eq!(opp.sla_progress_ratio, 0.0);
    }

    #[test]
    fn escalation_level_flips_at_threshold() {
        // 48 business hours for pending appointment: Mon 09:00 + 4 full days
        // of 10h -> Fri 09:00 is 40h, Fri 17:00 is 48h.
        let eval = evaluator();
        let create = dt(2024, 1, 1, 9, 0);
        let just_below = eval.evaluate(&cached("待预约", create), dt(2024, 1, 5, 16, 59));
        assert_eq!(just_below.escalation_level, 0);
        let at = eval.evaluate(&cached("待预约", create), dt(2024, 1, 5, 17, 0));
        assert_eq!(at.escalation_level, 1);
    }

    #[test]
    fn approaching_overdue_window() {
        let eval = evaluator();
        let create = dt(2024, 1, 1, 9, 0);
        // 20 business hours = ratio 20/24 ≈ 0.83.
        let approaching = eval.evaluate(&cached("待预约", create), dt(2024, 1, 3, 9, 0));
        assert_eq!(approaching.elapsed_business_hours, 20.0);
        assert!(approaching.is_approaching_overdue());
        // 24h = overdue, no longer "approaching".
        let overdue = eval.evaluate(&cached("待预约", create), dt(2024, 1, 3, 13, 0));
        assert!(!overdue.is_approaching_overdue());
        // 10h = ratio 0.42, below the window.
        let early = eval.evaluate(&cached("待预约", create), dt(2024, 1, 2, 9, 0));
        assert!(!early.is_approaching_overdue());
    }
}
