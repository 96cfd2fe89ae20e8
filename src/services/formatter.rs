use chrono::NaiveDateTime;

use crate::db::models::{NotificationType, Opportunity};
use crate::services::sla::SlaThresholds;

/// Renders the outbound chat messages.
///
/// The wording is presentation, not contract; the structure is: a typed
/// header with the organization, a capped list of opportunities, an overflow
/// line, and a send-timestamp footer. Escalations add the siren prefix, the
/// @mention block and an escalation count line.
pub struct MessageFormatter {
    max_display: usize,
}

impl MessageFormatter {
    pub fn new(max_display: usize) -> Self {
        Self {
            max_display: max_display.max(1),
        }
    }

    pub fn format_group_notification(
        &self,
        org_name: &str,
        notification_type: NotificationType,
        opportunities: &[Opportunity],
        now: NaiveDateTime,
    ) -> String {
        let header = match notification_type {
            NotificationType::Violation => {
                format!("⏰ Response overdue reminder — {}", org_name)
            }
            NotificationType::Standard => {
                format!("⚠️ Service overdue reminder — {}", org_name)
            }
            NotificationType::Escalation => {
                // Escalations have their own renderer; keep a sane fallback.
                format!("🚨 Escalation notice — {}", org_name)
            }
        };

        let mut lines = vec![header, String::new()];
        lines.push(format!("Orders to handle: {}", opportunities.len()));
        self.push_opportunity_lines(&mut lines, opportunities, notification_type);
        lines.push(String::new());
        lines.push(format!("Sent at: {}", now.format("%Y-%m-%d %H:%M:%S")));

        lines.join("\n")
    }

    pub fn format_escalation_notification(
        &self,
        org_name: &str,
        opportunities: &[Opportunity],
        mention_users: &[String],
        now: NaiveDateTime,
    ) -> String {
        let mut lines = vec![format!("🚨 Escalation notice — {}", org_name)];

        if !mention_users.is_empty() {
            let mentions = mention_users
                .iter()
                .map(|u| format!("@{}", u))
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(mentions);
        }

        lines.push(String::new());
        lines.push(format!("Escalation orders: {}", opportunities.len()));
        self.push_opportunity_lines(&mut lines, opportunities, NotificationType::Escalation);
        lines.push(String::new());
        lines.push("Please follow up through the internal operations channel.".to_string());
        lines.push(format!("Sent at: {}", now.format("%Y-%m-%d %H:%M:%S")));

        lines.join("\n")
    }

    fn push_opportunity_lines(
        &self,
        lines: &mut Vec<String>,
        opportunities: &[Opportunity],
        notification_type: NotificationType,
    ) {
        for opp in opportunities.iter().take(self.max_display) {
            let threshold = SlaThresholds::for_status(&opp.status).map(|t| match notification_type {
                NotificationType::Violation => t.violation_hours,
                NotificationType::Standard => t.standard_hours,
                NotificationType::Escalation => t.escalation_hours,
            });
            let threshold_part = match threshold {
                Some(hours) => format!(" (threshold {:.0}h)", hours),
                None => String::new(),
            };
            lines.push(format!(
                "• {} | {} | supervisor: {} | {:.1}h elapsed{}",
                opp.order_num, opp.name, opp.supervisor_name, opp.elapsed_business_hours,
                threshold_part
            ));
        }

        if opportunities.len() > self.max_display {
            lines.push(format!(
                "… {} more to handle",
                opportunities.len() - self.max_display
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::OpportunityStatus;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
    }

    fn opp(order_num: &str, elapsed: f64) -> Opportunity {
        Opportunity {
            order_num: order_num.to_string(),
            name: "客户A".to_string(),
            address: "".to_string(),
            supervisor_name: "王五".to_string(),
            org_name: "Alpha".to_string(),
            status: OpportunityStatus::PendingAppointment,
            create_time: now(),
            elapsed_business_hours: elapsed,
            is_violation: true,
            is_overdue: false,
            escalation_level: 0,
            sla_progress_ratio: elapsed / 24.0,
        }
    }

    #[test]
    fn group_message_has_header_body_and_footer() {
        let formatter = MessageFormatter::new(5);
        let text = formatter.format_group_notification(
            "Alpha",
            NotificationType::Violation,
            &[opp("GD001", 14.0)],
            now(),
        );
        assert!(text.starts_with("⏰ Response overdue reminder — Alpha"));
        assert!(text.contains("GD001"));
        assert!(text.contains("14.0h elapsed"));
        assert!(text.contains("(threshold 12h)"));
        assert!(text.contains("Sent at: 2024-01-02 14:00:00"));
    }

    #[test]
    fn standard_message_uses_standard_threshold() {
        let formatter = MessageFormatter::new(5);
        let text = formatter.format_group_notification(
            "Alpha",
            NotificationType::Standard,
            &[opp("GD001", 25.0)],
            now(),
        );
        assert!(text.contains("(threshold 24h)"));
    }

    #[test]
    fn long_lists_are_capped_with_an_overflow_line() {
        let formatter = MessageFormatter::new(5);
        let opportunities: Vec<_> = (0..8).map(|i| opp(&format!("GD{:03}", i), 14.0)).collect();
        let text = formatter.format_group_notification(
            "Alpha",
            NotificationType::Violation,
            &opportunities,
            now(),
        );
        assert!(text.contains("GD004"));
        assert!(!text.contains("GD005"));
        assert!(text.contains("… 3 more to handle"));
    }

    #[test]
    fn display_cap_is_configurable() {
        let formatter = MessageFormatter::new(2);
        let opportunities: Vec<_> = (0..3).map(|i| opp(&format!("GD{:03}", i), 14.0)).collect();
        let text = formatter.format_group_notification(
            "Alpha",
            NotificationType::Violation,
            &opportunities,
            now(),
        );
        assert!(!text.contains("GD002"));
        assert!(text.contains("… 1 more to handle"));
    }

    #[test]
    fn escalation_message_mentions_and_counts() {
        let formatter = MessageFormatter::new(5);
        let text = formatter.format_escalation_notification(
            "Alpha",
            &[opp("GD001", 49.0), opp("GD002", 52.0)],
            &["ops_lead".to_string(), "region_mgr".to_string()],
            now(),
        );
        assert!(text.starts_with("🚨 Escalation notice — Alpha"));
        assert!(text.contains("@ops_lead @region_mgr"));
        assert!(text.contains("Escalation orders: 2"));
        assert!(text.contains("GD001"));
        assert!(text.contains("GD002"));
        assert!(text.contains("(threshold 48h)"));
    }

    #[test]
    fn escalation_without_mentions_has_no_mention_line() {
        let formatter = MessageFormatter::new(5);
        let text =
            formatter.format_escalation_notification("Alpha", &[opp("GD001", 49.0)], &[], now());
        assert!(!text.contains('@'));
    }
}
