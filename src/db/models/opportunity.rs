use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Order status of a field-service opportunity.
///
/// The analytics service reports statuses with its native labels; only two
/// of them are under SLA monitoring. Everything else is carried through
/// untouched and ignored by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpportunityStatus {
    PendingAppointment,
    TemporarilyNotVisiting,
    Other(String),
}

impl OpportunityStatus {
    /// Parse a raw status as delivered by the analytics service or as
    /// persisted in the cache.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "待预约" | "pending_appointment" => OpportunityStatus::PendingAppointment,
            "暂不上门" | "temporarily_not_visiting" => OpportunityStatus::TemporarilyNotVisiting,
            other => OpportunityStatus::Other(other.to_string()),
        }
    }

    /// Stable snake_case form used in the cache table.
    pub fn as_str(&self) -> &str {
        match self {
            OpportunityStatus::PendingAppointment => "pending_appointment",
            OpportunityStatus::TemporarilyNotVisiting => "temporarily_not_visiting",
            OpportunityStatus::Other(s) => s,
        }
    }

    /// Whether this status is subject to SLA monitoring.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            OpportunityStatus::PendingAppointment | OpportunityStatus::TemporarilyNotVisiting
        )
    }
}

impl Serialize for OpportunityStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OpportunityStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(OpportunityStatus::parse(&raw))
    }
}

/// One opportunity row as the analytics report returns it. Unknown fields
/// are ignored; `create_time` stays a string until ingestion validates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOpportunity {
    pub order_num: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub supervisor_name: String,
    pub create_time: String,
    pub order_status: String,
    pub org_name: String,
}

/// Raw opportunity snapshot persisted in `opportunity_cache`.
///
/// Only raw fields live here; derived SLA fields are recomputed against the
/// current clock every time a row leaves the cache.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CachedOpportunity {
    pub order_num: String,
    pub org_name: String,
    pub name: String,
    pub address: String,
    pub supervisor_name: String,
    pub order_status: String,
    pub create_time: NaiveDateTime,
    pub last_updated: NaiveDateTime,
}

/// A fully evaluated opportunity: raw attributes plus SLA-derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub order_num: String,
    pub name: String,
    pub address: String,
    pub supervisor_name: String,
    pub org_name: String,
    pub status: OpportunityStatus,
    pub create_time: NaiveDateTime,

    /// Business hours elapsed since creation, at evaluation time.
    pub elapsed_business_hours: f64,
    pub is_violation: bool,
    pub is_overdue: bool,
    /// 0 = normal, 1 = escalation-eligible.
    pub escalation_level: u8,
    /// elapsed / standard threshold; the dashboard renders it as percent.
    pub sla_progress_ratio: f64,
}

impl Opportunity {
    /// Approaching-overdue window: 80% of the standard threshold consumed
    /// but not yet overdue.
    pub fn is_approaching_overdue(&self) -> bool {
        (0.8..1.0).contains(&self.sla_progress_ratio) && !self.is_overdue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_native_and_persisted_status_labels() {
        assert_eq!(
            OpportunityStatus::parse("待预约"),
            OpportunityStatus::PendingAppointment
        );
        assert_eq!(
            OpportunityStatus::parse("pending_appointment"),
            OpportunityStatus::PendingAppointment
        );
        assert_eq!(
            OpportunityStatus::parse("暂不上门"),
            OpportunityStatus::TemporarilyNotVisiting
        );
        assert_eq!(
            OpportunityStatus::parse("已完成"),
            OpportunityStatus::Other("已完成".to_string())
        );
    }

    #[test]
    fn only_two_statuses_are_monitored() {
        assert!(OpportunityStatus::PendingAppointment.is_monitored());
        assert!(OpportunityStatus::TemporarilyNotVisiting.is_monitored());
        assert!(!OpportunityStatus::Other("completed".into()).is_monitored());
    }

    #[test]
    fn status_round_trips_through_persisted_form() {
        for status in [
            OpportunityStatus::PendingAppointment,
            OpportunityStatus::TemporarilyNotVisiting,
        ] {
            assert_eq!(OpportunityStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn raw_opportunity_ignores_unknown_fields() {
        let json = r#"{
            "orderNum": "GD2024001",
            "name": "客户A",
            "address": "某区某路1号",
            "supervisorName": "王五",
            "createTime": "2024-01-01 09:00:00",
            "orderStatus": "待预约",
            "orgName": "Alpha服务商",
            "someFutureField": 42
        }"#;
        let raw: RawOpportunity = serde_json::from_str(json).unwrap();
        assert_eq!(raw.order_num, "GD2024001");
        assert_eq!(raw.org_name, "Alpha服务商");
    }
}
