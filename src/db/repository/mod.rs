pub mod agent_runs;
pub mod group_config;
pub mod notification_tasks;
pub mod opportunity_cache;
pub mod system_config;

pub use agent_runs::AgentRunRepository;
pub use group_config::GroupConfigRepository;
pub use notification_tasks::NotificationTaskRepository;
pub use opportunity_cache::OpportunityCacheRepository;
pub use system_config::SystemConfigRepository;
