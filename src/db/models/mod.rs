//! Database models split into separate files.

pub mod agent_run;
pub mod group_config;
pub mod notification_task;
pub mod opportunity;
pub mod system_config;

pub use self::agent_run::*;
pub use self::group_config::*;
pub use self::notification_task::*;
pub use self::opportunity::*;
pub use self::system_config::*;
