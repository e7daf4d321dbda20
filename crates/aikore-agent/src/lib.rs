pub mod api;
pub mod blueprint;
pub mod config;
pub mod display_alloc;
pub mod error;
pub mod error_payload;
pub mod launch_plan;
pub mod launcher;
pub mod logs;
pub mod manager;
pub mod monitor;
pub mod plan_executor;
pub mod port_alloc;
pub(crate) mod process_support;
pub mod registry;
pub mod routing;
pub mod store;
pub mod terminal;
