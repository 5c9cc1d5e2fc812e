pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod orchestrator;
pub mod poller;
pub mod provider_manager;
pub mod reconciliation;
pub mod registry;
pub mod retry_client;
pub mod self_guard;
pub mod state_machine;

pub use config::OrchestratorConfig;
pub use error::{ApiFailure, Outcome, PermanentKind, Rejection};
pub use events::EventBus;
pub use orchestrator::{CreateRequest, Orchestrator};
