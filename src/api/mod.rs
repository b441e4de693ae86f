// HTTP API over the credential subsystem

pub mod integrations;

pub use integrations::{create_integrations_router, AppError, IntegrationsAppState};
