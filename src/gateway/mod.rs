//! Gateway: orchestration and the HTTP surface

mod orchestrator;
mod router;
mod server;

pub use orchestrator::{BackendSource, Orchestrator, OrchestratorParts, RequestContext, SweepReport};
pub use router::{AppState, create_router};
pub use server::Gateway;
