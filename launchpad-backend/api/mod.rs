pub mod error;
pub mod events;
pub mod previews;
mod routes;

use std::sync::Arc;

use crate::generation::GenerationChain;
use crate::manager::EnvironmentManager;
use crate::status::StatusChannel;

pub use error::ApiError;
pub use routes::build_router;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EnvironmentManager>,
    pub chain: Arc<GenerationChain>,
    pub status: StatusChannel,
}

impl AppState {
    pub fn new(manager: Arc<EnvironmentManager>, chain: Arc<GenerationChain>) -> Self {
        let status = manager.status().clone();
        Self {
            manager,
            chain,
            status,
        }
    }
}
