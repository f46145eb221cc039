mod args;
mod error;
mod routes;
mod state;
pub mod types;

pub use args::ServerArgs;
pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
