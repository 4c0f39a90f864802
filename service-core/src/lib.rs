//! service-core: Shared infrastructure for the subscription platform services.
pub mod error;
pub mod middleware;
pub mod utils;

pub use axum;
pub use mongodb;
pub use serde;
pub use serde_json;
pub use tracing;
pub use validator;
