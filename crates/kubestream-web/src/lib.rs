//! HTTP surface for kubestream
//!
//! Historical range queries answer with newline-delimited JSON; live
//! sessions are server-sent event streams.

mod error;
mod handlers;
mod params;
mod routes;
mod sse;
mod state;

pub use error::{ApiError, ApiResult};
pub use handlers::NDJSON;
pub use params::LogQuery;
pub use routes::create_router;
pub use sse::{BACKFILL_EVENT, SOURCE_EVENT, event_stream, to_sse};
pub use state::{AppState, StreamSettings};
