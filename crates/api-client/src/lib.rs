//! Authenticated request pipeline
//!
//! `Pipeline` attaches the credential to outgoing requests and recovers from
//! expired tokens with a singleflight refresh: however many requests fail with
//! 401 at once, one refresh call is made and every stalled request is replayed
//! with its result. `Executor` drives one logical call on top of a pipeline,
//! with cancellation, debounce, retry and observable state.

pub mod classify;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pipeline;
mod refresh;
pub mod retry;
pub mod state;

#[cfg(test)]
mod testing;

pub use classify::{RawFailure, classify};
pub use descriptor::{AuthMode, RequestDescriptor};
pub use error::{ApiError, ErrorKind};
pub use executor::{Executor, ExecutorOptions};
pub use pipeline::{DEFAULT_TIMEOUT, Pipeline, PipelineBuilder, RefreshStatus};
pub use retry::{RetryCondition, RetryPolicy};
pub use state::{ApiResponse, RequestState};
