//! `refetch` is an HTTP request layer with retry, backoff scheduling, rate limiting and
//! content-negotiated response decoding, on top of `hyper` (HTTP/1.1 + HTTP/2).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use refetch::prelude::{Client, Context, DecodeOptions};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .client_name("my-sdk")
//!         .max_attempts(3)
//!         .rate_limit(50, Duration::from_secs(1))
//!         .try_build()?;
//!
//!     let cx = Context::new();
//!     let mut response = client
//!         .get("/v1/items/42")
//!         .exponential_jitter_backoff(Duration::from_millis(100), Duration::from_secs(2))
//!         .timeout(Duration::from_secs(10))
//!         .accept_json()
//!         .send(&cx)
//!         .await?;
//!
//!     let item: Item = response.decode(&cx, DecodeOptions::new()).await?;
//!     println!("fetched id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Retries
//!
//! Only 5xx responses, connection resets, broken pipes and (opt-in) unexpected EOFs are
//! retried. The last response is returned as is once attempts run out, so a final 5xx is a
//! successful call with a server error status. Streamed and multipart bodies cannot be
//! replayed and always get a single attempt.

mod backoff;
mod body;
mod client;
mod context;
mod decode;
mod error;
mod hooks;
mod metrics;
mod multipart;
mod pool;
mod rate_limit;
mod request;
mod response;
mod transport;
mod util;

pub use crate::backoff::{
    BackoffStrategy, ExponentialBackoff, LinearBackoff, NoBackoff, default_backoff,
};
pub use crate::body::{RequestBody, ResponseBody, empty_body, full_body};
pub use crate::client::{Client, ClientBuilder};
pub use crate::context::{Cancellation, Context};
pub use crate::decode::{APPLICATION_POSTCARD, DecodeFormat, DecodeOptions};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::hooks::AfterExecute;
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::multipart::Multipart;
pub use crate::pool::BufferPool;
pub use crate::rate_limit::{RateLimitError, RateLimiter};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::{Body, Response};
pub use crate::transport::{HyperTransport, Transport, TransportFuture};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BackoffStrategy, Body, Client, ClientBuilder, Context, DecodeFormat, DecodeOptions, Error,
        ErrorCode, ExponentialBackoff, LinearBackoff, Multipart, NoBackoff, Request, Response,
        Result, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
