//! Artifact transfer: HTTP fetching and the install pipeline.

pub mod http;
pub mod pipeline;

pub use http::{with_retries, ArtifactFetcher, FetchProgress, HttpFetcher, RetryPolicy};
pub use pipeline::{FileFailure, TransferPipeline, TransferReport};
