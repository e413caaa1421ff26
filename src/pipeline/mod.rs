//! Request pipelines built on the registry, the cache and the engine.
//!
//! - [`ingest`]: document prefill into a new cached context
//! - [`query`]: queries answered from cached context state
//! - [`generate`]: direct completions with an implicit model switch

pub mod generate;
pub mod ingest;
pub mod query;

pub use generate::{Completion, CompletionRequest, DirectGenerator, GenerationEvent};
pub use ingest::{IngestOutcome, IngestPipeline, IngestRequest};
pub use query::{QueryExecutor, QueryRequest, QueryResponse, QueryStream, QueryUsage};
