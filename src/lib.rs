pub mod backend;
pub mod batch;
pub mod benchmark;
pub mod cli;
pub mod client;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod prompts;
pub mod report;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::Backend;
pub use batch::{BatchDriver, BatchStats};
pub use benchmark::{BatchRun, BenchmarkRunner};
pub use cli::Cli;
pub use client::{
    ClientConfig, ClientError, EndpointClient, Generation, GenerationParams, GenerationRequest,
    Message, TokenCount,
};
pub use config::Config;
pub use report::{BenchmarkReport, ReportBuilder, TokensPerSecond};
