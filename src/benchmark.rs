use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::{BatchDriver, BatchStats};
use crate::client::{ClientConfig, EndpointClient, Generation, TokenCount};
use crate::config::{Config, OutputFormat};
use crate::prompts::Prompt;
use crate::report::{BenchmarkReport, ReportBuilder, TokensPerSecond};

/// Results of one timed batch.
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub generations: Vec<Generation>,
    pub tokens: TokenCount,
    pub elapsed: Duration,
    pub tokens_per_second: TokensPerSecond,
    pub stats: BatchStats,
}

/// Runs the prompt set through the batch driver once and reports
/// completion-token throughput.
///
/// # Examples
///
/// ```no_run
/// use chat_bench::{BenchmarkRunner, Config};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::default();
///     let runner = BenchmarkRunner::new(config).await?;
///     let report = runner.run().await?;
///     println!("{:.1} tok/s", report.throughput.batch_tokens_per_second);
///     Ok(())
/// }
/// ```
pub struct BenchmarkRunner {
    client: Arc<EndpointClient>,
    config: Config,
    prompts: Vec<Prompt>,
}

impl BenchmarkRunner {
    /// Connects to the endpoint and loads the prompts.
    ///
    /// Waits for the server first when a readiness timeout is configured.
    /// Fails if the server is unreachable, serves no usable model, or no
    /// prompts could be loaded.
    pub async fn new(config: Config) -> Result<Self> {
        if config.endpoint.health_check_timeout > 0 {
            crate::client::check_server_ready(
                &config.endpoint.base_url(),
                Duration::from_secs(config.endpoint.health_check_timeout),
                Duration::from_secs(config.endpoint.health_check_interval),
            )
            .await?;
        }

        let client = EndpointClient::connect(ClientConfig::from(&config)).await?;
        let prompts = crate::prompts::load_prompts(&config.input).await?;

        debug!("Loaded {} prompts", prompts.len());

        Ok(Self {
            client: Arc::new(client),
            config,
            prompts,
        })
    }

    pub fn client(&self) -> &EndpointClient {
        &self.client
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    /// Send every prompt through the batch driver, timing the whole batch.
    ///
    /// Token counters are reset first, and request counts come from this
    /// batch's driver, so every total covers this batch only.
    pub async fn run_batch(&self) -> Result<BatchRun> {
        let requests = self
            .prompts
            .iter()
            .map(|prompt| prompt.to_request(&self.config.generation))
            .collect();

        let driver = BatchDriver::new(Arc::clone(&self.client), self.config.load.batch_size)?
            .with_max_rounds(self.config.load.max_rounds);

        self.client.reset_token_count();

        info!(
            "Sending {} prompts to {} with batch size {}",
            self.prompts.len(),
            self.client.model(),
            self.config.load.batch_size
        );

        let batch_start = Instant::now();
        let (generations, stats) = driver.run_with_stats(requests).await?;
        let elapsed = batch_start.elapsed();

        let tokens = self.client.token_count();
        let tokens_per_second =
            TokensPerSecond::compute(&generations, tokens.completion_tokens, elapsed);

        info!(
            "Batch completed in {:.1}s: {} completion tokens, {:.2} tok/s",
            elapsed.as_secs_f64(),
            tokens.completion_tokens,
            tokens_per_second.batch
        );

        Ok(BatchRun {
            generations,
            tokens,
            elapsed,
            tokens_per_second,
            stats,
        })
    }

    /// Run the batch and emit the report in the configured format.
    pub async fn run(&self) -> Result<BenchmarkReport> {
        let report_builder = ReportBuilder::new()
            .with_config(self.config.clone());

        let batch = self.run_batch().await?;

        let report = report_builder
            .with_client(&self.client)
            .with_duration(batch.elapsed)
            .with_batch_stats(batch.stats)
            .with_results(self.prompts.clone(), batch.generations, batch.tokens)
            .build()?;

        self.generate_report(&report).await?;
        Ok(report)
    }

    async fn generate_report(&self, report: &BenchmarkReport) -> Result<()> {
        match self.config.output.format {
            OutputFormat::Console => {
                if !self.config.output.quiet {
                    report.print_console();
                }
                if let Some(file_path) = &self.config.output.file {
                    tokio::fs::write(file_path, serde_json::to_string_pretty(report)?).await?;
                    info!("Report written to {}", file_path.display());
                }
            }
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(report)?;

                if let Some(file_path) = &self.config.output.file {
                    tokio::fs::write(file_path, json).await?;
                    if !self.config.output.quiet {
                        report.print_console();
                    }
                } else {
                    // Writing JSON to stdout - this is for piping
                    println!("{}", json);
                }
            }
        }
        Ok(())
    }
}
