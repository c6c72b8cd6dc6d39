use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, SystemTime};

use metriken::AtomicHistogram;

use crate::batch::BatchStats;
use crate::client::{EndpointClient, Generation, TokenCount};
use crate::config::Config;
use crate::prompts::Prompt;

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    // Metadata
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub version: String,

    // Test configuration
    pub configuration: TestConfiguration,

    // Results
    pub summary: Summary,
    pub throughput: ThroughputStats,
    pub latency: LatencyStats,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<ResponseRecord>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestConfiguration {
    pub endpoint: String,
    pub model: String,
    pub backend: String,
    pub batch_size: usize,
    pub max_rounds: Option<usize>,
    pub prompts: usize,
    pub prompt_source: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub initial_timeout_secs: u64,
    pub timeout_increment_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub requests_sent: u64,
    pub successful_requests: u64,
    pub timed_out_requests: u64,
    pub rounds: u64,
    pub resubmitted_requests: u64,
    pub final_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputStats {
    /// Completion tokens over the wall time of the whole batch
    pub batch_tokens_per_second: f64,
    /// Mean of completion tokens over latency, per request
    pub per_request_tokens_per_second: f64,
    pub requests_per_second: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: f64,
}

/// Tokens per second for one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokensPerSecond {
    pub batch: f64,
    pub per_request: f64,
}

impl TokensPerSecond {
    /// `batch` divides the cumulative completion tokens by the batch wall
    /// time. `per_request` averages each result's own rate; results with no
    /// measurable latency are left out.
    pub fn compute(generations: &[Generation], completion_tokens: u64, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let batch = if elapsed_secs > 0.0 {
            completion_tokens as f64 / elapsed_secs
        } else {
            0.0
        };

        let rates: Vec<f64> = generations
            .iter()
            .filter_map(Generation::tokens_per_second)
            .collect();
        let per_request = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        Self { batch, per_request }
    }
}

pub struct ReportBuilder {
    start_time: SystemTime,
    duration: Option<Duration>,
    config: Option<Config>,
    endpoint: Option<(String, String, String)>,
    final_timeout: Duration,
    prompts: Vec<Prompt>,
    generations: Vec<Generation>,
    tokens: TokenCount,
    stats: BatchStats,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            duration: None,
            config: None,
            endpoint: None,
            final_timeout: Duration::ZERO,
            prompts: Vec::new(),
            generations: Vec::new(),
            tokens: TokenCount::default(),
            stats: BatchStats::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Record the endpoint actually benchmarked and the timeout budget the
    /// client ended with.
    pub fn with_client(mut self, client: &EndpointClient) -> Self {
        self.endpoint = Some((
            client.base_url().to_string(),
            client.model().to_string(),
            client.backend().to_string(),
        ));
        self.final_timeout = client.current_timeout();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Request counts for the batch being reported.
    pub fn with_batch_stats(mut self, stats: BatchStats) -> Self {
        self.stats = stats;
        self
    }

    /// Prompts and their results, index for index.
    pub fn with_results(
        mut self,
        prompts: Vec<Prompt>,
        generations: Vec<Generation>,
        tokens: TokenCount,
    ) -> Self {
        self.prompts = prompts;
        self.generations = generations;
        self.tokens = tokens;
        self
    }

    pub fn build(&self) -> Result<BenchmarkReport> {
        let duration = match self.duration {
            Some(duration) => duration,
            None => SystemTime::now().duration_since(self.start_time)?,
        };
        let duration_secs = duration.as_secs_f64();

        let configuration = self.build_configuration();

        let summary = Summary {
            requests_sent: self.stats.requests_sent,
            successful_requests: self.stats.successful_requests,
            timed_out_requests: self.stats.timed_out_requests,
            rounds: self.stats.rounds,
            resubmitted_requests: self.stats.resubmitted_requests,
            final_timeout_secs: self.final_timeout.as_secs_f64(),
        };

        let rates =
            TokensPerSecond::compute(&self.generations, self.tokens.completion_tokens, duration);
        let throughput = ThroughputStats {
            batch_tokens_per_second: rates.batch,
            per_request_tokens_per_second: rates.per_request,
            requests_per_second: if duration_secs > 0.0 {
                self.generations.len() as f64 / duration_secs
            } else {
                0.0
            },
            total_prompt_tokens: self.tokens.prompt_tokens,
            total_completion_tokens: self.tokens.completion_tokens,
        };

        let latency = self.build_latency_stats();

        let include_responses = self
            .config
            .as_ref()
            .is_some_and(|config| config.output.include_responses);
        let responses = include_responses.then(|| {
            self.prompts
                .iter()
                .zip(&self.generations)
                .map(|(prompt, generation)| ResponseRecord {
                    prompt: prompt.prompt.clone(),
                    response: generation.response.clone(),
                    prompt_tokens: generation.prompt_tokens,
                    completion_tokens: generation.completion_tokens,
                    latency_ms: generation.latency.as_secs_f64() * 1000.0,
                })
                .collect()
        });

        // Convert SystemTime to DateTime<Utc>
        let timestamp: DateTime<Utc> = self.start_time.into();

        Ok(BenchmarkReport {
            timestamp,
            duration,
            version: env!("CARGO_PKG_VERSION").to_string(),
            configuration,
            summary,
            throughput,
            latency,
            responses,
        })
    }

    fn build_configuration(&self) -> TestConfiguration {
        let mut configuration = if let Some(ref config) = self.config {
            TestConfiguration {
                endpoint: config.endpoint.base_url(),
                model: config.endpoint.model.clone().unwrap_or_default(),
                backend: String::new(),
                batch_size: config.load.batch_size,
                max_rounds: config.load.max_rounds,
                prompts: self.prompts.len(),
                prompt_source: match &config.input.file {
                    Some(path) => path.display().to_string(),
                    None => format!("builtin:{:?}", config.input.set).to_lowercase(),
                },
                temperature: config.generation.temperature,
                max_tokens: config.generation.max_tokens,
                initial_timeout_secs: config.endpoint.timeout,
                timeout_increment_secs: config.endpoint.timeout_increment,
            }
        } else {
            TestConfiguration {
                prompts: self.prompts.len(),
                prompt_source: "unknown".to_string(),
                ..Default::default()
            }
        };

        if let Some((endpoint, model, backend)) = &self.endpoint {
            configuration.endpoint = endpoint.clone();
            configuration.model = model.clone();
            configuration.backend = backend.clone();
        }

        configuration
    }

    fn build_latency_stats(&self) -> LatencyStats {
        let mut stats = LatencyStats::default();

        let latencies: Vec<f64> = self
            .generations
            .iter()
            .map(|g| g.latency.as_secs_f64() * 1000.0)
            .collect();
        if !latencies.is_empty() {
            stats.mean_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
            stats.min_ms = latencies.iter().copied().fold(f64::INFINITY, f64::min);
            stats.max_ms = latencies.iter().copied().fold(0.0, f64::max);
        }

        // Percentiles come from this batch's latencies only, not the
        // process-wide histogram
        let batch_latency = AtomicHistogram::new(5, 64);
        for generation in &self.generations {
            let _ = batch_latency.increment(generation.latency.as_nanos() as u64);
        }

        if let Some(histogram) = batch_latency.load()
            && let Ok(Some(percentiles)) = histogram.percentiles(&[50.0, 90.0, 95.0, 99.0])
        {
            for (percentile, bucket) in percentiles.iter() {
                let value_ms = bucket.end() as f64 / 1_000_000.0;
                match percentile.round() as u32 {
                    50 => stats.p50_ms = value_ms,
                    90 => stats.p90_ms = value_ms,
                    95 => stats.p95_ms = value_ms,
                    99 => stats.p99_ms = value_ms,
                    _ => {}
                }
            }
        }

        stats
    }
}

impl BenchmarkReport {
    pub fn print_console(&self) {
        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false);

        println!();
        println!("{}", timestamp);
        println!("{} -----", timestamp);
        println!("{} Benchmark Complete", timestamp);
        println!(
            "{} Target: {} Model: {} Backend: {}",
            timestamp,
            self.configuration.endpoint,
            self.configuration.model,
            self.configuration.backend
        );
        println!(
            "{} Duration: {:.1}s",
            timestamp,
            self.duration.as_secs_f64()
        );
        println!(
            "{} Requests: Sent: {} Ok: {} Timeout: {} Rounds: {} Resubmitted: {}",
            timestamp,
            self.summary.requests_sent,
            self.summary.successful_requests,
            self.summary.timed_out_requests,
            self.summary.rounds,
            self.summary.resubmitted_requests
        );
        if self.summary.timed_out_requests > 0 {
            println!(
                "{} Timeout: final budget {:.1}s",
                timestamp, self.summary.final_timeout_secs
            );
        }
        println!(
            "{} Tokens: Prompt: {} Completion: {} Total: {}",
            timestamp,
            self.throughput.total_prompt_tokens,
            self.throughput.total_completion_tokens,
            self.throughput.total_prompt_tokens + self.throughput.total_completion_tokens
        );
        println!(
            "{} Request Latency (ms): mean: {:.1} min: {:.0} max: {:.0} p50: {:.0} p90: {:.0} p99: {:.0}",
            timestamp,
            self.latency.mean_ms,
            self.latency.min_ms,
            self.latency.max_ms,
            self.latency.p50_ms,
            self.latency.p90_ms,
            self.latency.p99_ms
        );
        println!();

        println!(
            "Batch Size {} Tok/Sec for {} inputs: {:.4} tok/sec",
            self.configuration.batch_size,
            self.configuration.prompts,
            self.throughput.batch_tokens_per_second
        );
        println!(
            "Per Request Token/Sec: {:.4} tok/sec",
            self.throughput.per_request_tokens_per_second
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(completion_tokens: u32, latency_ms: u64) -> Generation {
        Generation {
            response: format!("{} tokens", completion_tokens),
            prompt_tokens: 10,
            completion_tokens,
            latency: Duration::from_millis(latency_ms),
        }
    }

    #[test]
    fn test_tokens_per_second() {
        let generations = vec![generation(100, 1000), generation(100, 500)];
        let rates = TokensPerSecond::compute(&generations, 200, Duration::from_secs(2));

        assert_eq!(rates.batch, 100.0);
        assert_eq!(rates.per_request, 150.0);
    }

    #[test]
    fn test_tokens_per_second_skips_zero_latency() {
        let generations = vec![generation(100, 0), generation(30, 1000)];
        let rates = TokensPerSecond::compute(&generations, 130, Duration::from_secs(1));

        assert_eq!(rates.batch, 130.0);
        assert_eq!(rates.per_request, 30.0);

        let empty = TokensPerSecond::compute(&[], 0, Duration::ZERO);
        assert_eq!(empty, TokensPerSecond::default());
    }

    #[test]
    fn test_report_json() {
        let mut config = Config::default();
        config.load.batch_size = 4;
        config.output.include_responses = true;

        let prompts = vec![Prompt::new("a"), Prompt::new("b")];
        let generations = vec![generation(40, 400), generation(60, 600)];
        let tokens = TokenCount {
            prompt_tokens: 20,
            completion_tokens: 100,
        };

        let report = ReportBuilder::new()
            .with_config(config)
            .with_duration(Duration::from_secs(1))
            .with_results(prompts, generations, tokens)
            .build()
            .unwrap();

        assert_eq!(report.configuration.batch_size, 4);
        assert_eq!(report.configuration.prompts, 2);
        assert_eq!(report.configuration.prompt_source, "builtin:all");
        assert_eq!(report.throughput.batch_tokens_per_second, 100.0);
        assert_eq!(report.throughput.per_request_tokens_per_second, 100.0);
        assert_eq!(report.throughput.requests_per_second, 2.0);
        assert_eq!(report.latency.mean_ms, 500.0);
        assert_eq!(report.latency.min_ms, 400.0);
        assert_eq!(report.latency.max_ms, 600.0);

        let responses = report.responses.as_ref().unwrap();
        assert_eq!(responses[1].prompt, "b");
        assert_eq!(responses[1].response, "60 tokens");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["configuration"]["batch_size"], 4);
        assert_eq!(json["throughput"]["total_completion_tokens"], 100);
        assert!(json["responses"].is_array());
    }

    #[test]
    fn test_responses_omitted_by_default() {
        let report = ReportBuilder::new()
            .with_config(Config::default())
            .with_duration(Duration::from_secs(1))
            .with_results(vec![Prompt::new("a")], vec![generation(1, 1)], TokenCount::default())
            .build()
            .unwrap();

        assert!(report.responses.is_none());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("responses").is_none());
    }

    #[test]
    fn test_summary_and_percentiles_from_batch() {
        let stats = BatchStats {
            requests_sent: 3,
            successful_requests: 2,
            timed_out_requests: 1,
            rounds: 2,
            resubmitted_requests: 1,
        };

        let report = ReportBuilder::new()
            .with_duration(Duration::from_secs(1))
            .with_batch_stats(stats)
            .with_results(
                vec![Prompt::new("a"), Prompt::new("b")],
                vec![generation(10, 400), generation(10, 600)],
                TokenCount::default(),
            )
            .build()
            .unwrap();

        assert_eq!(report.summary.requests_sent, 3);
        assert_eq!(report.summary.timed_out_requests, 1);
        assert_eq!(report.summary.rounds, 2);
        assert_eq!(report.summary.resubmitted_requests, 1);

        // Bucket upper bounds sit within a few percent of the recorded values
        assert!(report.latency.p50_ms >= 400.0 && report.latency.p50_ms < 625.0);
        assert!(report.latency.p99_ms >= 600.0 && report.latency.p99_ms < 625.0);
    }
}
