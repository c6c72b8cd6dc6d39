use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::client::{EndpointClient, Generation, GenerationRequest};
use crate::metrics::Metrics;

/// Request counts for one `BatchDriver` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub requests_sent: u64,
    pub successful_requests: u64,
    pub timed_out_requests: u64,
    pub rounds: u64,
    pub resubmitted_requests: u64,
}

/// Fans a batch of chat completions out to one endpoint, at most
/// `batch_size` at a time.
///
/// Requests that time out come back empty and are resubmitted in the next
/// round until every slot holds a result. Any other failure aborts the batch
/// and cancels the requests still in flight.
pub struct BatchDriver {
    client: Arc<EndpointClient>,
    batch_size: usize,
    max_rounds: Option<usize>,
}

impl BatchDriver {
    pub fn new(client: Arc<EndpointClient>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        Ok(Self {
            client,
            batch_size,
            max_rounds: None,
        })
    }

    /// Give up once this many rounds have run without completing every
    /// request. Unbounded when `None`.
    pub fn with_max_rounds(mut self, max_rounds: Option<usize>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Run every request to completion and return the results in input order.
    pub async fn run(&self, requests: Vec<GenerationRequest>) -> Result<Vec<Generation>> {
        let (generations, _) = self.run_with_stats(requests).await?;
        Ok(generations)
    }

    /// Like `run`, also returning what this run alone sent and received.
    pub async fn run_with_stats(
        &self,
        requests: Vec<GenerationRequest>,
    ) -> Result<(Vec<Generation>, BatchStats)> {
        let mut stats = BatchStats::default();
        let requests: Arc<[GenerationRequest]> = requests.into();
        let semaphore = Arc::new(Semaphore::new(self.batch_size));
        let mut results: Vec<Option<Generation>> = (0..requests.len()).map(|_| None).collect();
        let mut round = 0;

        loop {
            let pending: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(_, result)| result.is_none())
                .map(|(idx, _)| idx)
                .collect();
            if pending.is_empty() {
                break;
            }

            round += 1;
            if let Some(max_rounds) = self.max_rounds
                && round > max_rounds
            {
                anyhow::bail!(
                    "{} of {} requests still unfinished after {} rounds",
                    pending.len(),
                    requests.len(),
                    max_rounds
                );
            }

            if round == 1 {
                debug!(
                    "Dispatching {} requests, {} at a time",
                    pending.len(),
                    self.batch_size
                );
                Metrics::record_round(0);
            } else {
                info!(
                    "Round {}: resubmitting {} timed out requests (timeout now {:.1}s)",
                    round,
                    pending.len(),
                    self.client.current_timeout().as_secs_f64()
                );
                Metrics::record_round(pending.len());
                stats.resubmitted_requests += pending.len() as u64;
            }
            stats.rounds += 1;
            stats.requests_sent += pending.len() as u64;

            let mut tasks = JoinSet::new();
            for idx in pending {
                let client = Arc::clone(&self.client);
                let semaphore = Arc::clone(&semaphore);
                let requests = Arc::clone(&requests);

                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .expect("semaphore should never be closed");
                    let outcome = client.generate(&requests[idx]).await;
                    (idx, outcome)
                });
            }

            // Dropping the set on error aborts the remaining requests
            while let Some(joined) = tasks.join_next().await {
                let (idx, outcome) = joined?;
                match outcome.with_context(|| format!("Request {} failed", idx))? {
                    Some(generation) => {
                        stats.successful_requests += 1;
                        results[idx] = Some(generation);
                    }
                    None => stats.timed_out_requests += 1,
                }
            }
        }

        debug!("Batch of {} finished after {} rounds", requests.len(), round);

        Ok((results.into_iter().flatten().collect(), stats))
    }
}
