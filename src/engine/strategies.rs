//! Parallel strategy execution.
//!
//! Every hinted strategy runs on its own thread under a shared deadline.
//! A strategy that errors or misses the deadline still yields a report,
//! with no results and zero confidence, so fusion always sees the same
//! fixed shape per strategy.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::fusion::{CandidateResult, Source};

/// What a strategy hands back on success.
pub struct StrategyOutput {
    pub results: Vec<CandidateResult>,
    /// Strategy-level certainty in its own ranking, in [0, 1].
    pub confidence: f32,
}

pub struct StrategyJob {
    pub source: Source,
    pub run: Box<dyn FnOnce() -> Result<StrategyOutput, String> + Send + 'static>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyMetadata {
    pub elapsed_ms: u64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one strategy, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyReport {
    pub source: Source,
    pub success: bool,
    pub results: Vec<CandidateResult>,
    pub confidence: f32,
    pub metadata: StrategyMetadata,
}

/// Run all jobs in parallel and collect a report per job, in job order.
///
/// Jobs still running when `timeout` elapses are abandoned: their threads
/// finish on their own and their sends go nowhere.
pub fn run_all(jobs: Vec<StrategyJob>, timeout: Duration) -> Vec<StrategyReport> {
    let (tx, rx) = mpsc::channel();
    let mut order = Vec::with_capacity(jobs.len());

    for job in jobs {
        order.push(job.source);
        let tx = tx.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let outcome = (job.run)();
            let _ = tx.send((job.source, outcome, started.elapsed()));
        });
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut finished: Vec<(Source, Result<StrategyOutput, String>, Duration)> = Vec::new();
    while finished.len() < order.len() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(done) => finished.push(done),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    order
        .into_iter()
        .map(|source| {
            match finished.iter().position(|(s, _, _)| *s == source) {
                Some(idx) => {
                    let (_, outcome, elapsed) = finished.swap_remove(idx);
                    build_report(source, outcome, elapsed)
                }
                None => timeout_report(source, timeout),
            }
        })
        .collect()
}

fn build_report(
    source: Source,
    outcome: Result<StrategyOutput, String>,
    elapsed: Duration,
) -> StrategyReport {
    let elapsed_ms = elapsed.as_millis() as u64;
    match outcome {
        Ok(output) => {
            log::debug!(
                "{source} strategy returned {} results in {elapsed_ms}ms",
                output.results.len()
            );
            StrategyReport {
                source,
                success: true,
                results: output.results,
                confidence: output.confidence.clamp(0.0, 1.0),
                metadata: StrategyMetadata {
                    elapsed_ms,
                    timed_out: false,
                    error: None,
                },
            }
        }
        Err(error) => {
            log::warn!("{source} strategy failed: {error}");
            StrategyReport {
                source,
                success: false,
                results: vec![],
                confidence: 0.0,
                metadata: StrategyMetadata {
                    elapsed_ms,
                    timed_out: false,
                    error: Some(error),
                },
            }
        }
    }
}

fn timeout_report(source: Source, timeout: Duration) -> StrategyReport {
    log::warn!("{source} strategy timed out after {}ms", timeout.as_millis());
    StrategyReport {
        source,
        success: false,
        results: vec![],
        confidence: 0.0,
        metadata: StrategyMetadata {
            elapsed_ms: timeout.as_millis() as u64,
            timed_out: true,
            error: None,
        },
    }
}
