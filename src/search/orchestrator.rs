//! Dual-lane search orchestration
//!
//! Both lanes run concurrently, each under its own deadline. A lane that
//! fails or times out degrades the response to Partial instead of killing
//! the query; only every requested lane failing is an error. A timed-out
//! lane's future is dropped, so its pending store work is abandoned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::MonoPcm;
use crate::config::SearchConfig;
use crate::models::{
    LaneReport, LaneStatus, SearchOutcome, SearchRequest, SearchResponse,
};
use crate::search::exact::ExactMatchLane;
use crate::search::vibe::VibeSearchLane;
use crate::{Error, Result};

pub struct Orchestrator {
    exact: Arc<ExactMatchLane>,
    vibe: Arc<VibeSearchLane>,
    config: SearchConfig,
}

impl Orchestrator {
    pub fn new(exact: Arc<ExactMatchLane>, vibe: Arc<VibeSearchLane>, config: SearchConfig) -> Self {
        Self {
            exact,
            vibe,
            config,
        }
    }

    /// Run the requested lanes concurrently and merge their reports
    ///
    /// The response always carries both lane reports; an unrequested lane
    /// shows up as Skipped with no matches.
    pub async fn run(
        &self,
        request: &SearchRequest,
        low: &MonoPcm,
        high: &MonoPcm,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let max_results = request.max_results.unwrap_or(self.config.max_results);

        let exact_fut = async {
            if request.mode.wants_exact() {
                run_lane(
                    "exact",
                    self.config.exact_timeout_ms,
                    self.exact.identify(low, max_results),
                )
                .await
            } else {
                LaneReport::skipped()
            }
        };
        let vibe_fut = async {
            if request.mode.wants_vibe() {
                run_lane(
                    "vibe",
                    self.config.vibe_timeout_ms,
                    self.vibe.search(high, max_results, request.exclude_track_id),
                )
                .await
            } else {
                LaneReport::skipped()
            }
        };

        tracing::debug!(
            query_id = %request.query_id,
            mode = ?request.mode,
            "Launching search lanes"
        );
        let (exact, vibe) = tokio::join!(exact_fut, vibe_fut);
        tracing::debug!(query_id = %request.query_id, "Merging lane reports");

        let statuses: Vec<LaneStatus> = [exact.status, vibe.status]
            .into_iter()
            .filter(|s| *s != LaneStatus::Skipped)
            .collect();

        if statuses
            .iter()
            .all(|s| matches!(s, LaneStatus::Failed | LaneStatus::TimedOut))
        {
            tracing::error!(query_id = %request.query_id, "Every requested search lane failed");
            return Err(Error::AllLanesFailed);
        }

        let outcome = if statuses.iter().all(|s| *s == LaneStatus::Completed) {
            SearchOutcome::Complete
        } else {
            SearchOutcome::Partial
        };

        let response = SearchResponse {
            query_id: request.query_id,
            outcome,
            exact,
            vibe,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            query_id = %request.query_id,
            outcome = ?response.outcome,
            exact_status = ?response.exact.status,
            vibe_status = ?response.vibe.status,
            elapsed_ms = response.elapsed_ms,
            "Search finished"
        );
        Ok(response)
    }
}

/// Drive one lane to a terminal report under its deadline
async fn run_lane<T, F>(lane: &'static str, timeout_ms: u64, work: F) -> LaneReport<T>
where
    F: std::future::Future<Output = Result<Vec<T>>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
        Ok(Ok(matches)) => {
            tracing::debug!(lane, matches = matches.len(), "Search lane completed");
            LaneReport::completed(matches)
        }
        Ok(Err(err)) => {
            tracing::warn!(lane, error = %err, "Search lane failed");
            LaneReport {
                status: LaneStatus::Failed,
                matches: Vec::new(),
            }
        }
        Err(_) => {
            let err = Error::LaneTimeout { lane, timeout_ms };
            tracing::warn!(lane, error = %err, "Search lane deadline exceeded");
            LaneReport {
                status: LaneStatus::TimedOut,
                matches: Vec::new(),
            }
        }
    }
}
