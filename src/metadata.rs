use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::domain::RunAccession;
use crate::error::PipelineError;
use crate::store;

/// Remote metadata source seam; the real implementation talks to NCBI
/// E-utilities, tests substitute scripted responses.
pub trait EutilsClient: Send + Sync {
    fn fetch_record(&self, id: &RunAccession) -> Result<Value, PipelineError>;
}

pub struct HttpEutilsClient {
    client: Client,
    base_url: String,
}

impl HttpEutilsClient {
    pub fn new() -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cardioseq/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::EutilsHttp(err.to_string()))?,
        );
        if let Ok(api_key) = std::env::var("NCBI_API_KEY") {
            if !api_key.trim().is_empty() {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(api_key.trim())
                        .map_err(|err| PipelineError::EutilsHttp(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::EutilsHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
        })
    }

    fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, PipelineError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .map_err(|err| classify_request_error(&err))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(PipelineError::RateLimited {
                status: status.as_u16(),
            });
        }
        if status.is_server_error() {
            return Err(PipelineError::TransientNetwork(format!(
                "server returned {status}"
            )));
        }
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "E-utilities request failed".to_string());
            return Err(PipelineError::EutilsStatus {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .map_err(|err| PipelineError::EutilsHttp(err.to_string()))
    }
}

impl EutilsClient for HttpEutilsClient {
    fn fetch_record(&self, id: &RunAccession) -> Result<Value, PipelineError> {
        let search_url = format!("{}/esearch.fcgi", self.base_url);
        let search: Value = self.get_json(
            &search_url,
            &[("db", "sra"), ("term", id.as_str()), ("retmode", "json")],
        )?;

        let uid = search
            .pointer("/esearchresult/idlist/0")
            .and_then(Value::as_str)
            .map(str::to_string);

        let summary = match &uid {
            Some(uid) => {
                let summary_url = format!("{}/esummary.fcgi", self.base_url);
                let data: Value = self.get_json(
                    &summary_url,
                    &[("db", "sra"), ("id", uid.as_str()), ("retmode", "json")],
                )?;
                data.pointer(&format!("/result/{uid}"))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            None => Value::Null,
        };

        Ok(serde_json::json!({
            "accession": id.as_str(),
            "uid": uid,
            "fetched_at": chrono::Utc::now().to_rfc3339(),
            "summary": summary,
        }))
    }
}

fn classify_request_error(err: &reqwest::Error) -> PipelineError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        PipelineError::TransientNetwork(err.to_string())
    } else {
        PipelineError::EutilsHttp(err.to_string())
    }
}

/// Durable fetch state. The target set, the accession→record map, the
/// deferred set, and the consecutive-429 counter travel together in one
/// atomic JSON document so every increment leaves a valid file and
/// deferrals survive restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetadataFetchState {
    #[serde(default)]
    pub targets: BTreeSet<String>,
    #[serde(default)]
    pub records: BTreeMap<String, Value>,
    #[serde(default)]
    pub deferred: BTreeSet<String>,
    #[serde(default)]
    pub consecutive_429_count: u32,
}

impl MetadataFetchState {
    pub fn load_or_create(path: &Utf8Path) -> Result<Self, PipelineError> {
        if !path.as_std_path().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
            PipelineError::CorruptCheckpoint {
                path: path.as_std_path().to_path_buf(),
                message: err.to_string(),
            }
        })?;
        serde_json::from_str(&content).map_err(|err| PipelineError::CorruptCheckpoint {
            path: path.as_std_path().to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn is_settled(&self, id: &RunAccession) -> bool {
        self.records.contains_key(id.as_str()) || self.deferred.contains(id.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub target_count: usize,
    pub completed: usize,
    pub deferred: usize,
    pub interrupted: bool,
}

/// Exponential moving average over per-item fetch latency; feeds the logged
/// percent/ETA lines. Derived state only, never persisted.
pub struct ProgressTracker {
    ema_secs: Option<f64>,
    alpha: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            ema_secs: None,
            alpha: 0.2,
        }
    }

    pub fn observe(&mut self, latency: Duration) {
        let secs = latency.as_secs_f64();
        self.ema_secs = Some(match self.ema_secs {
            Some(ema) => self.alpha * secs + (1.0 - self.alpha) * ema,
            None => secs,
        });
    }

    pub fn eta(&self, remaining: usize) -> Option<Duration> {
        self.ema_secs
            .map(|ema| Duration::from_secs_f64(ema * remaining as f64))
    }

    pub fn percent(completed: usize, total: usize) -> f64 {
        if total == 0 {
            return 100.0;
        }
        completed as f64 / total as f64 * 100.0
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Checkpointed enumeration of remote metadata records.
///
/// Each id gets bounded retries; rate-limit responses back off on a steeper
/// schedule driven by the consecutive-429 counter, which resets on the next
/// success. Exhaustion defers the id and the run continues. The state file is
/// rewritten atomically after every settled id, so a kill at any point keeps
/// all records completed so far.
pub struct MetadataFetcher<'a> {
    client: &'a dyn EutilsClient,
    state_path: Utf8PathBuf,
    rate_limit_backoff: Backoff,
    transient_backoff: Backoff,
    max_attempts: u32,
    cancel: &'a AtomicBool,
}

impl<'a> MetadataFetcher<'a> {
    pub fn new(
        client: &'a dyn EutilsClient,
        state_path: Utf8PathBuf,
        rate_limit_backoff_cap: Duration,
        max_attempts: u32,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            client,
            state_path,
            rate_limit_backoff: Backoff::rate_limit(rate_limit_backoff_cap),
            transient_backoff: Backoff::transient(),
            max_attempts: max_attempts.max(1),
            cancel,
        }
    }

    pub fn fetch_all(&self, target_ids: &[RunAccession]) -> Result<FetchReport, PipelineError> {
        let mut state = MetadataFetchState::load_or_create(&self.state_path)?;
        let known_targets = state.targets.len();
        state
            .targets
            .extend(target_ids.iter().map(|id| id.as_str().to_string()));
        if state.targets.len() != known_targets {
            self.persist(&state)?;
        }

        let pending: Vec<&RunAccession> = target_ids
            .iter()
            .filter(|id| !state.is_settled(id))
            .collect();

        info!(
            target = target_ids.len(),
            already_completed = state.records.len(),
            pending = pending.len(),
            "metadata fetch starting"
        );

        let mut progress = ProgressTracker::new();
        let mut interrupted = false;

        for (position, id) in pending.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }

            let started = Instant::now();
            self.fetch_one(id, &mut state)?;
            progress.observe(started.elapsed());

            let completed = state.records.len();
            let remaining = pending.len() - position - 1;
            info!(
                id = %id,
                percent = ProgressTracker::percent(completed, target_ids.len()),
                eta_secs = progress.eta(remaining).map(|eta| eta.as_secs()),
                "metadata progress"
            );
        }

        Ok(FetchReport {
            target_count: target_ids.len(),
            completed: state.records.len(),
            deferred: state.deferred.len(),
            interrupted,
        })
    }

    /// Fetch a single id to settlement (completed or deferred). Only
    /// filesystem-level persistence errors propagate.
    fn fetch_one(
        &self,
        id: &RunAccession,
        state: &mut MetadataFetchState,
    ) -> Result<(), PipelineError> {
        let mut attempt = 0u32;
        let mut transient_retries = 0u32;
        loop {
            attempt += 1;
            match self.client.fetch_record(id) {
                Ok(record) => {
                    state.records.insert(id.as_str().to_string(), record);
                    state.consecutive_429_count = 0;
                    return self.persist(state);
                }
                Err(PipelineError::RateLimited { status }) => {
                    state.consecutive_429_count += 1;
                    if attempt >= self.max_attempts {
                        warn!(id = %id, "rate-limit retries exhausted, deferring");
                        return self.defer(id, state);
                    }
                    let delay = self.rate_limit_backoff.delay(state.consecutive_429_count);
                    warn!(
                        id = %id,
                        status,
                        consecutive = state.consecutive_429_count,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) if err.is_transient() => {
                    transient_retries += 1;
                    if attempt >= self.max_attempts {
                        warn!(id = %id, "transient retries exhausted, deferring: {err}");
                        return self.defer(id, state);
                    }
                    std::thread::sleep(self.transient_backoff.delay(transient_retries));
                }
                Err(err) => {
                    warn!(id = %id, "fetch failed, deferring: {err}");
                    return self.defer(id, state);
                }
            }
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    fn defer(&self, id: &RunAccession, state: &mut MetadataFetchState) -> Result<(), PipelineError> {
        state.deferred.insert(id.as_str().to_string());
        self.persist(state)
    }

    fn persist(&self, state: &MetadataFetchState) -> Result<(), PipelineError> {
        store::write_json_atomic(&self.state_path, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_target() {
        assert_eq!(ProgressTracker::percent(0, 0), 100.0);
        assert_eq!(ProgressTracker::percent(3, 12), 25.0);
    }

    #[test]
    fn ema_smooths_latency() {
        let mut progress = ProgressTracker::new();
        assert!(progress.eta(10).is_none());

        progress.observe(Duration::from_secs(10));
        progress.observe(Duration::from_secs(0));
        let eta = progress.eta(10).unwrap();
        assert!(eta < Duration::from_secs(100));
        assert!(eta > Duration::ZERO);
    }
}
