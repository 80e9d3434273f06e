use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::json;

use cardioseq::domain::RunAccession;
use cardioseq::error::PipelineError;
use cardioseq::metadata::{EutilsClient, MetadataFetchState, MetadataFetcher};

#[derive(Clone, Copy)]
enum Response {
    Success,
    RateLimited,
    Transient,
    NotFound,
}

/// Scripted per-id response sequences; ids without a script always succeed.
#[derive(Default)]
struct ScriptedEutils {
    scripts: Mutex<HashMap<String, VecDeque<Response>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedEutils {
    fn script(self, id: &str, responses: &[Response]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), responses.iter().copied().collect());
        self
    }

    fn call_count(&self, id: &str) -> usize {
        *self.calls.lock().unwrap().get(id).unwrap_or(&0)
    }
}

impl EutilsClient for ScriptedEutils {
    fn fetch_record(&self, id: &RunAccession) -> Result<serde_json::Value, PipelineError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(id.as_str().to_string())
            .or_default() += 1;

        let response = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(id.as_str())
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Response::Success);

        match response {
            Response::Success => Ok(json!({
                "accession": id.as_str(),
                "fetched_at": "2026-08-05T10:00:00+00:00",
                "summary": {"runs": 1},
            })),
            Response::RateLimited => Err(PipelineError::RateLimited { status: 429 }),
            Response::Transient => Err(PipelineError::TransientNetwork(
                "mock: connection refused".to_string(),
            )),
            Response::NotFound => Err(PipelineError::EutilsStatus {
                status: 404,
                message: "not found".to_string(),
            }),
        }
    }
}

fn ids(count: usize) -> Vec<RunAccession> {
    (1..=count)
        .map(|n| format!("SRR{n:06}").parse().unwrap())
        .collect()
}

fn state_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join("metadata_partial.json")).unwrap()
}

fn fetcher<'a>(
    client: &'a ScriptedEutils,
    path: Utf8PathBuf,
    max_attempts: u32,
    cancel: &'a AtomicBool,
) -> MetadataFetcher<'a> {
    MetadataFetcher::new(
        client,
        path,
        Duration::from_millis(40),
        max_attempts,
        cancel,
    )
}

#[test]
fn resume_fetches_only_remaining_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(&dir);

    // 2 of 5 target ids were completed by a previous run.
    let mut prior = MetadataFetchState::default();
    for id in ["SRR000001", "SRR000002"] {
        prior
            .records
            .insert(id.to_string(), json!({"accession": id}));
    }
    cardioseq::store::write_json_atomic(&path, &prior).unwrap();

    let client = ScriptedEutils::default();
    let cancel = AtomicBool::new(false);
    let report = fetcher(&client, path.clone(), 3, &cancel)
        .fetch_all(&ids(5))
        .unwrap();

    assert_eq!(report.target_count, 5);
    assert_eq!(report.completed, 5);
    assert_eq!(report.deferred, 0);
    assert_eq!(client.call_count("SRR000001"), 0);
    assert_eq!(client.call_count("SRR000002"), 0);
    assert_eq!(client.call_count("SRR000003"), 1);

    let state = MetadataFetchState::load_or_create(&path).unwrap();
    assert_eq!(state.records.len() + state.deferred.len(), 5);
    assert_eq!(state.targets.len(), 5);
}

#[test]
fn rate_limit_exhaustion_defers_id_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(&dir);

    let client = ScriptedEutils::default().script(
        "SRR000001",
        &[
            Response::RateLimited,
            Response::RateLimited,
            Response::RateLimited,
            Response::RateLimited,
        ],
    );
    let cancel = AtomicBool::new(false);
    let report = fetcher(&client, path.clone(), 3, &cancel)
        .fetch_all(&ids(2))
        .unwrap();

    assert_eq!(client.call_count("SRR000001"), 3);
    assert_eq!(report.completed, 1);
    assert_eq!(report.deferred, 1);

    let state = MetadataFetchState::load_or_create(&path).unwrap();
    assert!(state.deferred.contains("SRR000001"));
    assert!(state.records.contains_key("SRR000002"));
    // The second id succeeded, so the consecutive counter reset.
    assert_eq!(state.consecutive_429_count, 0);
}

#[test]
fn success_resets_consecutive_429_counter() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(&dir);

    let client = ScriptedEutils::default()
        .script("SRR000001", &[Response::RateLimited, Response::Success]);
    let cancel = AtomicBool::new(false);
    let report = fetcher(&client, path.clone(), 3, &cancel)
        .fetch_all(&ids(1))
        .unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(client.call_count("SRR000001"), 2);
    let state = MetadataFetchState::load_or_create(&path).unwrap();
    assert_eq!(state.consecutive_429_count, 0);
}

#[test]
fn transient_errors_use_bounded_retries_then_defer() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(&dir);

    let client = ScriptedEutils::default()
        .script("SRR000001", &[Response::Transient, Response::Transient])
        .script("SRR000002", &[Response::Transient, Response::Success]);
    let cancel = AtomicBool::new(false);
    let report = fetcher(&client, path.clone(), 2, &cancel)
        .fetch_all(&ids(2))
        .unwrap();

    assert_eq!(client.call_count("SRR000001"), 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.completed, 1);
}

#[test]
fn hard_errors_defer_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(&dir);

    let client = ScriptedEutils::default().script("SRR000001", &[Response::NotFound]);
    let cancel = AtomicBool::new(false);
    let report = fetcher(&client, path.clone(), 3, &cancel)
        .fetch_all(&ids(1))
        .unwrap();

    assert_eq!(client.call_count("SRR000001"), 1);
    assert_eq!(report.deferred, 1);
}

#[test]
fn state_file_is_valid_json_after_every_settled_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(&dir);

    // An id deferred mid-list must not lose the records settled before it.
    let client = ScriptedEutils::default().script("SRR000002", &[Response::NotFound]);
    let cancel = AtomicBool::new(false);
    let report = fetcher(&client, path.clone(), 3, &cancel)
        .fetch_all(&ids(3))
        .unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.deferred, 1);

    let content = std::fs::read_to_string(path.as_std_path()).unwrap();
    let state: MetadataFetchState = serde_json::from_str(&content).unwrap();
    assert!(state.records.contains_key("SRR000001"));
    assert!(state.records.contains_key("SRR000003"));
    assert!(state.deferred.contains("SRR000002"));
    assert!(!path.with_extension("tmp").as_std_path().exists());
}
