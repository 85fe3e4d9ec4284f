use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use image::DynamicImage;
use portray_contracts::jobs::{
    progress_estimate, JobState, JobStatus, MAX_STATUS_CHECKS, POLL_INTERVAL_SECS,
};
use portray_contracts::requests::{FineTuneRequest, GenerationRequest};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{Map, Value};

pub const DEFAULT_API_BASE: &str = "https://api.us1.bfl.ai/v1";
pub const GENERATION_ENDPOINT: &str = "flux-pro-1.1-ultra-finetuned";
pub const FINETUNE_ENDPOINT: &str = "finetune";

/// Deploy-time identity of the fine-tuned subject. Both are overridable
/// through the environment, neither is a request parameter.
pub const DEFAULT_FINETUNE_ID: &str = "17547232-bbdf-409b-91c9-a8a510286857";
pub const DEFAULT_TRIGGER_WORD: &str = "christian_1234_tok";

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Resolved once at process start and passed explicitly; no ambient global.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_base: String,
    pub api_key: String,
    pub finetune_id: String,
    pub trigger_word: String,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, FluxError> {
        let api_key = non_empty_env("BFL_API_KEY")
            .or_else(|| non_empty_env("FLUX_API_KEY"))
            .ok_or_else(|| {
                FluxError::Config("BFL_API_KEY or FLUX_API_KEY is not set".to_string())
            })?;
        Ok(Self {
            api_base: non_empty_env("FLUX_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
            finetune_id: non_empty_env("PORTRAY_FINETUNE_ID")
                .unwrap_or_else(|| DEFAULT_FINETUNE_ID.to_string()),
            trigger_word: non_empty_env("PORTRAY_TRIGGER_WORD")
                .unwrap_or_else(|| DEFAULT_TRIGGER_WORD.to_string()),
        })
    }
}

/// Everything that can go wrong in a run. Every variant is terminal for
/// its request; nothing is retried.
#[derive(Debug)]
pub enum FluxError {
    /// Missing or unusable local configuration; raised before any request.
    Config(String),
    /// Non-success or transport failure on submit or status query, or a
    /// success body missing required fields.
    Request { status: Option<u16>, detail: String },
    /// Transport failure, non-success status, or undecodable bytes while
    /// fetching the finished asset.
    Download(String),
    /// The provider reported the job as Failed.
    Failed { detail: String },
    /// The poll budget ran out before the job reached a terminal status.
    Timeout { checks: u32 },
}

impl FluxError {
    fn request(detail: impl Into<String>) -> Self {
        Self::Request {
            status: None,
            detail: detail.into(),
        }
    }

    fn http(status: u16, body: &str) -> Self {
        Self::Request {
            status: Some(status),
            detail: truncate_text(body, MAX_ERROR_BODY_CHARS),
        }
    }
}

impl fmt::Display for FluxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FluxError::Config(detail) => write!(f, "{detail}"),
            FluxError::Request {
                status: Some(code),
                detail,
            } => write!(f, "flux request failed ({code}): {detail}"),
            FluxError::Request {
                status: None,
                detail,
            } => write!(f, "flux request failed: {detail}"),
            FluxError::Download(detail) => write!(f, "portrait download failed: {detail}"),
            FluxError::Failed { detail } => write!(f, "generation failed: {detail}"),
            FluxError::Timeout { checks } => {
                write!(f, "generation timed out after {checks} status checks")
            }
        }
    }
}

impl std::error::Error for FluxError {}

/// Wire-level surface of the provider, split out so the polling driver is
/// deterministic under test.
pub trait JobTransport {
    fn submit(&self, payload: &Map<String, Value>) -> Result<Value, FluxError>;
    fn status(&self, job_id: &str) -> Result<Value, FluxError>;
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FluxError>;
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_checks: u32,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(POLL_INTERVAL_SECS),
            max_checks: MAX_STATUS_CHECKS,
        }
    }
}

/// Progress callbacks surfaced to the caller while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Submitted { job_id: String },
    StatusChecked { checks: u32, status: String, pct: u8 },
    Ready { sample_url: String },
}

#[derive(Debug)]
pub struct GeneratedPortrait {
    pub job_id: String,
    pub sample_url: String,
    pub image: DynamicImage,
}

/// Raw outcome of a fine-tune upload. Reported without interpretation:
/// success is "got 200", anything else is whatever the provider sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FineTuneOutcome {
    pub status: u16,
    pub body: String,
}

impl FineTuneOutcome {
    pub fn accepted(&self) -> bool {
        self.status == 200
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    pub fn finetune_id(&self) -> Option<String> {
        self.body_json()?
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Blocking HTTP client for the Flux API. One instance per process,
/// authenticated with the static `x-key` header.
pub struct FluxClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl FluxClient {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            http: HttpClient::new(),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(60),
        }
    }

    fn post_json(&self, endpoint: &str, payload: &Map<String, Value>) -> Result<Value, FluxError> {
        let response = self
            .http
            .post(endpoint)
            .header("accept", "application/json")
            .header("x-key", &self.api_key)
            .json(&Value::Object(payload.clone()))
            .timeout(self.request_timeout)
            .send()
            .map_err(|err| FluxError::request(format!("{endpoint}: {err}")))?;
        response_json_or_error(response)
    }

    fn get_json(&self, url: &str) -> Result<Value, FluxError> {
        let response = self
            .http
            .get(url)
            .header("accept", "application/json")
            .header("x-key", &self.api_key)
            .timeout(self.request_timeout)
            .send()
            .map_err(|err| FluxError::request(format!("{url}: {err}")))?;
        response_json_or_error(response)
    }

    /// One-shot POST to the training endpoint. Non-success responses are
    /// data here, not errors; only transport failures error out.
    pub fn post_finetune(&self, payload: &Map<String, Value>) -> Result<FineTuneOutcome, FluxError> {
        let endpoint = format!("{}/{}", self.api_base, FINETUNE_ENDPOINT);
        let response = self
            .http
            .post(&endpoint)
            .header("accept", "application/json")
            .header("x-key", &self.api_key)
            .json(&Value::Object(payload.clone()))
            .timeout(self.request_timeout)
            .send()
            .map_err(|err| FluxError::request(format!("{endpoint}: {err}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| FluxError::request(format!("response body read failed: {err}")))?;
        Ok(FineTuneOutcome { status, body })
    }
}

impl JobTransport for FluxClient {
    fn submit(&self, payload: &Map<String, Value>) -> Result<Value, FluxError> {
        let endpoint = format!("{}/{}", self.api_base, GENERATION_ENDPOINT);
        self.post_json(&endpoint, payload)
    }

    fn status(&self, job_id: &str) -> Result<Value, FluxError> {
        let url = format!("{}/get_result?id={}", self.api_base, job_id);
        self.get_json(&url)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, FluxError> {
        let response = self
            .http
            .get(url)
            .header("x-key", &self.api_key)
            .timeout(self.download_timeout)
            .send()
            .map_err(|err| FluxError::Download(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(FluxError::Download(format!(
                "({code}): {}",
                truncate_text(&body, MAX_ERROR_BODY_CHARS)
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|err| FluxError::Download(format!("body read failed: {err}")))?;
        Ok(bytes.to_vec())
    }
}

/// Submit, poll to a terminal state, download and decode the asset.
/// Blocks the caller for the whole run; the observer only narrates.
pub fn run_generation<T: JobTransport, S: Sleeper>(
    transport: &T,
    sleeper: &S,
    schedule: PollSchedule,
    request: &GenerationRequest,
    mut observer: impl FnMut(RunEvent),
) -> Result<GeneratedPortrait, FluxError> {
    let submitted = transport.submit(&request.payload())?;
    let job_id = submitted
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| FluxError::request("submission response missing id"))?
        .to_string();
    observer(RunEvent::Submitted {
        job_id: job_id.clone(),
    });

    let sample_url = wait_for_result(transport, sleeper, schedule, &job_id, &mut observer)?;
    observer(RunEvent::Ready {
        sample_url: sample_url.clone(),
    });

    let bytes = transport.fetch(&sample_url)?;
    let image = image::load_from_memory(&bytes)
        .map_err(|err| FluxError::Download(format!("image decode failed: {err}")))?;

    Ok(GeneratedPortrait {
        job_id,
        sample_url,
        image,
    })
}

/// The polling state machine: sleep a fixed interval, query status, and
/// dispatch on `Pending -> Ready | Failed | TimedOut`. A transport error
/// on the status query is fatal, not retried.
pub fn wait_for_result<T: JobTransport, S: Sleeper>(
    transport: &T,
    sleeper: &S,
    schedule: PollSchedule,
    job_id: &str,
    observer: &mut impl FnMut(RunEvent),
) -> Result<String, FluxError> {
    let mut state = JobState::Pending;
    let mut checks = 0u32;

    while checks < schedule.max_checks {
        sleeper.sleep(schedule.interval);
        let payload = transport.status(job_id)?;
        checks += 1;

        let label = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let status = JobStatus::from_label(label);
        state = state.observe(&status);

        match state {
            JobState::Ready => {
                let sample_url = payload
                    .get("result")
                    .and_then(Value::as_object)
                    .and_then(|row| row.get("sample"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| FluxError::request("ready response missing result.sample URL"))?;
                return Ok(sample_url.to_string());
            }
            JobState::Failed => {
                return Err(FluxError::Failed {
                    detail: truncate_text(&payload.to_string(), MAX_ERROR_BODY_CHARS),
                });
            }
            JobState::Pending | JobState::TimedOut => {
                observer(RunEvent::StatusChecked {
                    checks,
                    status: status.label().to_string(),
                    pct: progress_estimate(checks),
                });
            }
        }
    }

    state = state.time_out();
    debug_assert_eq!(state, JobState::TimedOut);
    Err(FluxError::Timeout { checks })
}

/// Read the archive, base64 it into the training payload, POST once, and
/// hand back whatever came over the wire. No polling.
pub fn upload_finetune(
    client: &FluxClient,
    request: &FineTuneRequest,
    archive_path: &Path,
) -> Result<FineTuneOutcome, FluxError> {
    let archive = std::fs::read(archive_path).map_err(|err| {
        FluxError::Config(format!(
            "failed to read archive {}: {err}",
            archive_path.display()
        ))
    })?;
    client.post_finetune(&request.payload(&archive))
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, FluxError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| FluxError::request(format!("response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(FluxError::http(code, &body));
    }
    serde_json::from_str(&body).map_err(|_| FluxError::Request {
        status: Some(code),
        detail: format!("invalid JSON payload: {}", truncate_text(&body, 80)),
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
