use crate::remote::model::{
    ApiErrorBody, CheckoutRequest, CheckoutResponse, CheckoutVerification, JobStatusResponse,
    ManifestEntry, PricingRequest, PricingResponse,
};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Concurrent upload flights for `POST /job/{id}/upload`.
const MAX_UPLOAD_FLIGHTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("remote job failed: {0}")]
    Job(String),
    #[error("paid amount was modified: {0}")]
    Tampered(String),
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("timed out waiting for job {job_id}")]
    Timeout { job_id: String },
}

impl ApiError {
    /// Transport failures and server-side 5xx responses are worth another
    /// attempt; everything else is a hard answer.
    fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(_) => true,
            ApiError::UnexpectedStatus { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Exponential backoff: `base_delay * 2^(attempt-1)`, `max_attempts` total.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// One photo staged for upload.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub photo_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Blocking client for the auto-select collaborator's REST surface.
pub struct AutoSelectClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
    poll_interval: Duration,
    poll_timeout: Duration,
    max_consecutive_poll_errors: u32,
}

impl AutoSelectClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(30 * 60),
            max_consecutive_poll_errors: 3,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `POST /pricing`: what auto-selecting `photo_count` photos would cost.
    pub fn pricing(&self, photo_count: u64) -> Result<PricingResponse, ApiError> {
        let response = self
            .http
            .post(self.url("pricing"))
            .json(&PricingRequest { photo_count })
            .send()?;
        expect_ok_json(response)
    }

    /// `POST /checkout`: open a checkout session and its backing job.
    pub fn create_checkout(&self, photo_count: u64) -> Result<CheckoutResponse, ApiError> {
        let response = self
            .http
            .post(self.url("checkout"))
            .json(&CheckoutRequest { photo_count })
            .send()?;
        expect_ok_json(response)
    }

    /// `GET /checkout/{id}/verify`. A 409 means the service detected a
    /// modified payment amount; that is never retried.
    pub fn verify_checkout(&self, checkout_id: &str) -> Result<CheckoutVerification, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("checkout/{checkout_id}/verify")))
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            let body = response.text()?;
            let detail = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.describe())
                .unwrap_or(body);
            return Err(ApiError::Tampered(detail));
        }
        expect_ok_json(response)
    }

    /// Upload photo blobs one file per request, at most five in flight,
    /// each with backoff retry. `progress` sees (done, total) after every
    /// completed upload.
    pub fn upload_photos<F>(
        &self,
        job_id: &str,
        items: &[UploadItem],
        progress: F,
    ) -> Result<usize, ApiError>
    where
        F: Fn(usize, usize) + Sync,
    {
        let url = self.url(&format!("job/{job_id}/upload"));
        let total = items.len();
        let done = AtomicUsize::new(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(MAX_UPLOAD_FLIGHTS)
            .build()
            .unwrap_or_else(|_| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .build()
                    .unwrap()
            });
        pool.install(|| {
            use rayon::prelude::*;
            items.par_iter().try_for_each(|item| {
                self.retrying(&format!("upload {}", item.photo_id), || {
                    let form = Form::new().part(
                        "file",
                        Part::bytes(item.bytes.clone()).file_name(item.filename.clone()),
                    );
                    let response = self.http.post(&url).multipart(form).send()?;
                    expect_ok_empty(response)
                })?;
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress(finished, total);
                Ok::<(), ApiError>(())
            })
        })?;
        tracing::info!("upload: {} photos sent for job {}", total, job_id);
        Ok(total)
    }

    /// `POST /job/{id}`: submit the grouping manifest and start processing.
    pub fn submit_manifest(
        &self,
        job_id: &str,
        entries: &[ManifestEntry],
    ) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url(&format!("job/{job_id}")))
            .json(&entries)
            .send()?;
        expect_ok_empty(response)
    }

    /// `GET /job/{id}`. 202 reads as still pending; a 500 body is parsed
    /// for the structured error before being surfaced.
    pub fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, ApiError> {
        let response = self.http.get(self.url(&format!("job/{job_id}"))).send()?;
        match response.status() {
            StatusCode::OK => Ok(response.json()?),
            StatusCode::ACCEPTED => Ok(JobStatusResponse::pending()),
            StatusCode::INTERNAL_SERVER_ERROR => {
                let body = response.text()?;
                let detail = serde_json::from_str::<ApiErrorBody>(&body)
                    .map(|b| b.describe())
                    .unwrap_or(body);
                Err(ApiError::Job(detail))
            }
            status => {
                let body = response.text()?;
                Err(ApiError::UnexpectedStatus { status, body })
            }
        }
    }

    /// Poll `GET /job/{id}` until the job reaches a terminal state.
    /// Tolerates up to three consecutive transport failures before giving
    /// up with a retryable error; `on_status` sees every good response.
    pub fn poll_job<F>(&self, job_id: &str, mut on_status: F) -> Result<JobStatusResponse, ApiError>
    where
        F: FnMut(&JobStatusResponse),
    {
        let started = std::time::Instant::now();
        let mut consecutive_errors = 0u32;
        loop {
            std::thread::sleep(self.poll_interval);
            if started.elapsed() > self.poll_timeout {
                return Err(ApiError::Timeout {
                    job_id: job_id.to_string(),
                });
            }
            match self.job_status(job_id) {
                Ok(status) => {
                    consecutive_errors = 0;
                    on_status(&status);
                    if status.is_done() {
                        return Ok(status);
                    }
                }
                Err(err) if err.is_retryable() => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        "poll job {}: transport error {}/{}: {}",
                        job_id,
                        consecutive_errors,
                        self.max_consecutive_poll_errors,
                        err
                    );
                    if consecutive_errors > self.max_consecutive_poll_errors {
                        return Err(ApiError::RetriesExhausted {
                            attempts: consecutive_errors,
                            last_error: err.to_string(),
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// `POST /job/{id}/refund`.
    pub fn refund(&self, job_id: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url(&format!("job/{job_id}/refund")))
            .send()?;
        expect_ok_empty(response)
    }

    /// Run `op` under the retry policy, backing off between attempts.
    fn retrying<T>(
        &self,
        what: &str,
        op: impl Fn() -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut last_error: Option<ApiError> = None;
        for attempt in 1..=self.retry.max_attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        "{}: attempt {}/{} failed: {}",
                        what,
                        attempt,
                        self.retry.max_attempts,
                        err
                    );
                    if attempt < self.retry.max_attempts {
                        std::thread::sleep(self.retry.backoff_delay(attempt));
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(ApiError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

fn expect_ok_json<T: serde::de::DeserializeOwned>(
    response: reqwest::blocking::Response,
) -> Result<T, ApiError> {
    match response.status() {
        StatusCode::OK => Ok(response.json()?),
        status => {
            let body = response.text()?;
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }
}

fn expect_ok_empty(response: reqwest::blocking::Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text()?;
        Err(ApiError::UnexpectedStatus { status, body })
    }
}
