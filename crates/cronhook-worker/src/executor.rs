use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cronhook_core::config::WorkerConfig;
use cronhook_scheduler::{types::ResponseMeta, Run};
use tracing::debug;

use crate::error::{Result, WorkerError};

const USER_AGENT: &str = concat!("cronhook/", env!("CARGO_PKG_VERSION"));

pub const RUN_ID_HEADER: &str = "X-Cronhook-Run-Id";
pub const ATTEMPT_HEADER: &str = "X-Cronhook-Attempt";

/// Longest response body excerpt kept in a failure message.
const ERROR_BODY_LIMIT: usize = 256;

/// Result of one outbound callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success(ResponseMeta),
    Failure {
        error: String,
        status: Option<u16>,
        /// False when repeating the request cannot help (bad template, bad method).
        retryable: bool,
    },
}

#[async_trait]
pub trait CallbackExecutor: Send + Sync {
    /// Perform exactly one attempt for `run`. Never errors: every failure is
    /// folded into the outcome so the worker can record it on the run.
    async fn execute(&self, run: &Run) -> CallbackOutcome;
}

/// reqwest-backed executor.
pub struct HttpExecutor {
    client: reqwest::Client,
    success: RangeInclusive<u16>,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.callback_timeout_ms);
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            success: config.success_status_min..=config.success_status_max,
            timeout,
        })
    }

    fn build_request(&self, run: &Run) -> Result<reqwest::RequestBuilder> {
        let callback = &run.callback;
        let method = reqwest::Method::from_bytes(callback.method.as_bytes())
            .map_err(|_| WorkerError::Template(format!("invalid method: {}", callback.method)))?;

        let mut request = self
            .client
            .request(method, &callback.url)
            .header(RUN_ID_HEADER, &run.id)
            .header(ATTEMPT_HEADER, run.attempt.to_string());
        for (name, value) in &callback.headers {
            request = request.header(name, value);
        }
        if let Some(template) = &callback.body_template {
            let body = render_template(template, run)?;
            let has_content_type = callback
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            if !has_content_type {
                request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            request = request.body(body);
        }
        Ok(request)
    }
}

#[async_trait]
impl CallbackExecutor for HttpExecutor {
    async fn execute(&self, run: &Run) -> CallbackOutcome {
        let request = match self.build_request(run) {
            Ok(request) => request,
            Err(e) => {
                return CallbackOutcome::Failure {
                    error: e.to_string(),
                    status: None,
                    retryable: false,
                }
            }
        };

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return CallbackOutcome::Failure {
                    error: format!("callback timed out after {} ms", self.timeout.as_millis()),
                    status: None,
                    retryable: true,
                }
            }
            // A request reqwest cannot even build fails the same way every time.
            Err(e) if e.is_builder() => {
                return CallbackOutcome::Failure {
                    error: format!("invalid request: {e}"),
                    status: None,
                    retryable: false,
                }
            }
            Err(e) => {
                return CallbackOutcome::Failure {
                    error: format!("transport error: {e}"),
                    status: None,
                    retryable: true,
                }
            }
        };

        let status = response.status().as_u16();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(run_id = %run.id, status, elapsed_ms, "callback answered");

        if self.success.contains(&status) {
            return CallbackOutcome::Success(ResponseMeta { status, elapsed_ms });
        }

        let excerpt = body_excerpt(response).await;
        let error = if excerpt.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {excerpt}")
        };
        CallbackOutcome::Failure {
            error,
            status: Some(status),
            retryable: true,
        }
    }
}

/// Leading text of a failure response. Reads at most enough bytes to fill
/// `ERROR_BODY_LIMIT` characters; the rest of the body is never buffered.
async fn body_excerpt(mut response: reqwest::Response) -> String {
    let max_bytes = ERROR_BODY_LIMIT * 4;
    let mut buf = Vec::new();
    while buf.len() < max_bytes {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    buf.truncate(max_bytes);
    String::from_utf8_lossy(&buf)
        .trim()
        .chars()
        .take(ERROR_BODY_LIMIT)
        .collect()
}

/// Substitute `{{placeholder}}`s in a body template.
///
/// Known placeholders: `job_id`, `job_name`, `run_id`, `attempt`,
/// `scheduled_for` (RFC 3339). Anything else is an error.
pub fn render_template(template: &str, run: &Run) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| WorkerError::Template("unclosed '{{' in body template".to_string()))?;
        let key = after[..end].trim();
        match key {
            "job_id" => out.push_str(&run.job_id),
            "job_name" => out.push_str(&run.job_name),
            "run_id" => out.push_str(&run.id),
            "attempt" => out.push_str(&run.attempt.to_string()),
            "scheduled_for" => out.push_str(&run.scheduled_for.to_rfc3339()),
            other => {
                return Err(WorkerError::Template(format!(
                    "unknown placeholder: {{{{{other}}}}}"
                )))
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
