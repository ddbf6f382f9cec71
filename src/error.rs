//! Error types and the recovery policy attached to them.

use std::time::Duration;

use crate::{
    api::Problem,
    web::{HttpResponse, WebError},
};

/// Fallback back-off when the CA rate-limits us without a `Retry-After`.
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(3600);

/// An error response from the ACME API.
///
/// Carries the problem document together with the response metadata the
/// protocol cares about: the HTTP status (409 on `newAccount` means the
/// account already exists), the `Location` header (the existing account URL
/// in that case) and `Retry-After` (rate limiting).
#[derive(Debug, thiserror::Error)]
#[error("HTTP {status}: {problem}")]
pub struct ApiError {
    pub status: u16,
    pub problem: Problem,
    pub location: Option<String>,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    /// Passes successful responses through, maps everything else to an
    /// [`ApiError`] with the problem document parsed from the body.
    pub(crate) fn check(res: HttpResponse) -> Result<HttpResponse, ApiError> {
        if res.is_success() {
            return Ok(res);
        }

        let problem = if res.content_type() == Some("application/problem+json") {
            let body = res.body_str();
            serde_json::from_str(&body).unwrap_or_else(|err| Problem {
                _type: "problemJsonFail".into(),
                detail: Some(format!(
                    "Failed to deserialize application/problem+json ({err}) body: {body}"
                )),
                ..Default::default()
            })
        } else {
            Problem {
                _type: "httpReqError".into(),
                detail: Some(format!("{} body: {}", res.status, res.body_str())),
                ..Default::default()
            }
        };

        Err(ApiError {
            status: res.status,
            problem,
            location: res.header("location").map(str::to_owned),
            retry_after: res
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        })
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// The order this error belongs to cannot complete (failed authorization,
/// rejected CSR). The order record is deleted and a fresh order is placed on
/// a later tick.
#[derive(Debug, thiserror::Error)]
#[error("order failed: {0}")]
pub struct OrderFailed(pub String);

/// A polling loop ran out of attempts. The step is re-entered on a later
/// tick; no state is lost.
#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for {0}")]
pub struct PollTimeout(pub &'static str);

/// How the driver treats a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Re-run the same step on the next tick.
    Retry,

    /// Leave the step alone until the given pause has passed.
    Backoff(Duration),

    /// Delete the current order and start over from order creation.
    Abandon,

    /// Surface to the host; nothing sensible to do automatically.
    Fatal,
}

/// Maps an error produced by any protocol step to its recovery policy.
pub(crate) fn classify(err: &eyre::Report) -> Recovery {
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            if api.status == 429 || api.problem.is_rate_limited() {
                return Recovery::Backoff(api.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF));
            }
            // 5xx is transient by definition; a 4xx may clear up too (e.g.
            // an expired authorization), so both re-run the same step under
            // the driver's failure cap.
            return Recovery::Retry;
        }

        if cause.downcast_ref::<OrderFailed>().is_some() {
            return Recovery::Abandon;
        }

        if cause.downcast_ref::<PollTimeout>().is_some() {
            return Recovery::Retry;
        }

        if let Some(web) = cause.downcast_ref::<WebError>() {
            return if web.is_transient() {
                Recovery::Retry
            } else {
                Recovery::Fatal
            };
        }

        // A body that does not parse means we are not talking to a sane CA.
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return Recovery::Fatal;
        }

        if cause.downcast_ref::<std::io::Error>().is_some() {
            return Recovery::Fatal;
        }
    }

    Recovery::Fatal
}
