use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use super::ApiFailure;
use crate::tuning::Tuning;

/// Runs a Kubernetes call, retrying throttles, 5xx and transport failures
/// with exponential backoff until the tuning budget is spent. The last
/// failure is returned once the budget runs out; non-retryable failures
/// (404, 409, validation) pass through on the first attempt.
pub async fn with_transient_retries<T, F, Fut>(
    tuning: &Tuning,
    what: &str,
    mut call: F,
) -> Result<T, ApiFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiFailure>>,
{
    let mut delay = Duration::from_millis(tuning.api_retry_base_millis);
    let max_delay = Duration::from_millis(tuning.api_retry_max_millis);
    let attempts = tuning.api_retry_limit.max(1);

    let mut attempt = 1;
    loop {
        match call().await {
            Err(failure) if failure.is_retryable() && attempt < attempts => {
                warn!(
                    request = what,
                    attempt,
                    error = %failure,
                    "transient API failure, backing off"
                );
                sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}
