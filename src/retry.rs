use crate::config_loader::Settings;
use crate::error::ServiceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Bounds every external call: a timeout per attempt and a single retry after `backoff`.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl From<&Settings> for CallPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            timeout: settings.service_timeout(),
            backoff: settings.retry_backoff(),
        }
    }
}

async fn attempt<T, Fut>(service: &str, policy: &CallPolicy, fut: Fut) -> Result<T, ServiceError>
where
    Fut: Future<Output = Result<T, ServiceError>>,
{
    match timeout(policy.timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout {
            service: service.to_string(),
            after: policy.timeout,
        }),
    }
}

/// Run `call`, retrying once when the failure is transient.
pub async fn call_with_retry<T, F, Fut>(service: &str, policy: &CallPolicy, mut call: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    match attempt(service, policy, call()).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => {
            warn!("{}: {} (retrying in {:?})", service, e, policy.backoff);
            sleep(policy.backoff).await;
            attempt(service, policy, call()).await
        }
        Err(e) => Err(e),
    }
}
