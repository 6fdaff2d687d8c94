//! Scatter-gather primitive used by the aggregator.

use crate::providers::{ProviderKind, ProviderOutcome};
use std::future::Future;
use std::time::Duration;

/// Runs one provider branch in its own task under a time bound.
///
/// Always yields exactly one outcome: a timeout or a panic inside the branch
/// becomes `ProviderOutcome::Error`. A slow branch is aborted on timeout and
/// never affects its siblings.
pub async fn guarded<T, F>(kind: ProviderKind, timeout: Duration, fut: F) -> ProviderOutcome<T>
where
    T: Send + 'static,
    F: Future<Output = ProviderOutcome<T>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(outcome)) => {
            if let ProviderOutcome::Error(reason) = &outcome {
                tracing::warn!(provider = %kind, "provider failed: {}", reason);
            }
            outcome
        }
        Ok(Err(join_err)) => {
            tracing::warn!(provider = %kind, "provider task aborted: {}", join_err);
            ProviderOutcome::Error(format!("task failed: {}", join_err))
        }
        Err(_) => {
            abort.abort();
            tracing::warn!(provider = %kind, "provider timed out after {:?}", timeout);
            ProviderOutcome::Error(format!("timed out after {} ms", timeout.as_millis()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_through() {
        let outcome = guarded(ProviderKind::Registry, Duration::from_secs(1), async {
            ProviderOutcome::Success(42)
        })
        .await;
        assert_eq!(outcome, ProviderOutcome::Success(42));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let outcome: ProviderOutcome<()> =
            guarded(ProviderKind::KnowledgeBase, Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ProviderOutcome::Success(())
            })
            .await;
        match outcome {
            ProviderOutcome::Error(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let outcome: ProviderOutcome<u8> =
            guarded(ProviderKind::Certification, Duration::from_secs(1), async {
                panic!("decoder blew up")
            })
            .await;
        assert!(matches!(outcome, ProviderOutcome::Error(_)));
    }
}
