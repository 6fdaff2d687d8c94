use crate::errors::AppError;
use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{CircuitBreaker, Config, StateMachine};
use std::future::Future;
use std::time::Duration;

/// Circuit breaker guarding one external provider.
pub type ProviderBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for an external data provider.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, requests pass through.
/// - **OPEN**: Too many failures, requests fail fast.
/// - **HALF_OPEN**: Testing if the provider recovered.
pub fn create_provider_circuit_breaker() -> ProviderBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Awaits `fut` through the breaker.
///
/// An open circuit fails fast with `ExternalApiError` without polling the
/// future. Otherwise the result is recorded as a success or failure.
///
/// # Arguments
///
/// * `breaker` - The provider's circuit breaker.
/// * `provider` - Provider name, used in the fail-fast message.
/// * `fut` - The guarded call.
pub async fn call_guarded<T, F>(
    breaker: &ProviderBreaker,
    provider: &str,
    fut: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    if !breaker.is_call_permitted() {
        tracing::warn!("Circuit open for {}, failing fast", provider);
        return Err(AppError::ExternalApiError(format!(
            "{} circuit breaker is open",
            provider
        )));
    }

    let result = fut.await;
    let _ = breaker.call(|| result.as_ref().map(|_| ()).map_err(|_| ()));
    result
}
