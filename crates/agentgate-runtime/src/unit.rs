//! One unit of agent work under capacity control.

use std::fmt::Display;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::admission::{AdmissionController, AdmissionError, AdmissionRequest};
use crate::resilience::{Classify, Resilience, ResilienceError};

/// Why a unit of work did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum UnitError<E> {
    /// No capacity was granted; the work never ran.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("{0}")]
    Work(ResilienceError<E>),
}

impl<E> UnitError<E> {
    pub const fn is_cancelled(&self) -> bool {
        match self {
            Self::Admission(e) => matches!(e, AdmissionError::Cancelled),
            Self::Work(e) => e.is_cancelled(),
        }
    }

    /// The work's own error, if it ran and failed.
    pub fn into_work_error(self) -> Option<E> {
        match self {
            Self::Admission(_) => None,
            Self::Work(e) => e.into_inner(),
        }
    }
}

/// Admit `request`, then run `work` through the resilience layer under
/// dependency `key`. Capacity is held for the whole call, retries included,
/// and returned when this future completes or is dropped.
pub async fn execute_unit<T, E, F, Fut>(
    admission: &AdmissionController,
    resilience: &Resilience,
    request: &AdmissionRequest,
    key: &str,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, UnitError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let lease = admission.admit(request, cancel).await?;
    debug!(lease_id = %lease.id(), key, "Unit admitted");

    let result = resilience.call(key, cancel, work).await;
    let elapsed = lease.elapsed();
    lease.finish();

    match result {
        Ok(value) => {
            debug!(key, elapsed_ms = elapsed.as_millis(), "Unit completed");
            Ok(value)
        }
        Err(e) => {
            if !e.is_cancelled() {
                warn!(key, elapsed_ms = elapsed.as_millis(), error = %e, "Unit failed");
            }
            Err(UnitError::Work(e))
        }
    }
}
