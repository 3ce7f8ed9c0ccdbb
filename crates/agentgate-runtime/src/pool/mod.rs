//! Bounded-parallelism execution of independent work items.
//!
//! [`run_bounded`] keeps at most `limit` workers in flight and returns one
//! slot per input, index-aligned regardless of completion order. Workers
//! receive a child of the pool's cancellation token, which is itself derived
//! from the caller's token, so cancelling the caller reaches every worker and
//! stops unstarted items from being picked up.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a pool invocation behaves.
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Requested parallelism. Clamped to `[1, items]`; zero and negative
    /// values behave as 1.
    pub limit: i64,
    /// Stop handing out items on the first worker error and return it.
    pub abort_on_error: bool,
    /// Caller's cancellation token; the pool derives its own from it.
    pub parent: Option<CancellationToken>,
}

impl PoolOptions {
    pub const fn with_limit(limit: i64) -> Self {
        Self {
            limit,
            abort_on_error: false,
            parent: None,
        }
    }

    #[must_use]
    pub const fn abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Parallelism actually used for `items` inputs.
    pub fn effective_limit(&self, items: usize) -> usize {
        let requested = usize::try_from(self.limit.max(1)).unwrap_or(usize::MAX);
        requested.min(items.max(1))
    }
}

/// Per-index outcome of a pool run.
#[derive(Debug)]
pub struct PoolReport<R, E> {
    /// One slot per input. `None` for items that never ran.
    pub results: Vec<Option<Result<R, E>>>,
    /// Indices whose worker returned an error, in completion order.
    pub failed_indices: Vec<usize>,
    /// The stop predicate ended the run before every item ran.
    pub stopped_early: bool,
}

impl<R, E> PoolReport<R, E> {
    fn with_len(len: usize) -> Self {
        Self {
            results: std::iter::repeat_with(|| None).take(len).collect(),
            failed_indices: Vec::new(),
            stopped_early: false,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of workers that returned `Ok`.
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|slot| matches!(slot, Some(Ok(_))))
            .count()
    }

    /// Number of items whose worker finished, successfully or not.
    pub fn settled(&self) -> usize {
        self.results.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_indices.is_empty()
    }
}

/// Why a pool run did not produce a normal report.
#[derive(Debug, thiserror::Error)]
pub enum PoolError<R, E> {
    /// First worker error in abort mode. The failing slot of `report` is
    /// empty; its error is `error`.
    #[error("worker {index} failed: {error}")]
    Aborted {
        index: usize,
        error: E,
        report: PoolReport<R, E>,
    },

    /// The caller's token fired before every item ran.
    #[error("pool cancelled after {} of {} items settled", .report.settled(), .report.len())]
    Cancelled { report: PoolReport<R, E> },
}

impl<R, E> PoolError<R, E> {
    /// The partial report, whatever the reason.
    pub fn into_report(self) -> PoolReport<R, E> {
        match self {
            Self::Aborted { report, .. } | Self::Cancelled { report } => report,
        }
    }
}

/// Run `worker` over `items` with bounded parallelism.
pub async fn run_bounded<T, R, E, F, Fut>(
    items: Vec<T>,
    options: PoolOptions,
    worker: F,
) -> Result<PoolReport<R, E>, PoolError<R, E>>
where
    R: Send + 'static,
    E: Send + 'static,
    F: FnMut(usize, T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    run_bounded_until(items, options, |_: &PoolReport<R, E>| false, worker).await
}

/// Like [`run_bounded`], evaluating `stop_when` after every completion.
///
/// When it returns true the remaining work is cancelled and the results
/// gathered so far are returned with `stopped_early` set. This is not an
/// error.
pub async fn run_bounded_until<T, R, E, F, Fut, S>(
    items: Vec<T>,
    options: PoolOptions,
    mut stop_when: S,
    mut worker: F,
) -> Result<PoolReport<R, E>, PoolError<R, E>>
where
    R: Send + 'static,
    E: Send + 'static,
    F: FnMut(usize, T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    S: FnMut(&PoolReport<R, E>) -> bool,
{
    let total = items.len();
    let mut report = PoolReport::with_len(total);
    if total == 0 {
        return Ok(report);
    }

    let limit = options.effective_limit(total);
    let token = options
        .parent
        .as_ref()
        .map_or_else(CancellationToken::new, CancellationToken::child_token);
    debug!(items = total, limit, abort_on_error = options.abort_on_error, "Pool run started");

    let mut pending = items.into_iter().enumerate();
    let mut in_flight = JoinSet::new();
    let mut first_failure: Option<usize> = None;

    loop {
        while in_flight.len() < limit && !token.is_cancelled() {
            let Some((index, item)) = pending.next() else {
                break;
            };
            let work = worker(index, item, token.child_token());
            in_flight.spawn(async move { (index, work.await) });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                debug!(error = %e, "Pool worker aborted");
                continue;
            }
        };

        if result.is_err() {
            report.failed_indices.push(index);
            if options.abort_on_error && first_failure.is_none() {
                debug!(index, "Worker failed, aborting pool run");
                first_failure = Some(index);
                token.cancel();
            }
        }
        if let Some(slot) = report.results.get_mut(index) {
            *slot = Some(result);
        }

        if stop_when(&report) {
            report.stopped_early = report.settled() < total;
            debug!(settled = report.settled(), "Pool stop condition met");
            token.cancel();
            in_flight.abort_all();
            break;
        }
    }

    if let Some(index) = first_failure
        && let Some(Some(Err(error))) = report.results.get_mut(index).map(Option::take)
    {
        return Err(PoolError::Aborted {
            index,
            error,
            report,
        });
    }

    let parent_cancelled = options
        .parent
        .as_ref()
        .is_some_and(CancellationToken::is_cancelled);
    if parent_cancelled && !report.stopped_early && report.settled() < total {
        debug!(settled = report.settled(), "Pool run cancelled");
        return Err(PoolError::Cancelled { report });
    }

    Ok(report)
}
