//! Periodic background jobs: package expiry sweep, ASR status refresh and the
//! pending-task rescan.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, Instrument};

use crate::billing::ledger;
use crate::asr::service as asr;
use crate::state::AppState;
use crate::tasks;

/// Starts every periodic job. The rescan ticks immediately, which doubles as
/// the startup scan for tasks orphaned by a previous process.
pub fn spawn_all(state: &AppState) -> Vec<JoinHandle<()>> {
    let workers = &state.config.workers;
    vec![
        spawn_every("expiry-sweep", workers.sweep_interval, state.clone(), |state| async move {
            match ledger::sweep_expired(&state.db, state.clock.now()).await {
                Ok(0) => debug!("No packages to expire"),
                Ok(n) => info!("Expired {n} package(s)"),
                Err(e) => error!("Expiry sweep failed: {e}"),
            }
        }),
        spawn_every("asr-refresh", workers.asr_refresh_interval, state.clone(), |state| async move {
            match asr::refresh_processing(&state).await {
                Ok(0) => {}
                Ok(n) => info!("{n} ASR task(s) reached a terminal state"),
                Err(e) => error!("ASR refresh failed: {e}"),
            }
        }),
        spawn_every("task-rescan", workers.rescan_interval, state.clone(), |state| async move {
            if let Err(e) = tasks::rescan(&state).await {
                error!("Task rescan failed: {e}");
            }
        }),
    ]
}

fn spawn_every<F, Fut>(name: &'static str, period: Duration, state: AppState, job: F) -> JoinHandle<()>
where
    F: Fn(AppState) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    info!(job.name = name, period_secs = period.as_secs(), "Scheduling job…");
    let span = info_span!("scheduler", job.name = name);
    tokio::spawn(
        async move {
            let mut ticker = interval(period.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job(state.clone()).await;
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::state::test_state;

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_immediately_then_each_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_every("count", Duration::from_secs(10), test_state(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.abort();
    }
}
