//! Periodic stale-job sweep

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use crate::jobs::reconcile::Reconciler;
use crate::storage::settings::ReconcilerSettings;

/// Reconciler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&ReconcilerSettings> for Options {
    fn from(settings: &ReconcilerSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
        }
    }
}

/// Run the reconciler worker until `shutdown_signal` resolves
pub async fn run<S, F>(
    options: &Options,
    reconciler: &Reconciler,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reconciler worker starting (every {:?})...", options.interval);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reconciler worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let report = reconciler.sweep().await;
        debug!("Reconciliation sweep: {:?}", report);
    }
}
