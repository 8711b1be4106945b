use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, trace};

use interlock_pipeline::Signal;

use super::{AtomicSwitch, SignalDisposition};

impl AtomicSwitch {
    /// Consume signals until the channel closes.
    ///
    /// Each signal is handled in its own task, so a signal arriving while a
    /// switch runs is coalesced rather than queued behind it. In-flight
    /// switches are awaited before the listener exits.
    pub fn spawn_listener(self: &Arc<Self>, mut rx: mpsc::Receiver<Signal>) -> JoinHandle<()> {
        let switch = Arc::clone(self);
        tokio::spawn(async move {
            info!(threshold = switch.config.impact_threshold, "Signal listener started");
            let mut in_flight = JoinSet::new();

            while let Some(signal) = rx.recv().await {
                let switch = Arc::clone(&switch);
                in_flight.spawn(async move { switch.on_signal(signal).await });
                while let Some(done) = in_flight.try_join_next() {
                    log_disposition(done);
                }
            }

            while let Some(done) = in_flight.join_next().await {
                log_disposition(done);
            }
            info!("Signal listener stopped");
        })
    }
}

fn log_disposition(done: Result<SignalDisposition, JoinError>) {
    match done {
        Ok(SignalDisposition::Switched(report)) => debug!(
            switch_id = report.switch_id,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Switch handled"
        ),
        Ok(SignalDisposition::Coalesced) => trace!("Signal coalesced"),
        Ok(SignalDisposition::BelowThreshold) => trace!("Signal ignored"),
        Err(e) => error!(error = %e, "Signal handler task failed"),
    }
}
