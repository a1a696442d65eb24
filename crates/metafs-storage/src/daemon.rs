//! Checkpoint daemon
//!
//! One long-lived task per volume. It alternates between explicit
//! checkpoint requests and interval-timer ticks, runs the checkpoint under
//! the volume lock, and fail-stops the volume on any checkpoint error: a
//! partial checkpoint may have marked tree pages clean whose bytes never
//! reached the object store, and a later successful checkpoint would mask
//! the lost references. Without page-level rollback, refusing further
//! writes is the only safe option.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use crate::volume::Volume;
use metafs_core::Result;

/// One checkpoint request to the daemon.
pub(crate) struct CheckpointRequest {
    /// Stop the daemon once this checkpoint completes.
    pub(crate) exit_on_completion: bool,
    /// Signalled with the checkpoint's outcome.
    pub(crate) done: Option<oneshot::Sender<Result<()>>>,
}

pub(crate) async fn run(volume: Arc<Volume>, mut requests: mpsc::Receiver<CheckpointRequest>) {
    let period = volume.config().checkpoint_interval();
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let request = tokio::select! {
            _ = ticker.tick() => CheckpointRequest {
                exit_on_completion: false,
                done: None,
            },
            received = requests.recv() => match received {
                Some(request) => request,
                None => return,
            },
        };

        let mut state = volume.state.lock().await;
        tracing::debug!(
            explicit = request.done.is_some(),
            exit_on_completion = request.exit_on_completion,
            "running checkpoint"
        );
        match volume.put_checkpoint(&mut state).await {
            Ok(()) => {
                for waiter in state.next_checkpoint_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if let Some(done) = request.done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "checkpoint failed; volume halted");
                state.failed = true;
                if volume.config().halt_on_fatal_error {
                    std::process::abort();
                }
                if let Some(done) = request.done {
                    let _ = done.send(Err(err));
                }
                return;
            }
        }
        drop(state);

        if request.exit_on_completion {
            return;
        }
    }
}
