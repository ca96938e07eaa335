//! Lifecycle manager: ties remote targets to the lifetime of a local owner.
//!
//! A [`ReleaseGuard`] is the owner's claim on a remote target. Dropping it
//! queues an automatic `release`, which the release task sends later; nothing
//! is written from inside `Drop`. [`ReleaseGuard::disarm`] is the deterministic
//! path taken before a `manual-release`, so a target is never released twice on
//! purpose.
//!
//! Automatic release is a backstop. Callers that care about timing (cancelled
//! recordings holding native resources) should release explicitly.

use std::sync::Weak;

use tokio::sync::mpsc;

use crate::bridge::protocol::TargetId;
use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct Lifecycle {
    release_tx: mpsc::UnboundedSender<TargetId>,
}

impl Lifecycle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TargetId>) {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        (Self { release_tx }, release_rx)
    }

    /// Bind automatic release of `target` to the returned guard.
    pub fn bind(&self, target: TargetId) -> ReleaseGuard {
        ReleaseGuard {
            target,
            release_tx: Some(self.release_tx.clone()),
        }
    }
}

/// Claim on a remote target. Queues an automatic release on drop unless disarmed.
#[must_use = "dropping the guard releases the remote target"]
pub struct ReleaseGuard {
    target: TargetId,
    release_tx: Option<mpsc::UnboundedSender<TargetId>>,
}

impl ReleaseGuard {
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn is_armed(&self) -> bool {
        self.release_tx.is_some()
    }

    /// Stop the automatic release. Returns whether it was still armed.
    pub fn disarm(&mut self) -> bool {
        self.release_tx.take().is_some()
    }
}

impl std::fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("target", &self.target)
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.release_tx.take() {
            tracing::debug!(target_id = %self.target, "Owner dropped, scheduling release");
            if tx.send(self.target.clone()).is_err() {
                tracing::debug!(target_id = %self.target, "Release task gone, skipping release");
            }
        }
    }
}

/// Drain queued releases and send them.
///
/// Holds the dispatcher weakly: the queue's senders live inside the dispatcher,
/// so a strong reference would keep this task alive forever. Exits once every
/// sender is dropped or the dispatcher is gone.
pub async fn run_release_queue(
    mut release_rx: mpsc::UnboundedReceiver<TargetId>,
    dispatcher: Weak<Dispatcher>,
) {
    while let Some(target) = release_rx.recv().await {
        let Some(dispatcher) = dispatcher.upgrade() else {
            tracing::debug!(target_id = %target, "Dispatcher gone, dropping release");
            break;
        };

        let reply = match dispatcher.release(&target) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(target_id = %target, error = %e, "Could not send release");
                continue;
            }
        };
        drop(dispatcher);

        // Don't hold up later releases on this acknowledgement.
        tokio::spawn(async move {
            if let Err(e) = reply.await {
                tracing::debug!(target_id = %target, error = %e, "Release not acknowledged");
            }
        });
    }
    tracing::debug!("Release queue exiting");
}
