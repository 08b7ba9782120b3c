//! Cancellation signal observed while backend and provisioning calls run.

use tokio::sync::watch;
use tracing::{debug, warn};

/// Read side of an interrupt signal. Clones observe the same signal.
#[derive(Clone, Debug)]
pub struct Interrupt {
    signal: Option<watch::Receiver<bool>>,
}

/// Write side returned by [`Interrupt::channel`].
#[derive(Debug)]
pub struct InterruptTrigger(watch::Sender<bool>);

impl InterruptTrigger {
    /// Fires the interrupt. Every clone of the paired [`Interrupt`] sees it.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl Interrupt {
    /// An interrupt that never fires.
    #[must_use]
    pub const fn never() -> Self {
        Self { signal: None }
    }

    /// Creates an interrupt fired through the returned trigger.
    #[must_use]
    pub fn channel() -> (InterruptTrigger, Self) {
        let (sender, receiver) = watch::channel(false);
        (
            InterruptTrigger(sender),
            Self {
                signal: Some(receiver),
            },
        )
    }

    /// Creates an interrupt fired by the first Ctrl-C.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn on_ctrl_c() -> Self {
        let (trigger, interrupt) = Self::channel();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    debug!("interrupt received");
                    trigger.trigger();
                }
                Err(err) => warn!(error = %err, "cannot listen for Ctrl-C"),
            }
        });
        interrupt
    }

    /// Returns `true` once the interrupt has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.signal
            .as_ref()
            .is_some_and(|receiver| *receiver.borrow())
    }

    /// Completes once the interrupt fires; never completes otherwise.
    pub async fn triggered(&self) {
        if let Some(receiver) = &self.signal {
            let mut watcher = receiver.clone();
            let fired = watcher.wait_for(|fired| *fired).await.is_ok();
            if fired {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_wakes_every_clone() {
        let (trigger, interrupt) = Interrupt::channel();
        let observer = interrupt.clone();
        assert!(!observer.is_triggered());

        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), observer.triggered())
            .await
            .expect("interrupt observed");
        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn never_stays_pending() {
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), Interrupt::never().triggered()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn dropped_trigger_does_not_fire() {
        let (trigger, interrupt) = Interrupt::channel();
        drop(trigger);

        let outcome = tokio::time::timeout(Duration::from_millis(20), interrupt.triggered()).await;
        assert!(outcome.is_err());
    }
}
