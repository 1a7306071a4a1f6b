//! Operator interrupt plumbing
//!
//! The entry point owns an [`Interrupter`] and bumps it once per interrupt it
//! receives. The coordinator owns the matching [`Cancellation`] and decides
//! what each interrupt means for the current stage of the run. Interrupts are
//! counted rather than flagged so the coordinator can tell a first interrupt
//! from a repeated one.

use tokio::sync::watch;

/// Sending half: raised from signal listeners
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: watch::Sender<u32>,
}

impl Interrupter {
    /// Record one operator interrupt
    pub fn interrupt(&self) {
        self.tx.send_modify(|count| *count = count.saturating_add(1));
    }

    /// Number of interrupts raised so far
    pub fn count(&self) -> u32 {
        *self.tx.borrow()
    }
}

/// Receiving half: observed by the coordinator
#[derive(Debug)]
pub struct Cancellation {
    rx: watch::Receiver<u32>,
    observed: u32,
}

/// Create a connected interrupter/cancellation pair
pub fn channel() -> (Interrupter, Cancellation) {
    let (tx, rx) = watch::channel(0);
    (Interrupter { tx }, Cancellation { rx, observed: 0 })
}

impl Cancellation {
    /// A cancellation that never fires (no signal source attached)
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(0);
        Self { rx, observed: 0 }
    }

    /// Whether at least one interrupt has been raised
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() > 0
    }

    /// Interrupts raised but not yet consumed by [`Cancellation::next`]
    pub fn pending(&self) -> u32 {
        self.rx.borrow().saturating_sub(self.observed)
    }

    /// Wait for the next interrupt not yet observed
    ///
    /// Consumes every interrupt raised up to the moment it returns, so a burst
    /// of interrupts is seen as one. Never returns once the sender is gone.
    pub async fn next(&mut self) {
        loop {
            let current = *self.rx.borrow_and_update();
            if current > self.observed {
                self.observed = current;
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Mark everything raised so far as observed, returning how many were new
    pub fn absorb(&mut self) -> u32 {
        let current = *self.rx.borrow_and_update();
        let fresh = current.saturating_sub(self.observed);
        self.observed = current;
        fresh
    }
}
