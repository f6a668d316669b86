/// Trailing-edge debouncing of bursty events
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// Delivers the last value pushed once `wait` has passed without a new push.
///
/// Each push re-arms the timer. Dropping the debouncer flushes a pending value
/// immediately instead of discarding it.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn the timer task; must be called inside a tokio runtime
    pub fn new<F>(wait: Duration, mut fire: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();

        tokio::spawn(async move {
            let mut pending: Option<T> = None;
            let mut deadline = Instant::now();

            loop {
                if pending.is_none() {
                    match rx.recv().await {
                        Some(value) => {
                            pending = Some(value);
                            deadline = Instant::now() + wait;
                        }
                        None => break,
                    }
                    continue;
                }

                tokio::select! {
                    next = rx.recv() => match next {
                        Some(value) => {
                            pending = Some(value);
                            deadline = Instant::now() + wait;
                        }
                        None => {
                            if let Some(value) = pending.take() {
                                fire(value);
                            }
                            break;
                        }
                    },
                    _ = sleep_until(deadline) => {
                        if let Some(value) = pending.take() {
                            fire(value);
                        }
                    }
                }
            }
        });

        Self { tx }
    }

    /// Replace the pending value and restart the wait
    pub fn push(&self, value: T) {
        // The timer task only stops once every sender is gone
        let _ = self.tx.send(value);
    }
}
