//! Shutdown coordination for cluster control loops.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

/// Coordinator for graceful shutdown.
///
/// Control loops subscribe to a broadcast channel and exit when it fires.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        tracing::info!(subscribers = self.tx.receiver_count(), "Shutdown triggered");
        let _ = self.tx.send(());
    }

    /// Number of loops still subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait for `tasks` to finish, aborting whatever is left at `deadline`.
    /// Returns the number of tasks that had to be aborted.
    pub async fn drain(tasks: Vec<JoinHandle<()>>, deadline: Duration) -> usize {
        let until = time::Instant::now() + deadline;
        let mut aborted = 0;
        for mut task in tasks {
            match time::timeout_at(until, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Control loop panicked"),
                Err(_) => {
                    task.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Shutdown deadline reached, aborted control loops");
        }
        aborted
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_trigger() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        shutdown.trigger();
        assert_eq!(Shutdown::drain(vec![task], Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_after_deadline() {
        let stuck = tokio::spawn(std::future::pending::<()>());
        assert_eq!(Shutdown::drain(vec![stuck], Duration::from_secs(5)).await, 1);
    }
}
