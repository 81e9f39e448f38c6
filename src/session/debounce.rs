use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

enum Signal<T> {
    Push(T),
    Cancel,
}

/// Delivers the latest pushed value once no new value has arrived for `quiet`
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn spawn<F, Fut>(quiet: Duration, on_settle: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal<T>>();

        let task = tokio::spawn(async move {
            let mut pending: Option<T> = None;

            loop {
                let signal = if pending.is_some() {
                    tokio::select! {
                        signal = rx.recv() => signal,
                        _ = tokio::time::sleep(quiet) => {
                            if let Some(value) = pending.take() {
                                debug!("Debounce settled after {:?}", quiet);
                                on_settle(value).await;
                            }
                            continue;
                        }
                    }
                } else {
                    rx.recv().await
                };

                match signal {
                    Some(Signal::Push(value)) => pending = Some(value),
                    Some(Signal::Cancel) => pending = None,
                    None => break,
                }
            }
        });

        Self { tx, task }
    }

    /// Replace any pending value and restart the quiet period
    pub fn push(&self, value: T) {
        let _ = self.tx.send(Signal::Push(value));
    }

    /// Drop the pending value, if any
    pub fn cancel(&self) {
        let _ = self.tx.send(Signal::Cancel);
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
