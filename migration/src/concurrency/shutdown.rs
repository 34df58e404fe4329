//! Cooperative stop signal for job items.
//!
//! A job item owns one [`ShutdownTx`]. Tasks hold a [`ShutdownRx`] and check it between units of
//! work, so a stop never interrupts a batch half way.

use std::future::Future;

use tokio::sync::watch;

/// Result of an operation that may end early because of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

/// Sending side of the stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests a stop. Repeated calls have no further effect.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the stop signal.
///
/// Unlike a plain watch receiver, a receiver created after the stop still observes it.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until a stop is requested.
    ///
    /// Never completes if the sender is dropped without requesting a stop.
    pub async fn wait(&mut self) {
        if self.0.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Returns an owned future completing when a stop is requested.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.clone();
        async move { rx.wait().await }
    }
}

/// Creates a new stop signal.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
