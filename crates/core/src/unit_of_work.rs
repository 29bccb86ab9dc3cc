use std::future::Future;

use tokio::sync::watch;

/// Abstraction over "durably persist every change the context is tracking".
///
/// Implementations forward to a concrete persistence technology and surface
/// its errors unchanged through [`UnitOfWork::Error`].
pub trait UnitOfWork {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Flushes all tracked changes and returns the number of affected records.
    ///
    /// A signal that is already triggered must fail the call before any write
    /// is attempted.
    fn commit(
        &mut self,
        cancel: Option<&CancelSignal>,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send;
}

/// Creates a linked cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver })
}

/// Owner side of a cooperative cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Triggers the signal. Calling it more than once has no further effect.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns another signal observing this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Observer side of a cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal is triggered.
    ///
    /// If the handle is dropped without cancelling, the future never resolves.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                if *receiver.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}
