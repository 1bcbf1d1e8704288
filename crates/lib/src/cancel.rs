//! Cooperative cancellation shared by the orchestrator and in-flight builds.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable cancellation handle.
///
/// Every clone observes the same flag; once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct Cancellation {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl Cancellation {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self { tx: Arc::new(tx), rx }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
      // The sender lives as long as any handle, so this is unreachable.
      std::future::pending::<()>().await;
    }
  }
}

impl Default for Cancellation {
  fn default() -> Self {
    Self::new()
  }
}
