use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cloneable cancellation signal. Any clone may trigger it; every clone observes it.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
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

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as this token, so the channel cannot close here.
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// Caller-supplied limits for one pipeline run.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    pub cancel: Option<CancelToken>,
    /// Overall time limit for the run, measured from the call to `validate`.
    pub deadline: Option<Duration>,
}

impl RunControl {
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel: Some(cancel), deadline: None }
    }

    pub fn with_deadline(deadline: Duration) -> Self {
        Self { cancel: None, deadline: Some(deadline) }
    }
}
