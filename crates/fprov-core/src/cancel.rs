use tokio::sync::watch;

use crate::error::{ProvisionError, Result};

pub(crate) fn cancel_requested(cancel_rx: Option<&watch::Receiver<bool>>) -> bool {
    cancel_rx.map(|rx| *rx.borrow()).unwrap_or(false)
}

pub(crate) fn check_cancel(cancel_rx: Option<&watch::Receiver<bool>>, what: &str) -> Result<()> {
    if cancel_requested(cancel_rx) {
        Err(ProvisionError::Cancelled(what.to_string()))
    } else {
        Ok(())
    }
}

/// Resolves once the flag flips to `true`; never resolves without a
/// receiver or after the sender is gone.
pub(crate) async fn cancelled(cancel_rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel_rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
