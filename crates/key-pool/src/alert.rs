//! Operator alert channel
//!
//! Alerts are best effort. Callers go through `fire_and_forget`, which
//! detaches delivery onto its own task so a slow or failing channel never
//! delays or fails the operation that raised the alert.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;

/// Sink for free-text operator alerts.
pub trait Alerter: Send + Sync {
    /// Identifier for logging (e.g. "telegram", "log").
    fn id(&self) -> &str;

    fn send(&self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Alerter that only writes to the log. Used when no external channel is configured.
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn id(&self) -> &str {
        "log"
    }

    fn send(&self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            warn!(alert = %message, "operator alert");
            Ok(())
        })
    }
}

/// Deliver `message` on a detached task, logging (never propagating) failure.
pub fn fire_and_forget(alerter: Arc<dyn Alerter>, message: String) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(alert = %message, "no runtime available, alert logged only");
        return;
    };
    handle.spawn(async move {
        match alerter.send(message).await {
            Ok(()) => debug!(channel = alerter.id(), "operator alert delivered"),
            Err(e) => warn!(channel = alerter.id(), error = %e, "operator alert failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::sync::mpsc;

    struct ChannelAlerter(mpsc::UnboundedSender<String>);

    impl Alerter for ChannelAlerter {
        fn id(&self) -> &str {
            "channel"
        }

        fn send(&self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let _ = self.0.send(message);
            Box::pin(async { Ok(()) })
        }
    }

    struct FailingAlerter;

    impl Alerter for FailingAlerter {
        fn id(&self) -> &str {
            "failing"
        }

        fn send(&self, _message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Err(Error::Alert("channel down".into())) })
        }
    }

    #[tokio::test]
    async fn fire_and_forget_delivers_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        fire_and_forget(Arc::new(ChannelAlerter(tx)), "key expired".into());
        assert_eq!(rx.recv().await.unwrap(), "key expired");
    }

    #[tokio::test]
    async fn fire_and_forget_swallows_failures() {
        fire_and_forget(Arc::new(FailingAlerter), "ignored".into());
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn log_alerter_always_succeeds() {
        LogAlerter.send("hello".into()).await.unwrap();
        assert_eq!(LogAlerter.id(), "log");
    }
}
