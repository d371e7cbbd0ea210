//! The background task that drains subscription queues.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::engine::BrokerService;

/// Handle to a running delivery loop. Dropping it cancels the loop.
#[derive(Debug)]
pub struct DeliveryLoop {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryLoop {
    pub(crate) fn spawn(service: Arc<BrokerService>) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(service, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the loop and wait for the current pass to wind down.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!("delivery loop ended abnormally: {err}");
            }
        }
    }
}

impl Drop for DeliveryLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(service: Arc<BrokerService>, cancel: CancellationToken) {
    let settings = service.settings().clone();

    // Keep trying to initialize until it works or the loop is stopped.
    loop {
        match service.ensure_initialized().await {
            Ok(()) => break,
            Err(err) => error!("delivery loop could not initialize broker: {err}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(settings.period()) => {}
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(settings.due_time()) => {}
    }
    info!("delivery loop started");

    loop {
        let pass_cancel = cancel.child_token();
        let mut pass = tokio::spawn({
            let service = Arc::clone(&service);
            let pass_cancel = pass_cancel.clone();
            async move { service.run_delivery_pass(&pass_cancel).await }
        });

        let stopping = tokio::select! {
            joined = &mut pass => {
                match joined {
                    Ok(Ok(summary)) if summary.delivered > 0 || summary.failed > 0 => {
                        debug!(
                            delivered = summary.delivered,
                            failed = summary.failed,
                            throttled = summary.throttled,
                            "delivery pass finished"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!("delivery pass failed: {err}"),
                    Err(err) => error!("delivery pass panicked: {err}"),
                }
                false
            }
            _ = tokio::time::sleep(settings.max_processing_period()) => {
                debug!("delivery pass exceeded its processing window");
                pass_cancel.cancel();
                pass.abort();
                let _ = pass.await;
                false
            }
            _ = cancel.cancelled() => {
                pass.abort();
                let _ = pass.await;
                true
            }
        };
        if stopping {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.period()) => {}
        }
    }
    info!("delivery loop stopped");
}
