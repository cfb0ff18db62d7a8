use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio::sync::Semaphore;
use tracing::{error, info, Instrument};

use crate::ports::InboundMessage;
use crate::service::processor::ServiceProcessor;

/// Bounded pool that keeps telemetry and result handling off the MQTT event loop.
pub struct WorkerPool {
    processor: Arc<ServiceProcessor>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(processor: Arc<ServiceProcessor>, concurrency: usize) -> Self {
        Self {
            processor,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs until the channel closes, then waits for in-flight jobs.
    pub async fn run(self, mut receiver: Receiver<InboundMessage>) {
        info!("WorkerPool starting with {} workers", self.concurrency);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let active_count = Arc::new(AtomicUsize::new(0));

        while let Some(msg) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("Semaphore closed");
                    break;
                }
            };

            let processor = self.processor.clone();
            let active_count = active_count.clone();
            let span = tracing::info_span!("worker_process", topic = %msg.topic);

            tokio::spawn(
                async move {
                    let _permit = permit;

                    let current = active_count.fetch_add(1, Ordering::SeqCst) + 1;
                    metrics::gauge!("worker_active_count", current as f64);
                    metrics::counter!("worker_jobs_started_total", 1);

                    let start = std::time::Instant::now();
                    if let Err(e) = processor.process(&msg).await {
                        error!("Processing error in WorkerPool: {:?}", e);
                        metrics::counter!("worker_errors_total", 1, "type" => "processing_error");
                    }
                    metrics::histogram!("worker_processing_duration_seconds", start.elapsed().as_secs_f64());

                    let remaining = active_count.fetch_sub(1, Ordering::SeqCst) - 1;
                    metrics::gauge!("worker_active_count", remaining as f64);
                }
                .instrument(span),
            );
        }

        // Every permit back means every job finished.
        let _drained = semaphore.acquire_many(self.concurrency as u32).await;
        info!("WorkerPool shutting down");
    }
}
