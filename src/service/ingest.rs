use std::sync::Arc;

use sqlx::types::time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::domain::{Device, TelemetryRecord};
use crate::error::{IngestError, StoreError};
use crate::ports::{DeviceRegistry, TelemetryStore};
use crate::service::decoder;
use crate::service::evaluator::AlertEvaluator;

/// Decode, register, persist, touch, evaluate.
pub struct TelemetryPipeline {
    registry: Arc<dyn DeviceRegistry>,
    store: Arc<dyn TelemetryStore>,
    evaluator: Arc<AlertEvaluator>,
}

impl TelemetryPipeline {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        store: Arc<dyn TelemetryStore>,
        evaluator: Arc<AlertEvaluator>,
    ) -> Self {
        Self { registry, store, evaluator }
    }

    #[instrument(skip(self, payload), fields(payload_len = payload.len(), device_id = tracing::field::Empty))]
    pub async fn ingest(&self, payload: &[u8]) -> Result<TelemetryRecord, IngestError> {
        let record = decoder::decode(payload, OffsetDateTime::now_utc()).map_err(|e| {
            metrics::counter!("telemetry_decode_errors_total", 1);
            IngestError::from(e)
        })?;
        tracing::Span::current().record("device_id", &record.device_id.as_str());
        self.ingest_record(record).await
    }

    /// Returns how many records of the upload were stored.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn ingest_offline(&self, payload: &[u8]) -> Result<usize, IngestError> {
        let decoded = decoder::decode_batch(payload, OffsetDateTime::now_utc()).map_err(|e| {
            metrics::counter!("telemetry_decode_errors_total", 1);
            IngestError::from(e)
        })?;
        let total = decoded.len();
        let mut stored = 0;
        for item in decoded {
            match item {
                Ok(record) => match self.ingest_record(record).await {
                    Ok(_) => stored += 1,
                    Err(e) => error!("Offline record not stored: {}", e),
                },
                Err(e) => {
                    metrics::counter!("telemetry_decode_errors_total", 1);
                    warn!("Dropping offline record: {}", e);
                }
            }
        }
        info!(stored, total, "Offline telemetry upload processed");
        Ok(stored)
    }

    /// Persists an already-decoded record and runs the rest of the pipeline.
    pub async fn ingest_record(&self, record: TelemetryRecord) -> Result<TelemetryRecord, IngestError> {
        self.ensure_registered(&record).await;

        self.store.append(&record).await?;
        metrics::counter!("telemetry_ingested_total", 1, "type" => record.variant.as_str());
        info!(
            device_id = %record.device_id,
            kind = record.variant.as_str(),
            rssi = ?record.link.rssi,
            "Telemetry stored"
        );

        if let Err(e) = self
            .registry
            .touch_last_contact(&record.device_id, record.received_at)
            .await
        {
            warn!(device_id = %record.device_id, "Failed to update last contact: {}", e);
        }

        self.evaluator.evaluate(&record).await;
        Ok(record)
    }

    async fn ensure_registered(&self, record: &TelemetryRecord) {
        match self.registry.lookup(&record.device_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(device_id = %record.device_id, "Unknown probe detected, auto-registering");
                let device = Device::placeholder(record.device_id.as_str(), record.received_at);
                match self.registry.create(&device).await {
                    Ok(()) => metrics::counter!("devices_auto_registered_total", 1),
                    Err(StoreError::AlreadyExists { .. }) => {}
                    Err(e) => error!(device_id = %record.device_id, "Failed to auto-register probe: {}", e),
                }
            }
            Err(e) => error!(device_id = %record.device_id, "Device lookup failed: {}", e),
        }
    }
}
