use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    Alert, AlertCategory, AlertStatus, Command, CommandStatus, Device, DeviceStatus, DeviceUpdate,
    NewCommand, Params, Severity, TelemetryRecord,
};
use crate::error::StoreError;
use crate::ports::{AlertStore, CommandStore, DeviceRegistry, TelemetryStore};

/// PostgreSQL implementation of every store port.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DEVICE_COLUMNS: &str = "probe_id, location, building, floor, department, status, \
                              firmware_version, last_seen, metadata";

const COMMAND_COLUMNS: &str = "id, probe_id, command_type, payload, correlation_id, status, \
                               issued_at, executed_at, result";

const ALERT_COLUMNS: &str = "id, probe_id, category, metric_key, severity, threshold_value, \
                             actual_value, message, status, occurrences, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct DeviceRow {
    probe_id: String,
    location: String,
    building: String,
    floor: String,
    department: String,
    status: String,
    firmware_version: String,
    last_seen: OffsetDateTime,
    metadata: Json<Map<String, Value>>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            device_id: row.probe_id,
            location: row.location,
            building: row.building,
            floor: row.floor,
            department: row.department,
            status: DeviceStatus::parse(&row.status),
            firmware_version: row.firmware_version,
            last_contact: row.last_seen,
            metadata: row.metadata.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CommandRow {
    id: i64,
    probe_id: String,
    command_type: String,
    payload: Json<Params>,
    correlation_id: String,
    status: String,
    issued_at: OffsetDateTime,
    executed_at: Option<OffsetDateTime>,
    result: Option<Json<Params>>,
}

impl TryFrom<CommandRow> for Command {
    type Error = StoreError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        let status = CommandStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown command status `{}`", row.status).into(),
            ))
        })?;
        Ok(Command {
            id: row.id,
            device_id: row.probe_id,
            command_type: row.command_type,
            payload: row.payload.0,
            correlation_id: row.correlation_id,
            status,
            issued_at: row.issued_at,
            executed_at: row.executed_at,
            result: row.result.map(|r| r.0),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    probe_id: String,
    category: String,
    metric_key: String,
    severity: String,
    threshold_value: f64,
    actual_value: f64,
    message: String,
    status: String,
    occurrences: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<AlertRow> for Alert {
    fn from(row: AlertRow) -> Self {
        Alert {
            id: Some(row.id),
            device_id: row.probe_id,
            category: AlertCategory::parse(&row.category),
            metric_key: row.metric_key,
            severity: Severity::parse(&row.severity),
            threshold: row.threshold_value,
            observed: row.actual_value,
            message: row.message,
            status: AlertStatus::parse(&row.status),
            occurrences: row.occurrences,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn commands_from(rows: Vec<CommandRow>) -> Result<Vec<Command>, StoreError> {
    rows.into_iter().map(Command::try_from).collect()
}

#[async_trait]
impl DeviceRegistry for PostgresRepository {
    async fn lookup(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let query = format!("SELECT {} FROM probes WHERE probe_id = $1", DEVICE_COLUMNS);
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Device::from))
    }

    #[instrument(skip(self, device), fields(device_id = %device.device_id))]
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO probes (probe_id, location, building, floor, department, status,
                                firmware_version, last_seen, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#;

        let result = sqlx::query(query)
            .bind(&device.device_id)
            .bind(&device.location)
            .bind(&device.building)
            .bind(&device.floor)
            .bind(&device.department)
            .bind(device.status.as_str())
            .bind(&device.firmware_version)
            .bind(device.last_contact)
            .bind(Json(&device.metadata))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                info!("Device stored");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::AlreadyExists {
                entity: "device",
                key: device.device_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_last_contact(&self, device_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        // Never move last_seen backwards when touches race.
        sqlx::query(
            r#"
            UPDATE probes
            SET last_seen = GREATEST(last_seen, $2),
                status = CASE WHEN status = 'stale' THEN 'active' ELSE status END,
                updated_at = NOW()
            WHERE probe_id = $1
            "#,
        )
        .bind(device_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, update))]
    async fn update(&self, device_id: &str, update: &DeviceUpdate) -> Result<Device, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {} FROM probes WHERE probe_id = $1 FOR UPDATE", DEVICE_COLUMNS);
        let mut device: Device = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(Device::from)
            .ok_or_else(|| StoreError::NotFound {
                entity: "device",
                key: device_id.to_string(),
            })?;

        update.apply(&mut device);

        sqlx::query(
            r#"
            UPDATE probes
            SET location = $2, building = $3, floor = $4, department = $5, status = $6,
                firmware_version = $7, metadata = $8, updated_at = NOW()
            WHERE probe_id = $1
            "#,
        )
        .bind(device_id)
        .bind(&device.location)
        .bind(&device.building)
        .bind(&device.floor)
        .bind(&device.department)
        .bind(device.status.as_str())
        .bind(&device.firmware_version)
        .bind(Json(&device.metadata))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(device)
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        let query = format!("SELECT {} FROM probes ORDER BY probe_id", DEVICE_COLUMNS);
        let rows = sqlx::query_as::<_, DeviceRow>(&query).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn list_stale(&self, cutoff: OffsetDateTime) -> Result<Vec<Device>, StoreError> {
        let query = format!(
            "SELECT {} FROM probes WHERE last_seen < $1 AND status = 'active' ORDER BY last_seen ASC",
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }
}

#[async_trait]
impl TelemetryStore for PostgresRepository {
    #[instrument(skip(self, record), fields(device_id = %record.device_id, kind = record.variant.as_str()))]
    async fn append(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO telemetry (probe_id, time, received_at, payload_type, rssi, latency,
                                   packet_loss, dns_time, channel, bssid, neighbors, overlap,
                                   congestion, snr, link_quality, utilization, phy_mode,
                                   throughput, noise_floor, uptime, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
        "#;

        let link = &record.link;
        let enhanced = record.variant.enhanced().cloned().unwrap_or_default();

        sqlx::query(query)
            .bind(&record.device_id)
            .bind(record.timestamp)
            .bind(record.received_at)
            .bind(record.variant.as_str())
            .bind(link.rssi)
            .bind(link.latency)
            .bind(link.packet_loss)
            .bind(link.dns_time)
            .bind(link.channel)
            .bind(&link.bssid)
            .bind(link.neighbors)
            .bind(link.overlap)
            .bind(link.congestion)
            .bind(enhanced.snr)
            .bind(enhanced.link_quality)
            .bind(enhanced.utilization)
            .bind(&enhanced.phy_mode)
            .bind(enhanced.throughput)
            .bind(enhanced.noise_floor)
            .bind(enhanced.uptime)
            .bind(Json(&record.metadata))
            .execute(&self.pool)
            .await?;

        debug!("Telemetry stored");
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PostgresRepository {
    #[instrument(skip(self, alert), fields(device_id = %alert.device_id, metric = %alert.metric_key))]
    async fn create(&self, alert: &Alert) -> Result<i64, StoreError> {
        let query = r#"
            INSERT INTO alerts (probe_id, category, metric_key, severity, threshold_value,
                                actual_value, message, status, occurrences, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
        "#;

        let (id,): (i64,) = sqlx::query_as(query)
            .bind(&alert.device_id)
            .bind(alert.category.as_str())
            .bind(&alert.metric_key)
            .bind(alert.severity.as_str())
            .bind(alert.threshold)
            .bind(alert.observed)
            .bind(&alert.message)
            .bind(alert.status.as_str())
            .bind(alert.occurrences)
            .bind(alert.created_at)
            .bind(alert.updated_at)
            .fetch_one(&self.pool)
            .await?;

        info!(alert_id = id, "Alert stored");
        Ok(id)
    }

    async fn acknowledge(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE alerts SET status = 'acknowledged', updated_at = NOW() WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resolve(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE alerts SET status = 'resolved', resolved_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status <> 'resolved'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, device_id: Option<&str>) -> Result<Vec<Alert>, StoreError> {
        let query = format!(
            "SELECT {} FROM alerts WHERE status = 'active' AND ($1::TEXT IS NULL OR probe_id = $1) \
             ORDER BY created_at DESC",
            ALERT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AlertRow>(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Alert::from).collect())
    }
}

#[async_trait]
impl CommandStore for PostgresRepository {
    #[instrument(skip(self, command), fields(device_id = %command.device_id, command_type = %command.command_type))]
    async fn create(&self, command: &NewCommand) -> Result<Command, StoreError> {
        let query = format!(
            "INSERT INTO commands (probe_id, command_type, payload, correlation_id, status, issued_at) \
             VALUES ($1, $2, $3, $4, 'pending', NOW()) RETURNING {}",
            COMMAND_COLUMNS
        );
        let result = sqlx::query_as::<_, CommandRow>(&query)
            .bind(&command.device_id)
            .bind(&command.command_type)
            .bind(Json(&command.payload))
            .bind(&command.correlation_id)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => row.try_into(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::AlreadyExists {
                entity: "command",
                key: command.correlation_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        id: i64,
        status: CommandStatus,
        result: Option<&Params>,
    ) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE commands
            SET status = $2,
                result = COALESCE($3, result),
                executed_at = CASE WHEN $4 THEN NOW() ELSE executed_at END
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(result.map(Json))
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;

        let changed = outcome.rows_affected() > 0;
        if !changed {
            warn!(command_id = id, status = status.as_str(), "Status update skipped, command missing or terminal");
        }
        Ok(changed)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Command>, StoreError> {
        let query = format!("SELECT {} FROM commands WHERE id = $1", COMMAND_COLUMNS);
        let row = sqlx::query_as::<_, CommandRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Command::try_from).transpose()
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<Command>, StoreError> {
        let query = format!("SELECT {} FROM commands WHERE correlation_id = $1", COMMAND_COLUMNS);
        let row = sqlx::query_as::<_, CommandRow>(&query)
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Command::try_from).transpose()
    }

    async fn find_latest_open(
        &self,
        device_id: &str,
        command_type: &str,
    ) -> Result<Option<Command>, StoreError> {
        let query = format!(
            "SELECT {} FROM commands WHERE probe_id = $1 AND command_type = $2 \
             AND status IN ('pending', 'sent') ORDER BY issued_at DESC, id DESC LIMIT 1",
            COMMAND_COLUMNS
        );
        let row = sqlx::query_as::<_, CommandRow>(&query)
            .bind(device_id)
            .bind(command_type)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Command::try_from).transpose()
    }

    async fn list_pending(&self) -> Result<Vec<Command>, StoreError> {
        let query = format!(
            "SELECT {} FROM commands WHERE status IN ('pending', 'sent') ORDER BY issued_at ASC, id ASC",
            COMMAND_COLUMNS
        );
        let rows = sqlx::query_as::<_, CommandRow>(&query).fetch_all(&self.pool).await?;
        commands_from(rows)
    }

    async fn list_for_device(&self, device_id: &str, limit: i64) -> Result<Vec<Command>, StoreError> {
        let query = format!(
            "SELECT {} FROM commands WHERE probe_id = $1 ORDER BY issued_at DESC, id DESC LIMIT $2",
            COMMAND_COLUMNS
        );
        let rows = sqlx::query_as::<_, CommandRow>(&query)
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        commands_from(rows)
    }

    #[instrument(skip(self))]
    async fn prune_old_scans(&self, device_id: &str, keep: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM commands
            WHERE probe_id = $1 AND command_type = 'deep_scan' AND status = 'completed'
              AND id NOT IN (
                  SELECT id FROM commands
                  WHERE probe_id = $1 AND command_type = 'deep_scan' AND status = 'completed'
                  ORDER BY issued_at DESC, id DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(device_id)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Pruned old deep scan results");
        }
        Ok(removed)
    }
}
