use std::time::Duration;

/// Inbound message could not be turned into a domain record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing device identity field `{0}`")]
    MissingIdentity(&'static str),

    #[error("missing timestamp field `{0}`")]
    MissingTimestamp(&'static str),

    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("missing telemetry type discriminator")]
    MissingVariant,

    #[error("unrecognized telemetry type: {0}")]
    UnknownVariant(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {key} already exists")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {pattern} failed: {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure while ingesting one telemetry message.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to persist telemetry: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command request is missing a type")]
    MissingCommandType,

    #[error("invalid payload for {command_type}: {reason}")]
    InvalidPayload { command_type: String, reason: String },

    #[error("device {0} is not registered")]
    DeviceNotFound(String),

    #[error("device {device} did not respond within {waited:?}")]
    DeviceUnreachable { device: String, waited: Duration },

    #[error("command cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
