use crate::error::CommandError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;

/// Device key recorded for commands addressed to the whole fleet.
pub const BROADCAST_DEVICE: &str = "broadcast";

pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommandStatus::Pending),
            "sent" => Some(CommandStatus::Sent),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// Terminal states are final; a result may land before the `sent` update.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        match (self, next) {
            (CommandStatus::Completed | CommandStatus::Failed, _) => false,
            (CommandStatus::Sent, CommandStatus::Pending) => false,
            (CommandStatus::Pending, CommandStatus::Pending) => false,
            _ => true,
        }
    }
}

fn default_scan_duration() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepScanParams {
    #[serde(default = "default_scan_duration")]
    pub duration: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetWifiParams {
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMqttParams {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameParams {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartParams {
    #[serde(default)]
    pub delay: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaUpdateParams {
    pub url: String,
    pub version: String,
}

/// Typed command intent. Types the backend does not know about are forwarded
/// untouched through `Passthrough`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    DeepScan(DeepScanParams),
    ConfigUpdate(ConfigUpdateParams),
    GetConfig,
    SetWifi(SetWifiParams),
    SetMqtt(SetMqttParams),
    Rename(RenameParams),
    Restart(RestartParams),
    OtaUpdate(OtaUpdateParams),
    FactoryReset,
    Ping,
    GetStatus,
    Passthrough { command_type: String, params: Params },
}

fn typed<T: DeserializeOwned>(command_type: &str, params: Params) -> Result<T, CommandError> {
    serde_json::from_value(Value::Object(params)).map_err(|e| CommandError::InvalidPayload {
        command_type: command_type.to_string(),
        reason: e.to_string(),
    })
}

fn to_params<T: Serialize>(value: &T) -> Params {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Params::new(),
    }
}

impl CommandKind {
    pub fn parse(command_type: &str, params: Params) -> Result<Self, CommandError> {
        let command_type = command_type.trim();
        let kind = match command_type {
            "" => return Err(CommandError::MissingCommandType),
            "deep_scan" => CommandKind::DeepScan(typed(command_type, params)?),
            "config_update" => CommandKind::ConfigUpdate(typed(command_type, params)?),
            "get_config" => CommandKind::GetConfig,
            "set_wifi" => CommandKind::SetWifi(typed(command_type, params)?),
            "set_mqtt" => CommandKind::SetMqtt(typed(command_type, params)?),
            "rename" => CommandKind::Rename(typed(command_type, params)?),
            "restart" => CommandKind::Restart(typed(command_type, params)?),
            "ota_update" => {
                let ota: OtaUpdateParams = typed(command_type, params)?;
                if ota.url.is_empty() || ota.version.is_empty() {
                    return Err(CommandError::InvalidPayload {
                        command_type: command_type.to_string(),
                        reason: "ota_update requires url and version".to_string(),
                    });
                }
                CommandKind::OtaUpdate(ota)
            }
            "factory_reset" => CommandKind::FactoryReset,
            "ping" => CommandKind::Ping,
            "get_status" => CommandKind::GetStatus,
            other => CommandKind::Passthrough {
                command_type: other.to_string(),
                params,
            },
        };
        Ok(kind)
    }

    pub fn type_name(&self) -> &str {
        match self {
            CommandKind::DeepScan(_) => "deep_scan",
            CommandKind::ConfigUpdate(_) => "config_update",
            CommandKind::GetConfig => "get_config",
            CommandKind::SetWifi(_) => "set_wifi",
            CommandKind::SetMqtt(_) => "set_mqtt",
            CommandKind::Rename(_) => "rename",
            CommandKind::Restart(_) => "restart",
            CommandKind::OtaUpdate(_) => "ota_update",
            CommandKind::FactoryReset => "factory_reset",
            CommandKind::Ping => "ping",
            CommandKind::GetStatus => "get_status",
            CommandKind::Passthrough { command_type, .. } => command_type,
        }
    }

    /// Parameters as they go on the wire and into the command row.
    pub fn params(&self) -> Params {
        match self {
            CommandKind::DeepScan(p) => to_params(p),
            CommandKind::ConfigUpdate(p) => to_params(p),
            CommandKind::SetWifi(p) => to_params(p),
            CommandKind::SetMqtt(p) => to_params(p),
            CommandKind::Rename(p) => to_params(p),
            CommandKind::Restart(p) => to_params(p),
            CommandKind::OtaUpdate(p) => to_params(p),
            CommandKind::Passthrough { params, .. } => params.clone(),
            CommandKind::GetConfig
            | CommandKind::FactoryReset
            | CommandKind::Ping
            | CommandKind::GetStatus => Params::new(),
        }
    }

    /// The liveness probe itself never waits on a liveness probe.
    pub fn requires_verification(&self) -> bool {
        !matches!(self, CommandKind::Ping)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub device_id: String,
    pub command_type: String,
    pub payload: Params,
    pub correlation_id: String,
    pub status: CommandStatus,
    #[serde(with = "time::serde::iso8601")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub executed_at: Option<OffsetDateTime>,
    pub result: Option<Params>,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub device_id: String,
    pub command_type: String,
    pub payload: Params,
    pub correlation_id: String,
}

impl NewCommand {
    pub fn new(device_id: &str, kind: &CommandKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            command_type: kind.type_name().to_string(),
            payload: kind.params(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Outgoing command as published on `<ns>/<device>/cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "type")]
    pub command_type: String,
    pub correlation_id: String,
    pub params: Params,
    pub timestamp: i64,
}

impl CommandMessage {
    pub fn for_command(command: &Command, now: OffsetDateTime) -> Self {
        Self {
            command_type: command.command_type.clone(),
            correlation_id: command.correlation_id.clone(),
            params: command.payload.clone(),
            timestamp: now.unix_timestamp(),
        }
    }
}

/// Untyped intent as it arrives from an operator-facing surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device_id: String,
    #[serde(rename = "type", default)]
    pub command_type: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Completed,
    Failed,
    InProgress,
}

impl ResultOutcome {
    pub fn status(&self) -> CommandStatus {
        match self {
            ResultOutcome::Completed => CommandStatus::Completed,
            ResultOutcome::Failed => CommandStatus::Failed,
            ResultOutcome::InProgress => CommandStatus::Sent,
        }
    }
}

/// Inbound result as published on `<ns>/<device>/result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResultMessage {
    #[serde(default)]
    pub device: String,
    pub command_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default)]
    pub result: Params,
}

impl CommandResultMessage {
    pub fn outcome(&self) -> ResultOutcome {
        if let Some(Value::Bool(false)) = self.result.get("success") {
            return ResultOutcome::Failed;
        }
        match self.status.to_ascii_lowercase().as_str() {
            "failed" | "error" | "timeout" => ResultOutcome::Failed,
            "progress" | "in_progress" => ResultOutcome::InProgress,
            _ => ResultOutcome::Completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = CommandKind::parse("  ", Params::new()).unwrap_err();
        assert!(matches!(err, CommandError::MissingCommandType));
    }

    #[test]
    fn deep_scan_defaults_duration() {
        let kind = CommandKind::parse("deep_scan", Params::new()).unwrap();
        assert_eq!(kind, CommandKind::DeepScan(DeepScanParams { duration: 2 }));
        assert_eq!(kind.params().get("duration"), Some(&json!(2)));
    }

    #[test]
    fn ota_requires_url_and_version() {
        let err = CommandKind::parse("ota_update", params(json!({"url": "", "version": "1.2"})))
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload { .. }));

        let ok = CommandKind::parse(
            "ota_update",
            params(json!({"url": "http://fw/probe.bin", "version": "1.2"})),
        )
        .unwrap();
        assert_eq!(ok.type_name(), "ota_update");
    }

    #[test]
    fn unknown_types_pass_through() {
        let kind = CommandKind::parse("blink_led", params(json!({"times": 3}))).unwrap();
        assert_eq!(kind.type_name(), "blink_led");
        assert_eq!(kind.params().get("times"), Some(&json!(3)));
        assert!(kind.requires_verification());
        assert!(!CommandKind::Ping.requires_verification());
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Sent));
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Failed));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Completed));
        assert!(!CommandStatus::Completed.can_transition_to(CommandStatus::Failed));
        assert!(!CommandStatus::Failed.can_transition_to(CommandStatus::Sent));
    }

    #[test]
    fn result_outcome_mapping() {
        let mut msg = CommandResultMessage {
            device: "p1".into(),
            command_type: "restart".into(),
            status: "success".into(),
            command_id: None,
            result: Params::new(),
        };
        assert_eq!(msg.outcome(), ResultOutcome::Completed);

        msg.result.insert("success".into(), json!(false));
        assert_eq!(msg.outcome(), ResultOutcome::Failed);

        msg.result.clear();
        msg.status = "in_progress".into();
        assert_eq!(msg.outcome(), ResultOutcome::InProgress);
    }

    #[test]
    fn wire_message_uses_flat_type_key() {
        let msg = CommandMessage {
            command_type: "ping".into(),
            correlation_id: "abc".into(),
            params: Params::new(),
            timestamp: 1_700_000_000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["correlation_id"], "abc");
    }
}
