/// Topic layout for one probe namespace (default `campus/probes`).
#[derive(Debug, Clone)]
pub struct Topics {
    namespace: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("campus/probes")
    }
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn telemetry(&self) -> String {
        format!("{}/telemetry", self.namespace)
    }

    pub fn offline_telemetry(&self) -> String {
        format!("{}/telemetry/offline", self.namespace)
    }

    pub fn command(&self, device_id: &str) -> String {
        format!("{}/{}/cmd", self.namespace, device_id)
    }

    pub fn result(&self, device_id: &str) -> String {
        format!("{}/{}/result", self.namespace, device_id)
    }

    pub fn results_pattern(&self) -> String {
        format!("{}/+/result", self.namespace)
    }

    pub fn broadcast_command(&self) -> String {
        format!("{}/broadcast/cmd", self.namespace)
    }

    pub fn status(&self, device_id: &str) -> String {
        format!("{}/{}/status", self.namespace, device_id)
    }

    pub fn status_pattern(&self) -> String {
        format!("{}/+/status", self.namespace)
    }

    pub fn config(&self, device_id: &str) -> String {
        format!("{}/{}/config", self.namespace, device_id)
    }

    pub fn config_pattern(&self) -> String {
        format!("{}/+/config", self.namespace)
    }

    pub fn alerts(&self) -> String {
        format!("{}/alerts", self.namespace)
    }

    /// Device key embedded as the first level below the namespace.
    pub fn device_segment<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.namespace.as_str())?.strip_prefix('/')?;
        let (device, _) = rest.split_once('/')?;
        if device.is_empty() {
            None
        } else {
            Some(device)
        }
    }
}

/// MQTT filter matching: `+` matches exactly one level, a trailing `#` matches
/// the parent level and everything below it.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut filter = pattern.split('/');
    let mut levels = topic.split('/');

    loop {
        match (filter.next(), levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
