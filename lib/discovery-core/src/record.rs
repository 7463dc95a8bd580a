//! Service records and the heartbeat payload that produces them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// One tracked backend instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub service_id: String,
    /// Logical route, stored normalized once registered
    pub path: String,
    pub ip: String,
    pub port: String,
    pub last_heartbeat: DateTime<Utc>,
    pub is_healthy: bool,
    /// Selections served in the current weighted cycle
    #[serde(skip)]
    pub current_use: i64,
    /// Capacity per weighted cycle
    #[serde(default)]
    pub weighted_use: i64,
}

impl ServiceRecord {
    pub fn new(
        service_id: impl Into<String>,
        path: impl Into<String>,
        ip: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            path: path.into(),
            ip: ip.into(),
            port: port.into(),
            last_heartbeat: Utc::now(),
            is_healthy: true,
            current_use: 0,
            weighted_use: 0,
        }
    }

    pub fn with_weight(mut self, weighted_use: i64) -> Self {
        self.weighted_use = weighted_use;
        self
    }

    /// `ip:port` for building upstream URLs
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_weight_full(&self) -> bool {
        self.current_use >= self.weighted_use
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let required = [
            ("serviceId", &self.service_id),
            ("path", &self.path),
            ("ip", &self.ip),
            ("port", &self.port),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::Validation(format!("{} is required", field)));
            }
        }
        Ok(())
    }
}

/// Heartbeat body sent by backend services
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub service_id: String,
    pub path: String,
    pub ip: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted_use: Option<i64>,
}

impl From<HeartbeatMessage> for ServiceRecord {
    fn from(msg: HeartbeatMessage) -> Self {
        ServiceRecord::new(msg.service_id, msg.path, msg.ip, msg.port)
            .with_weight(msg.weighted_use.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_all_fields() {
        let record = ServiceRecord::new("svc-1", "/users", "10.0.0.1", "8080");
        assert!(record.validate().is_ok());

        let missing_ip = ServiceRecord::new("svc-1", "/users", "  ", "8080");
        assert_eq!(
            missing_ip.validate(),
            Err(CoreError::Validation("ip is required".to_string()))
        );

        let missing_id = ServiceRecord::new("", "/users", "10.0.0.1", "8080");
        assert!(missing_id.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let msg: HeartbeatMessage = serde_json::from_str(
            r#"{"serviceId":"svc-1","path":"users/","ip":"10.0.0.1","port":"8080","weightedUse":3}"#,
        )
        .unwrap();
        assert_eq!(msg.weighted_use, Some(3));

        let record = ServiceRecord::from(msg);
        assert_eq!(record.service_id, "svc-1");
        assert_eq!(record.weighted_use, 3);
        assert_eq!(record.current_use, 0);
        assert_eq!(record.address(), "10.0.0.1:8080");
    }

    #[test]
    fn test_current_use_is_not_serialized() {
        let mut record = ServiceRecord::new("svc-1", "/users", "10.0.0.1", "8080");
        record.current_use = 4;
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("currentUse").is_none());
        assert_eq!(json["serviceId"], "svc-1");
        assert_eq!(json["isHealthy"], true);
    }
}
