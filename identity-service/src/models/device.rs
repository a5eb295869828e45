//! Remembered device model - durable second-factor bypass records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// A device fingerprint allowed to skip the second-factor prompt.
/// `(user_id, fingerprint)` is unique.
#[derive(Debug, Clone)]
pub struct RememberedDevice {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub fingerprint: String,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub last_used_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl RememberedDevice {
    pub fn new(
        user_id: Uuid,
        fingerprint: String,
        device_name: Option<String>,
        ip_address: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            device_id: Uuid::new_v4(),
            user_id,
            fingerprint,
            device_name,
            ip_address,
            last_used_utc: now,
            created_utc: now,
        }
    }
}

/// Device info for API responses. The fingerprint is not echoed back.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: Uuid,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub last_used_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl From<RememberedDevice> for DeviceInfo {
    fn from(d: RememberedDevice) -> Self {
        Self {
            device_id: d.device_id,
            device_name: d.device_name,
            ip_address: d.ip_address,
            last_used_utc: d.last_used_utc,
            created_utc: d.created_utc,
        }
    }
}
