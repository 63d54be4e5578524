use super::error::{Result, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User fields of a profile.
pub type ProfileData = Map<String, Value>;

/// Session lock embedded in a record's metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionLockRecord {
    /// Opaque token generated at acquisition.
    pub owner_token: String,
    /// Human-readable name of the holder process (diagnostics only).
    #[serde(default)]
    pub holder: String,
    /// Last renewal time, as observed by the remote service.
    pub renewed_at: DateTime<Utc>,
}

impl SessionLockRecord {
    pub fn new(
        owner_token: impl Into<String>,
        holder: impl Into<String>,
        renewed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_token: owner_token.into(),
            holder: holder.into(),
            renewed_at,
        }
    }

    /// A lock is stale once `now - renewed_at` reaches the threshold.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.renewed_at) >= stale_after
    }

    pub fn is_owned_by(&self, token: &str) -> bool {
        self.owner_token == token
    }
}

/// Ancillary fields that reconciliation never touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileMetaData {
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub load_count: u64,
    #[serde(default)]
    pub session: Option<SessionLockRecord>,
    /// Associated user identifiers, kept for compliance deletion.
    #[serde(default)]
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub tags: Map<String, Value>,
    #[serde(default)]
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// The full value stored under one key in the remote service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileRecord {
    #[serde(default)]
    pub data: ProfileData,
    #[serde(default)]
    pub meta: ProfileMetaData,
}

impl ProfileRecord {
    /// Builds a brand-new record whose data is a deep copy of the template.
    pub fn from_template(template: &ProfileData, now: DateTime<Utc>) -> Self {
        Self {
            data: template.clone(),
            meta: ProfileMetaData {
                created_at: Some(now),
                ..ProfileMetaData::default()
            },
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(StoreError::Serialization(format!(
                "profile record must be a JSON object, got {}",
                json_type_name(value)
            )));
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn session(&self) -> Option<&SessionLockRecord> {
        self.meta.session.as_ref()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stale_threshold_is_inclusive() {
        let renewed = Utc::now();
        let lock = SessionLockRecord::new("t1", "host", renewed);
        let stale_after = Duration::seconds(90);

        assert!(!lock.is_stale(renewed + Duration::seconds(89), stale_after));
        assert!(lock.is_stale(renewed + Duration::seconds(90), stale_after));
    }

    #[test]
    fn legacy_record_without_meta_deserializes() {
        let record = ProfileRecord::from_value(&json!({"data": {"coins": 5}})).unwrap();
        assert_eq!(record.data.get("coins"), Some(&json!(5)));
        assert!(record.meta.session.is_none());
        assert_eq!(record.meta.load_count, 0);
    }

    #[test]
    fn non_object_record_is_rejected() {
        let err = ProfileRecord::from_value(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
