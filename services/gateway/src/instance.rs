//! Inbound instance events and the identity rules they must satisfy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest identity component accepted (keeps `{instanceId}.dcm` within filename limits).
pub const MAX_IDENTITY_LEN: usize = 128;

/// Errors raised when an incoming instance lacks usable identity fields
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// Status returned to the association layer for each received instance.
///
/// The numeric values are the DICOM C-STORE status words the association layer
/// puts into its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Instance durably stored (or already present)
    Success,
    /// Identity fields missing or unusable; nothing was written
    MalformedRequest,
    /// Storage or internal failure local to this instance
    ProcessingFailure,
    /// Gateway is shutting down and no longer accepts instances
    Refused,
}

impl AckCode {
    pub fn status(&self) -> u16 {
        match self {
            AckCode::Success => 0x0000,
            AckCode::MalformedRequest => 0xC000,
            AckCode::ProcessingFailure => 0xC001,
            AckCode::Refused => 0xA700,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AckCode::Success)
    }
}

/// An instance as decoded by the association layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReceived {
    #[serde(default)]
    pub study_id: String,
    #[serde(default)]
    pub series_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub modality: String,
    /// Number of instances the sender says the study contains
    #[serde(default)]
    pub expected_instance_count: Option<u32>,
    #[serde(with = "base64_serde", default)]
    pub payload: Vec<u8>,
}

/// Base64 encoding for payloads carried inside JSON events
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// The (study, series, instance) triple that addresses one stored instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub study_id: String,
    pub series_id: String,
    pub instance_id: String,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.study_id, self.series_id, self.instance_id)
    }
}

/// Identity of an instance within its study
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesInstance {
    pub series_id: String,
    pub instance_id: String,
}

/// A validated instance ready to be stored.
#[derive(Debug, Clone)]
pub struct Instance {
    pub key: InstanceKey,
    pub patient_id: String,
    pub modality: String,
    pub expected_instance_count: Option<u32>,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Instance {
    pub fn study_id(&self) -> &str {
        &self.key.study_id
    }
}

impl InstanceReceived {
    /// Check identity fields and stamp the receive time.
    ///
    /// A declared count of zero carries no information and is dropped.
    pub fn into_instance(self, received_at: DateTime<Utc>) -> Result<Instance, MetadataError> {
        validate_component("study_id", &self.study_id)?;
        validate_component("series_id", &self.series_id)?;
        validate_component("instance_id", &self.instance_id)?;

        Ok(Instance {
            key: InstanceKey {
                study_id: self.study_id,
                series_id: self.series_id,
                instance_id: self.instance_id,
            },
            patient_id: self.patient_id,
            modality: self.modality,
            expected_instance_count: self.expected_instance_count.filter(|n| *n > 0),
            payload: self.payload,
            received_at,
        })
    }
}

/// Identity components double as path segments, so they must be plain names.
pub fn validate_component(field: &'static str, value: &str) -> Result<(), MetadataError> {
    if value.trim().is_empty() {
        return Err(MetadataError::MissingField(field));
    }
    if value.len() > MAX_IDENTITY_LEN {
        return Err(MetadataError::InvalidField {
            field,
            message: format!("longer than {} bytes", MAX_IDENTITY_LEN),
        });
    }
    if value.starts_with('.') {
        return Err(MetadataError::InvalidField {
            field,
            message: "must not start with '.'".to_string(),
        });
    }
    if value.chars().any(|c| matches!(c, '/' | '\\' | '\0')) {
        return Err(MetadataError::InvalidField {
            field,
            message: "contains a path separator or NUL".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> InstanceReceived {
        InstanceReceived {
            study_id: "1.2.840.1".to_string(),
            series_id: "1.2.840.1.1".to_string(),
            instance_id: "1.2.840.1.1.1".to_string(),
            patient_id: "PAT-001".to_string(),
            modality: "CT".to_string(),
            expected_instance_count: Some(3),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_valid_event_converts() {
        let instance = event().into_instance(Utc::now()).unwrap();
        assert_eq!(instance.study_id(), "1.2.840.1");
        assert_eq!(instance.expected_instance_count, Some(3));
        assert_eq!(instance.key.to_string(), "1.2.840.1/1.2.840.1.1/1.2.840.1.1.1");
    }

    #[test]
    fn test_missing_identity_rejected() {
        let mut e = event();
        e.series_id = String::new();
        assert_eq!(
            e.into_instance(Utc::now()).unwrap_err(),
            MetadataError::MissingField("series_id")
        );
    }

    #[test]
    fn test_path_like_identity_rejected() {
        for bad in ["..", ".hidden", "a/b", "a\\b"] {
            let mut e = event();
            e.instance_id = bad.to_string();
            assert!(matches!(
                e.into_instance(Utc::now()),
                Err(MetadataError::InvalidField { field: "instance_id", .. })
            ));
        }
    }

    #[test]
    fn test_zero_expected_count_is_undeclared() {
        let mut e = event();
        e.expected_instance_count = Some(0);
        let instance = e.into_instance(Utc::now()).unwrap();
        assert_eq!(instance.expected_instance_count, None);
    }

    #[test]
    fn test_deserialize_json_event() {
        let json = r#"{
            "studyId": "S1",
            "seriesId": "A",
            "instanceId": "i1",
            "patientId": "P1",
            "modality": "MR",
            "expectedInstanceCount": 3,
            "payload": "SGVsbG8="
        }"#;

        let e: InstanceReceived = serde_json::from_str(json).unwrap();
        assert_eq!(e.study_id, "S1");
        assert_eq!(e.expected_instance_count, Some(3));
        assert_eq!(e.payload, b"Hello");
    }

    #[test]
    fn test_ack_status_words() {
        assert_eq!(AckCode::Success.status(), 0x0000);
        assert_eq!(AckCode::ProcessingFailure.status(), 0xC001);
        assert!(!AckCode::MalformedRequest.is_success());
    }
}
