use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::error::ConfigError;
use crate::message::{CloudEventMetadata, ProducerRecord};

const SPEC_VERSION: &str = "1.0";
const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudEventsMode {
    Binary,
    Structured,
}

impl FromStr for CloudEventsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(CloudEventsMode::Binary),
            "structured" => Ok(CloudEventsMode::Structured),
            other => Err(ConfigError::InvalidCloudEventsMode(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CloudEventsConfig {
    pub mode: CloudEventsMode,
    pub default_type: Option<String>,
    pub default_source: Option<String>,
}

/// Encodes a message as a CloudEvent. Applicability and encoding are
/// kept as free functions rather than an owned struct: there's no per-call
/// state to hold, and `KafkaSink`/`Emitter` both need the same two
/// operations over data they already own.
pub struct CloudEventCodec;

impl CloudEventCodec {
    pub fn applies(config: &CloudEventsConfig, ce: Option<&CloudEventMetadata>) -> bool {
        ce.is_some() || (config.default_type.is_some() && config.default_source.is_some())
    }

    pub fn encode(
        config: &CloudEventsConfig,
        ce: Option<&CloudEventMetadata>,
        mut record: ProducerRecord,
        value_serializer_is_string: bool,
    ) -> Result<ProducerRecord, ConfigError> {
        let attrs = Self::resolve_attributes(config, ce)?;

        if let Some(key) = &attrs.partitionkey {
            if record.key.is_none() {
                record.key = Some(key.clone().into_bytes());
            }
        }

        match config.mode {
            CloudEventsMode::Binary => Ok(Self::encode_binary(&attrs, record)),
            CloudEventsMode::Structured => {
                if !value_serializer_is_string {
                    return Err(ConfigError::StructuredRequiresStringSerializer);
                }
                Ok(Self::encode_structured(&attrs, record))
            }
        }
    }

    fn resolve_attributes(
        config: &CloudEventsConfig,
        ce: Option<&CloudEventMetadata>,
    ) -> Result<CloudEventMetadata, ConfigError> {
        if let Some(ce) = ce {
            return Ok(ce.clone());
        }
        match (&config.default_type, &config.default_source) {
            (Some(ty), Some(source)) => Ok(CloudEventMetadata {
                ty: Some(ty.clone()),
                source: Some(source.clone()),
                ..Default::default()
            }),
            _ => Err(ConfigError::MissingCloudEventAttributes),
        }
    }

    fn encode_binary(attrs: &CloudEventMetadata, mut record: ProducerRecord) -> ProducerRecord {
        push_header(&mut record.headers, "ce_specversion", SPEC_VERSION);
        if let Some(v) = &attrs.id {
            push_header(&mut record.headers, "ce_id", v);
        }
        if let Some(v) = &attrs.source {
            push_header(&mut record.headers, "ce_source", v);
        }
        if let Some(v) = &attrs.ty {
            push_header(&mut record.headers, "ce_type", v);
        }
        if let Some(v) = &attrs.subject {
            push_header(&mut record.headers, "ce_subject", v);
        }
        if let Some(v) = &attrs.time {
            push_header(&mut record.headers, "ce_time", v);
        }
        if let Some(v) = &attrs.dataschema {
            push_header(&mut record.headers, "ce_dataschema", v);
        }
        if let Some(v) = &attrs.datacontenttype {
            push_header(&mut record.headers, "ce_datacontenttype", v);
        }
        for (name, value) in &attrs.extensions {
            push_header(&mut record.headers, &format!("ce_{name}"), value);
        }
        record
    }

    fn encode_structured(attrs: &CloudEventMetadata, mut record: ProducerRecord) -> ProducerRecord {
        let mut obj = Map::new();
        obj.insert("specversion".into(), json!(SPEC_VERSION));
        insert_opt(&mut obj, "id", &attrs.id);
        insert_opt(&mut obj, "source", &attrs.source);
        insert_opt(&mut obj, "type", &attrs.ty);
        insert_opt(&mut obj, "subject", &attrs.subject);
        insert_opt(&mut obj, "time", &attrs.time);
        insert_opt(&mut obj, "dataschema", &attrs.dataschema);
        insert_opt(&mut obj, "datacontenttype", &attrs.datacontenttype);
        for (name, value) in &attrs.extensions {
            obj.insert(name.clone(), json!(value));
        }
        obj.insert(
            "data".into(),
            Value::String(String::from_utf8_lossy(&record.payload).into_owned()),
        );

        record.payload = serde_json::to_vec(&Value::Object(obj)).expect("json object always serializes");
        record.headers.retain(|(name, _)| name != "content-type");
        record
            .headers
            .push(("content-type".into(), STRUCTURED_CONTENT_TYPE.into()));
        record
    }
}

fn insert_opt(obj: &mut Map<String, Value>, name: &str, value: &Option<String>) {
    if let Some(v) = value {
        obj.insert(name.into(), json!(v));
    }
}

fn push_header(headers: &mut Vec<(String, Vec<u8>)>, name: &str, value: &str) {
    headers.retain(|(n, _)| n != name);
    headers.push((name.to_string(), value.as_bytes().to_vec()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> ProducerRecord {
        ProducerRecord {
            topic: "t".into(),
            partition: None,
            timestamp: None,
            key: None,
            payload: vec![0x01, 0x02],
            headers: vec![],
        }
    }

    #[test]
    fn binary_encoding_sets_partitionkey_and_ce_headers() {
        let config = CloudEventsConfig {
            mode: CloudEventsMode::Binary,
            default_type: None,
            default_source: None,
        };
        let ce = CloudEventMetadata {
            id: Some("1".into()),
            source: Some("/a".into()),
            ty: Some("x".into()),
            partitionkey: Some("p".into()),
            ..Default::default()
        };

        let record = CloudEventCodec::encode(&config, Some(&ce), base_record(), false).unwrap();

        assert_eq!(record.key, Some(b"p".to_vec()));
        assert_eq!(record.payload, vec![0x01, 0x02]);
        assert!(record
            .headers
            .contains(&("ce_id".to_string(), b"1".to_vec())));
        assert!(record
            .headers
            .contains(&("ce_source".to_string(), b"/a".to_vec())));
        assert!(record
            .headers
            .contains(&("ce_type".to_string(), b"x".to_vec())));
    }

    #[test]
    fn structured_mode_requires_string_serializer() {
        let config = CloudEventsConfig {
            mode: CloudEventsMode::Structured,
            default_type: Some("x".into()),
            default_source: Some("/a".into()),
        };
        let err = CloudEventCodec::encode(&config, None, base_record(), false).unwrap_err();
        assert!(matches!(err, ConfigError::StructuredRequiresStringSerializer));
    }

    #[test]
    fn missing_attributes_and_metadata_is_a_config_error() {
        let config = CloudEventsConfig {
            mode: CloudEventsMode::Binary,
            default_type: None,
            default_source: None,
        };
        assert!(!CloudEventCodec::applies(&config, None));
        let err = CloudEventCodec::encode(&config, None, base_record(), true).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCloudEventAttributes));
    }

    #[test]
    fn structured_mode_wraps_payload_as_json() {
        let config = CloudEventsConfig {
            mode: CloudEventsMode::Structured,
            default_type: Some("x".into()),
            default_source: Some("/a".into()),
        };
        let record = CloudEventCodec::encode(&config, None, base_record(), true).unwrap();
        let value: Value = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(value["specversion"], "1.0");
        assert_eq!(value["type"], "x");
        assert!(record
            .headers
            .contains(&("content-type".to_string(), STRUCTURED_CONTENT_TYPE.as_bytes().to_vec())));
    }
}
