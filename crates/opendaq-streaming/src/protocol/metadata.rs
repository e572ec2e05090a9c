// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metadata messages carried in `METADATA` streaming packets.
//!
//! ```text
//! +-------------------+------------------------------------------+
//! | encoding (u32 LE) | MessagePack {"method": .., "params": ..} |
//! +-------------------+------------------------------------------+
//! ```
//!
//! The key names are consumed by existing openDAQ clients and must not
//! change.

use serde_json::{json, Map, Value};

use super::header::metadata_encoding;
use crate::error::{Error, Result};
use crate::signal::{DataDescriptor, DataRule, Ratio, SampleType, Unit};

/// Method names.
pub mod method {
    pub const API_VERSION: &str = "apiVersion";
    pub const INIT: &str = "init";
    pub const AVAILABLE: &str = "available";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SIGNAL: &str = "signal";
}

/// One metadata message.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMessage {
    ApiVersion {
        version: String,
    },
    Init {
        stream_id: String,
        command_interfaces: Value,
    },
    Available {
        signal_ids: Vec<String>,
    },
    Subscribe {
        signal_id: String,
    },
    Unsubscribe {
        signal_id: String,
    },
    /// `signal` params: `{definition, interpretation, tableId, valueIndex?}`.
    Signal(Value),
    /// Any method this runtime does not interpret.
    Other {
        method: String,
        params: Value,
    },
}

impl MetadataMessage {
    pub fn method(&self) -> &str {
        match self {
            MetadataMessage::ApiVersion { .. } => method::API_VERSION,
            MetadataMessage::Init { .. } => method::INIT,
            MetadataMessage::Available { .. } => method::AVAILABLE,
            MetadataMessage::Subscribe { .. } => method::SUBSCRIBE,
            MetadataMessage::Unsubscribe { .. } => method::UNSUBSCRIBE,
            MetadataMessage::Signal(_) => method::SIGNAL,
            MetadataMessage::Other { method, .. } => method,
        }
    }

    /// JSON document `{"method", "params"}`.
    pub fn to_document(&self) -> Value {
        let params = match self {
            MetadataMessage::ApiVersion { version } => json!({ "version": version }),
            MetadataMessage::Init {
                stream_id,
                command_interfaces,
            } => json!({
                "streamId": stream_id,
                "commandInterfaces": command_interfaces,
            }),
            MetadataMessage::Available { signal_ids } => json!({ "signalIds": signal_ids }),
            MetadataMessage::Subscribe { signal_id } | MetadataMessage::Unsubscribe { signal_id } => {
                json!({ "signalId": signal_id })
            }
            MetadataMessage::Signal(params) => params.clone(),
            MetadataMessage::Other { params, .. } => params.clone(),
        };
        json!({ "method": self.method(), "params": params })
    }

    /// Inverse of [`MetadataMessage::to_document`].
    pub fn from_document(doc: Value) -> Result<Self> {
        let Value::Object(mut doc) = doc else {
            return Err(Error::Metadata("metadata document is not a map".into()));
        };
        let method = match doc.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(Error::Metadata("metadata without method".into())),
        };
        let params = doc.remove("params").unwrap_or(Value::Null);

        let message = match method.as_str() {
            method::API_VERSION => MetadataMessage::ApiVersion {
                version: required_str(&params, "version")?,
            },
            method::INIT => MetadataMessage::Init {
                stream_id: required_str(&params, "streamId")?,
                command_interfaces: params
                    .get("commandInterfaces")
                    .cloned()
                    .unwrap_or(Value::Null),
            },
            method::AVAILABLE => MetadataMessage::Available {
                signal_ids: string_list(&params, "signalIds")?,
            },
            method::SUBSCRIBE => MetadataMessage::Subscribe {
                signal_id: required_str(&params, "signalId")?,
            },
            method::UNSUBSCRIBE => MetadataMessage::Unsubscribe {
                signal_id: required_str(&params, "signalId")?,
            },
            method::SIGNAL => MetadataMessage::Signal(params),
            _ => MetadataMessage::Other { method, params },
        };
        Ok(message)
    }

    /// Encoding prefix followed by the MessagePack document.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = metadata_encoding::MSGPACK.to_le_bytes().to_vec();
        rmp_serde::encode::write(&mut payload, &self.to_document())?;
        Ok(payload)
    }

    /// Decode a metadata payload (encoding prefix included).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::Metadata(format!(
                "metadata payload too short: {} bytes",
                payload.len()
            )));
        }
        let encoding = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if encoding != metadata_encoding::MSGPACK {
            return Err(Error::Metadata(format!(
                "unsupported metadata encoding {}",
                encoding
            )));
        }
        let doc: Value = rmp_serde::from_slice(&payload[4..])?;
        Self::from_document(doc)
    }
}

fn required_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Metadata(format!("missing string field '{}'", key)))
}

fn string_list(params: &Value, key: &str) -> Result<Vec<String>> {
    let list = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Metadata(format!("missing list field '{}'", key)))?;
    Ok(list
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

/// Identity of the signal a `signal` message describes.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo<'a> {
    pub name: &'a str,
    pub description: &'a str,
    /// Domain signal id, or the signal's own id when it has no domain.
    pub table_id: &'a str,
    pub has_domain: bool,
}

/// Build the `signal` params for a descriptor.
pub fn signal_params(descriptor: &DataDescriptor, info: SignalInfo<'_>) -> Result<Value> {
    let mut params = Map::new();
    params.insert("definition".into(), definition(descriptor)?);
    params.insert("interpretation".into(), interpretation(descriptor, info));
    params.insert("tableId".into(), Value::from(info.table_id));
    if info.has_domain {
        params.insert("valueIndex".into(), Value::from(0));
    }
    Ok(Value::Object(params))
}

fn unit_value(unit: &Unit) -> Value {
    json!({
        "unitId": unit.id,
        "displayName": unit.symbol,
        "name": unit.name,
        "quantity": unit.quantity,
    })
}

/// `definition` object of a descriptor; struct fields recurse.
pub fn definition(descriptor: &DataDescriptor) -> Result<Value> {
    let data_type = descriptor
        .sample_type
        .wire_name()
        .ok_or_else(|| Error::UnsupportedSampleType(format!("{:?}", descriptor.sample_type)))?;

    let mut def = Map::new();
    def.insert("name".into(), Value::from(descriptor.name.as_str()));
    def.insert("dataType".into(), Value::from(data_type));

    match &descriptor.rule {
        DataRule::Explicit | DataRule::Constant => {
            def.insert("rule".into(), Value::from(descriptor.rule.wire_name()));
        }
        DataRule::Linear { delta, start } => {
            def.insert("rule".into(), Value::from("linear"));
            def.insert("linear".into(), json!({ "delta": delta, "start": start }));
        }
        DataRule::Other(name) => {
            return Err(Error::Metadata(format!("unsupported rule '{}'", name)));
        }
    }

    if descriptor.sample_type == SampleType::Struct {
        let fields = descriptor
            .struct_fields
            .iter()
            .map(definition)
            .collect::<Result<Vec<_>>>()?;
        def.insert("struct".into(), Value::Array(fields));
    }
    if !descriptor.dimensions.is_empty() {
        let dims = descriptor
            .dimensions
            .iter()
            .map(|d| json!({ "name": d.name, "size": d.size }))
            .collect();
        def.insert("dimensions".into(), Value::Array(dims));
    }
    if let Some(unit) = &descriptor.unit {
        def.insert("unit".into(), unit_value(unit));
    }
    if let Some(range) = &descriptor.value_range {
        def.insert("range".into(), json!({ "low": range.low, "high": range.high }));
    }
    if let Some(res) = &descriptor.tick_resolution {
        def.insert("resolution".into(), json!({ "num": res.num, "denom": res.den }));
    }
    if let Some(origin) = &descriptor.origin {
        def.insert("absoluteReference".into(), Value::from(origin.as_str()));
    }
    Ok(Value::Object(def))
}

fn interpretation(descriptor: &DataDescriptor, info: SignalInfo<'_>) -> Value {
    let mut interp = Map::new();
    interp.insert("desc_name".into(), Value::from(descriptor.name.as_str()));
    interp.insert("sig_name".into(), Value::from(info.name));
    interp.insert("sig_desc".into(), Value::from(info.description));
    if let Some(origin) = &descriptor.origin {
        interp.insert("origin".into(), Value::from(origin.as_str()));
    }
    if let Some(unit) = &descriptor.unit {
        interp.insert("unit".into(), unit_value(unit));
    }
    if let Some(range) = &descriptor.value_range {
        interp.insert("range".into(), json!({ "low": range.low, "high": range.high }));
    }
    Value::Object(interp)
}

/// Client-side view of a received `signal` message.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMetadata {
    pub descriptor: DataDescriptor,
    pub table_id: String,
    pub value_index: Option<u64>,
    pub signal_name: String,
    pub signal_description: String,
}

impl SignalMetadata {
    pub fn from_params(params: &Value) -> Result<Self> {
        let def = params
            .get("definition")
            .ok_or_else(|| Error::Metadata("signal without definition".into()))?;
        let interp = params.get("interpretation");
        let interp_str = |key: &str| {
            interp
                .and_then(|i| i.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self {
            descriptor: descriptor_from_definition(def)?,
            table_id: required_str(params, "tableId")?,
            value_index: params.get("valueIndex").and_then(Value::as_u64),
            signal_name: interp_str("sig_name"),
            signal_description: interp_str("sig_desc"),
        })
    }

    /// Whether the described signal is a domain (linear) signal.
    pub fn is_linear(&self) -> bool {
        self.descriptor.rule.is_linear()
    }
}

/// Rebuild a descriptor from a `definition` object.
pub fn descriptor_from_definition(def: &Value) -> Result<DataDescriptor> {
    let data_type = def
        .get("dataType")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Metadata("definition without dataType".into()))?;
    let sample_type = SampleType::from_wire_name(data_type)
        .ok_or_else(|| Error::UnsupportedSampleType(data_type.to_string()))?;

    let rule = match def.get("rule").and_then(Value::as_str) {
        Some("explicit") | None => DataRule::Explicit,
        Some("constant") => DataRule::Constant,
        Some("linear") => {
            let linear = def.get("linear");
            let field = |key: &str| linear.and_then(|l| l.get(key)).and_then(Value::as_i64);
            DataRule::Linear {
                delta: field("delta")
                    .ok_or_else(|| Error::Metadata("linear rule without delta".into()))?,
                start: field("start").unwrap_or(0),
            }
        }
        Some(other) => DataRule::Other(other.to_string()),
    };

    let mut descriptor = DataDescriptor::new(sample_type).with_rule(rule);
    if let Some(name) = def.get("name").and_then(Value::as_str) {
        descriptor.name = name.to_string();
    }
    if let Some(fields) = def.get("struct").and_then(Value::as_array) {
        descriptor.struct_fields = fields
            .iter()
            .map(descriptor_from_definition)
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(dims) = def.get("dimensions").and_then(Value::as_array) {
        for dim in dims {
            let name = dim.get("name").and_then(Value::as_str).unwrap_or_default();
            let size = dim.get("size").and_then(Value::as_u64).unwrap_or(0);
            descriptor = descriptor.with_dimension(name, size as usize);
        }
    }
    if let Some(unit) = def.get("unit") {
        let text = |key: &str| {
            unit.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        descriptor.unit = Some(Unit {
            id: unit.get("unitId").and_then(Value::as_i64).unwrap_or(-1) as i32,
            symbol: text("displayName"),
            name: text("name"),
            quantity: text("quantity"),
        });
    }
    if let Some(range) = def.get("range") {
        let low = range.get("low").and_then(Value::as_f64).unwrap_or(0.0);
        let high = range.get("high").and_then(Value::as_f64).unwrap_or(0.0);
        descriptor = descriptor.with_range(low, high);
    }
    if let Some(res) = def.get("resolution") {
        let num = res.get("num").and_then(Value::as_i64).unwrap_or(1);
        let den = res.get("denom").and_then(Value::as_i64).unwrap_or(1);
        descriptor.tick_resolution = Some(Ratio::new(num, den));
    }
    if let Some(origin) = def.get("absoluteReference").and_then(Value::as_str) {
        descriptor.origin = Some(origin.to_string());
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_descriptor() -> DataDescriptor {
        DataDescriptor::new(SampleType::Float32)
            .with_name("Voltage")
            .with_unit(Unit::new("V"))
            .with_range(-10.0, 10.0)
    }

    #[test]
    fn test_connection_messages_roundtrip() {
        let messages = vec![
            MetadataMessage::ApiVersion {
                version: "1.0.0".into(),
            },
            MetadataMessage::Init {
                stream_id: "ab12cd34".into(),
                command_interfaces: json!({"jsonrpc-http": {"port": 7438}}),
            },
            MetadataMessage::Available {
                signal_ids: vec!["/dev/ai0".into(), "/dev/time".into()],
            },
            MetadataMessage::Subscribe {
                signal_id: "/dev/ai0".into(),
            },
            MetadataMessage::Unsubscribe {
                signal_id: "/dev/ai0".into(),
            },
        ];
        for message in messages {
            let payload = message.encode().unwrap();
            assert_eq!(&payload[..4], &2u32.to_le_bytes());
            assert_eq!(MetadataMessage::decode(&payload).unwrap(), message);
        }
    }

    #[test]
    fn test_document_key_names() {
        let doc = MetadataMessage::Available {
            signal_ids: vec!["a".into()],
        }
        .to_document();
        assert_eq!(doc["method"], "available");
        assert_eq!(doc["params"]["signalIds"][0], "a");
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let mut payload = MetadataMessage::ApiVersion {
            version: "1".into(),
        }
        .encode()
        .unwrap();
        payload[0] = 7;
        assert!(matches!(
            MetadataMessage::decode(&payload),
            Err(Error::Metadata(_))
        ));
        assert!(MetadataMessage::decode(&[2, 0]).is_err());
    }

    #[test]
    fn test_signal_params_for_value_signal() {
        let info = SignalInfo {
            name: "AI0",
            description: "Analog input",
            table_id: "/dev/time",
            has_domain: true,
        };
        let params = signal_params(&value_descriptor(), info).unwrap();
        assert_eq!(params["definition"]["dataType"], "real32");
        assert_eq!(params["definition"]["rule"], "explicit");
        assert_eq!(params["definition"]["unit"]["displayName"], "V");
        assert_eq!(params["interpretation"]["sig_name"], "AI0");
        assert_eq!(params["interpretation"]["desc_name"], "Voltage");
        assert_eq!(params["tableId"], "/dev/time");
        assert_eq!(params["valueIndex"], 0);
    }

    #[test]
    fn test_signal_params_for_domain_signal() {
        let time = DataDescriptor::linear_time(100, 1_000_000, "1970-01-01T00:00:00Z");
        let info = SignalInfo {
            name: "Time",
            description: "",
            table_id: "/dev/time",
            has_domain: false,
        };
        let params = signal_params(&time, info).unwrap();
        assert_eq!(params["definition"]["rule"], "linear");
        assert_eq!(params["definition"]["linear"]["delta"], 100);
        assert_eq!(params["definition"]["resolution"]["denom"], 1_000_000);
        assert!(params.get("valueIndex").is_none());
    }

    #[test]
    fn test_unsupported_types_are_errors() {
        let info = SignalInfo {
            name: "",
            description: "",
            table_id: "x",
            has_domain: false,
        };
        let binary = DataDescriptor::new(SampleType::Binary);
        assert!(matches!(
            signal_params(&binary, info),
            Err(Error::UnsupportedSampleType(_))
        ));
        let other = DataDescriptor::new(SampleType::Int32).with_rule(DataRule::Other("log".into()));
        assert!(signal_params(&other, info).is_err());
    }

    #[test]
    fn test_signal_metadata_parses_back() {
        let descriptor = value_descriptor()
            .with_dimension("ch", 4)
            .with_origin("1970-01-01T00:00:00Z");
        let info = SignalInfo {
            name: "AI0",
            description: "",
            table_id: "/dev/time",
            has_domain: true,
        };
        let message = MetadataMessage::Signal(signal_params(&descriptor, info).unwrap());
        let decoded = MetadataMessage::decode(&message.encode().unwrap()).unwrap();
        let MetadataMessage::Signal(params) = decoded else {
            panic!("expected signal message");
        };
        let meta = SignalMetadata::from_params(&params).unwrap();
        assert_eq!(meta.descriptor, descriptor);
        assert_eq!(meta.table_id, "/dev/time");
        assert_eq!(meta.value_index, Some(0));
        assert_eq!(meta.signal_name, "AI0");
    }

    #[test]
    fn test_struct_definition() {
        let descriptor = DataDescriptor::new(SampleType::Undefined)
            .with_name("Pair")
            .with_struct_fields(vec![
                DataDescriptor::new(SampleType::Int32).with_name("a"),
                DataDescriptor::new(SampleType::Float64).with_name("b"),
            ]);
        let def = definition(&descriptor).unwrap();
        assert_eq!(def["dataType"], "struct");
        assert_eq!(def["struct"][1]["dataType"], "real64");
        assert_eq!(descriptor_from_definition(&def).unwrap(), descriptor);
    }
}
