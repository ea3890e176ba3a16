//! Record normalization and emission

use crate::error::{IngestError, Result};
use crate::object_types::ObjectTypeSpec;
use crate::pagination::RawRecord;
use crate::schema::schema_for;
use crate::sink::{Envelope, RecordSink};
use chrono::{DateTime, Utc};
use halcyon_common::time::parse_timestamp;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

const TENANT_KEYS: &[&str] = &["tenantId", "tenant_id"];
const SUBTENANT_KEYS: &[&str] = &["subTenantId", "subtenantId", "subtenant_id", "sub_tenant_id"];

/// A vendor record mapped onto its canonical shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub sourcetype: String,
    pub source: String,
    /// Event time; collection time when the record carries none
    pub time: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub subtenant_id: Option<String>,
    pub record_id: Option<String>,
    pub fields: Map<String, Value>,
}

impl NormalizedRecord {
    /// Event body: canonical fields plus collection metadata.
    pub fn to_event(&self) -> Value {
        let mut event = self.fields.clone();
        event.insert(
            "collected_at".into(),
            Value::String(self.collected_at.to_rfc3339()),
        );
        if let Some(ref tenant) = self.tenant_id {
            event.insert("tenant_id".into(), Value::String(tenant.clone()));
        }
        if let Some(ref subtenant) = self.subtenant_id {
            event.insert("subtenant_id".into(), Value::String(subtenant.clone()));
        }
        Value::Object(event)
    }

    pub fn into_envelope(self, index: &str) -> Envelope {
        Envelope {
            time: epoch_seconds(self.time),
            index: index.to_string(),
            event: self.to_event(),
            sourcetype: self.sourcetype,
            source: self.source,
        }
    }
}

/// Epoch seconds with sub-second precision.
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_micros()) / 1_000_000.0
}

pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First id-hint field holding a string or number.
pub fn record_id(raw: &RawRecord, id_fields: &[&str]) -> Option<String> {
    id_fields
        .iter()
        .find_map(|k| raw.get(*k).and_then(scalar_string))
}

/// First time-hint field that parses as a timestamp.
pub fn record_time(raw: &RawRecord, time_fields: &[&str]) -> Option<DateTime<Utc>> {
    time_fields
        .iter()
        .find_map(|k| raw.get(*k).and_then(parse_timestamp))
}

fn context_id(raw: &RawRecord, flat: &[&str], nested: &str) -> Option<String> {
    flat.iter()
        .find_map(|k| raw.get(*k).and_then(scalar_string))
        .or_else(|| {
            raw.get(nested)
                .and_then(|t| t.get("id"))
                .and_then(scalar_string)
        })
}

/// Map `raw` onto the canonical record for `spec`.
///
/// Fails when the record does not satisfy its sourcetype schema; the caller
/// skips and counts such records.
pub fn normalize(
    spec: &ObjectTypeSpec,
    raw: RawRecord,
    collected_at: DateTime<Utc>,
) -> Result<NormalizedRecord> {
    let record_id = record_id(&raw, spec.id_fields);
    let time = record_time(&raw, spec.time_fields).unwrap_or(collected_at);

    let mut tenant_id = context_id(&raw, TENANT_KEYS, "tenant");
    let mut subtenant_id = context_id(&raw, SUBTENANT_KEYS, "subtenant");
    match spec.sourcetype {
        "halcyon:tenant" => tenant_id = tenant_id.or_else(|| record_id.clone()),
        "halcyon:subtenant" => subtenant_id = subtenant_id.or_else(|| record_id.clone()),
        _ => {},
    }

    let fields = schema_for(spec.sourcetype)
        .apply(raw, spec.unknown_fields)
        .map_err(|violation| IngestError::normalization(&spec.name, violation.to_string()))?;

    Ok(NormalizedRecord {
        sourcetype: spec.sourcetype.to_string(),
        source: spec.source(),
        time,
        collected_at,
        tenant_id,
        subtenant_id,
        record_id,
        fields,
    })
}

/// Writes normalized records and collector events to the configured sink.
#[derive(Clone)]
pub struct RecordEmitter {
    sink: Arc<dyn RecordSink>,
    index: String,
}

impl RecordEmitter {
    pub fn new(sink: Arc<dyn RecordSink>, index: impl Into<String>) -> Self {
        Self {
            sink,
            index: index.into(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Write a batch and flush it, so that a later checkpoint commit never
    /// refers to buffered output.
    pub async fn emit_batch(&self, records: Vec<NormalizedRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let envelopes = records
            .into_iter()
            .map(|r| r.into_envelope(&self.index))
            .collect();
        self.sink.write(envelopes).await?;
        self.sink.flush().await
    }

    /// Write an internal event (status, error) that is not an API record.
    pub async fn emit_internal(
        &self,
        sourcetype: &str,
        source: &str,
        time: DateTime<Utc>,
        event: Value,
    ) -> Result<()> {
        self.sink
            .write(vec![Envelope {
                time: epoch_seconds(time),
                index: self.index.clone(),
                sourcetype: sourcetype.to_string(),
                source: source.to_string(),
                event,
            }])
            .await?;
        self.sink.flush().await
    }
}
