//! Canonical record shapes
//!
//! One [`RecordSchema`] per sourcetype maps vendor field names onto canonical
//! snake_case fields with a declared [`FieldKind`]. Mapping happens once, at
//! normalization time:
//!
//! - the first present, non-null vendor name wins
//! - values are coerced to the declared kind (numeric strings to numbers,
//!   timestamps to RFC 3339, scalars to strings)
//! - a required field that is missing or cannot be coerced rejects the record
//! - an optional field that cannot be coerced is dropped
//! - vendor fields no rule consumed are kept or dropped per
//!   [`UnknownFieldPolicy`]

use halcyon_common::time::parse_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Expected type of a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// Any parseable time; emitted as RFC 3339 UTC
    Timestamp,
    Object,
    Array,
    Any,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        };
        f.write_str(s)
    }
}

/// What to do with vendor fields that no rule maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    /// Pass through under the vendor's name
    #[default]
    Keep,
    Drop,
}

/// One vendor-to-canonical mapping.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub canonical: &'static str,
    /// Vendor names, tried in order
    pub sources: &'static [&'static str],
    pub kind: FieldKind,
    pub required: bool,
}

const fn opt(canonical: &'static str, sources: &'static [&'static str], kind: FieldKind) -> FieldRule {
    FieldRule { canonical, sources, kind, required: false }
}

const fn req(canonical: &'static str, sources: &'static [&'static str], kind: FieldKind) -> FieldRule {
    FieldRule { canonical, sources, kind, required: true }
}

/// Canonical shape for one sourcetype.
#[derive(Debug)]
pub struct RecordSchema {
    pub sourcetype: &'static str,
    pub fields: &'static [FieldRule],
}

/// Why a record did not fit its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    MissingRequired(&'static str),
    WrongKind {
        field: &'static str,
        expected: FieldKind,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::MissingRequired(field) => {
                write!(f, "required field '{field}' is missing")
            },
            SchemaViolation::WrongKind { field, expected } => {
                write!(f, "field '{field}' is not a valid {expected}")
            },
        }
    }
}

// same precedence as the record id used for dedup
const ID_SOURCES: &[&str] = &["id", "uuid", "alertId", "eventId"];
const ID: FieldRule = req("id", ID_SOURCES, FieldKind::String);
const OPT_ID: FieldRule = opt("id", ID_SOURCES, FieldKind::String);
const NAME: FieldRule = opt("name", &["name", "displayName", "title"], FieldKind::String);
const DESCRIPTION: FieldRule = opt("description", &["description"], FieldKind::String);
const CREATED_AT: FieldRule = opt("created_at", &["createdAt", "created_at", "created"], FieldKind::Timestamp);
const UPDATED_AT: FieldRule = opt("updated_at", &["updatedAt", "updated_at", "modifiedAt"], FieldKind::Timestamp);
const DEVICE_ID: FieldRule = opt("device_id", &["deviceId", "device_id", "assetId"], FieldKind::String);
const SEVERITY: FieldRule = opt("severity", &["severity", "severityLevel"], FieldKind::String);
const STATUS: FieldRule = opt("status", &["status", "state"], FieldKind::String);
const ENABLED: FieldRule = opt("enabled", &["enabled", "isEnabled", "active"], FieldKind::Boolean);
const HOSTNAME: FieldRule = opt("hostname", &["hostname", "hostName", "deviceName"], FieldKind::String);
const EMAIL: FieldRule = opt("email", &["email", "emailAddress", "userPrincipalName"], FieldKind::String);
const ROLE: FieldRule = opt("role", &["role", "roleName"], FieldKind::String);
const POLICY_ID: FieldRule = opt("policy_id", &["policyId", "policy_id"], FieldKind::String);
const SHA256: FieldRule = opt("sha256", &["sha256", "sha256Hash", "hash"], FieldKind::String);
const FILE_PATH: FieldRule = opt("file_path", &["filePath", "path", "fullPath"], FieldKind::String);
const VERSION: FieldRule = opt("version", &["version", "agentVersion"], FieldKind::String);
const TAGS: FieldRule = opt("tags", &["tags", "labels"], FieldKind::Array);

static SCHEMAS: &[RecordSchema] = &[
    RecordSchema {
        sourcetype: "halcyon:alert",
        fields: &[
            ID,
            opt("title", &["title", "name", "alertName"], FieldKind::String),
            SEVERITY,
            STATUS,
            opt("category", &["category", "type", "alertType"], FieldKind::String),
            DEVICE_ID,
            HOSTNAME,
            opt("threat_id", &["threatId", "threat_id"], FieldKind::String),
            opt("instance_count", &["instanceCount", "count"], FieldKind::Integer),
            opt("first_seen", &["firstSeen", "firstOccurrence"], FieldKind::Timestamp),
            opt("last_seen", &["lastSeen", "lastOccurrence"], FieldKind::Timestamp),
            CREATED_AT,
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:alert_instance",
        fields: &[
            ID,
            opt("alert_id", &["alertId", "alert_id"], FieldKind::String),
            SEVERITY,
            DEVICE_ID,
            HOSTNAME,
            opt("process_name", &["processName", "process"], FieldKind::String),
            FILE_PATH,
            SHA256,
            opt("occurred_at", &["occurredAt", "eventTime", "timestamp"], FieldKind::Timestamp),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:event",
        fields: &[
            ID,
            opt("event_type", &["eventType", "type", "category"], FieldKind::String),
            SEVERITY,
            DEVICE_ID,
            HOSTNAME,
            opt("user", &["user", "userName", "username"], FieldKind::String),
            opt("process_name", &["processName", "process"], FieldKind::String),
            opt("command_line", &["commandLine", "cmdline"], FieldKind::String),
            FILE_PATH,
            opt("occurred_at", &["occurredAt", "eventTime", "timestamp", "time"], FieldKind::Timestamp),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:threat",
        fields: &[
            ID,
            NAME,
            opt("family", &["family", "threatFamily", "malwareFamily"], FieldKind::String),
            SEVERITY,
            opt("classification", &["classification", "category"], FieldKind::String),
            SHA256,
            opt("affected_devices", &["affectedDevices", "deviceCount"], FieldKind::Integer),
            opt("first_seen", &["firstSeen"], FieldKind::Timestamp),
            opt("last_seen", &["lastSeen"], FieldKind::Timestamp),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:artifact",
        fields: &[
            ID,
            opt("alert_id", &["alertId", "alert_id"], FieldKind::String),
            opt("artifact_type", &["artifactType", "type", "kind"], FieldKind::String),
            FILE_PATH,
            SHA256,
            opt("md5", &["md5", "md5Hash"], FieldKind::String),
            opt("size_bytes", &["size", "sizeBytes", "fileSize"], FieldKind::Integer),
            opt("signer", &["signer", "publisher"], FieldKind::String),
            CREATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:asset",
        fields: &[
            ID,
            NAME,
            opt("asset_type", &["assetType", "type"], FieldKind::String),
            HOSTNAME,
            opt("ip_addresses", &["ipAddresses", "ips", "ipAddress"], FieldKind::Any),
            opt("os", &["os", "operatingSystem", "osName"], FieldKind::String),
            opt("last_seen", &["lastSeen", "lastCheckIn"], FieldKind::Timestamp),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:device",
        fields: &[
            ID,
            HOSTNAME,
            opt("os", &["os", "operatingSystem", "osName"], FieldKind::String),
            opt("os_version", &["osVersion", "operatingSystemVersion"], FieldKind::String),
            opt("agent_version", &["agentVersion", "sensorVersion", "version"], FieldKind::String),
            opt("ip_address", &["ipAddress", "ip", "lastIp"], FieldKind::String),
            opt("mac_address", &["macAddress", "mac"], FieldKind::String),
            POLICY_ID,
            opt("deployment_group_id", &["deploymentGroupId", "groupId"], FieldKind::String),
            opt("isolated", &["isolated", "isIsolated"], FieldKind::Boolean),
            opt("last_seen", &["lastSeen", "lastCheckIn", "lastContact"], FieldKind::Timestamp),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:device_extracted_key",
        fields: &[
            ID,
            DEVICE_ID,
            opt("key_type", &["keyType", "algorithm", "type"], FieldKind::String),
            opt("threat_id", &["threatId"], FieldKind::String),
            opt("extracted_at", &["extractedAt", "createdAt"], FieldKind::Timestamp),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:user",
        fields: &[
            OPT_ID,
            EMAIL,
            NAME,
            ROLE,
            opt("last_login", &["lastLogin", "lastLoginAt"], FieldKind::Timestamp),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:tenant_user",
        fields: &[
            ID,
            EMAIL,
            NAME,
            ROLE,
            STATUS,
            opt("mfa_enabled", &["mfaEnabled", "twoFactorEnabled"], FieldKind::Boolean),
            opt("last_login", &["lastLogin", "lastLoginAt"], FieldKind::Timestamp),
            CREATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:identity_provider",
        fields: &[
            ID,
            NAME,
            opt("provider_type", &["providerType", "type", "protocol"], FieldKind::String),
            ENABLED,
            opt("domain", &["domain", "domains"], FieldKind::Any),
            CREATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:tenant",
        fields: &[
            ID,
            NAME,
            opt("parent_tenant_id", &["parentTenantId", "parentId"], FieldKind::String),
            opt("region", &["region", "dataRegion"], FieldKind::String),
            opt("license_count", &["licenseCount", "seats"], FieldKind::Integer),
            STATUS,
            CREATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:subtenant",
        fields: &[
            ID,
            NAME,
            opt("parent_tenant_id", &["parentTenantId", "tenantId", "parentId"], FieldKind::String),
            STATUS,
            CREATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:deployment_group",
        fields: &[
            ID,
            NAME,
            DESCRIPTION,
            POLICY_ID,
            opt("device_count", &["deviceCount", "devices"], FieldKind::Integer),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:policy",
        fields: &[
            ID,
            NAME,
            DESCRIPTION,
            opt("mode", &["mode", "enforcementMode", "action"], FieldKind::String),
            ENABLED,
            opt("settings", &["settings", "configuration"], FieldKind::Object),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:policy_group",
        fields: &[
            ID,
            NAME,
            DESCRIPTION,
            opt("policy_ids", &["policyIds", "policies"], FieldKind::Array),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:override",
        fields: &[
            ID,
            opt("override_type", &["overrideType", "type"], FieldKind::String),
            opt("action", &["action", "verdict"], FieldKind::String),
            opt("value", &["value", "indicator"], FieldKind::String),
            SHA256,
            FILE_PATH,
            opt("scope", &["scope"], FieldKind::Any),
            opt("expires_at", &["expiresAt", "expiration"], FieldKind::Timestamp),
            CREATED_AT,
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:tag",
        fields: &[
            ID,
            NAME,
            opt("color", &["color", "colour"], FieldKind::String),
            opt("device_count", &["deviceCount", "count"], FieldKind::Integer),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:job",
        fields: &[
            ID,
            opt("job_type", &["jobType", "type", "action"], FieldKind::String),
            STATUS,
            DEVICE_ID,
            opt("requested_by", &["requestedBy", "createdBy", "initiator"], FieldKind::String),
            opt("started_at", &["startedAt"], FieldKind::Timestamp),
            opt("completed_at", &["completedAt", "finishedAt"], FieldKind::Timestamp),
            CREATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:webhook",
        fields: &[
            ID,
            NAME,
            opt("url", &["url", "endpoint", "targetUrl"], FieldKind::String),
            ENABLED,
            opt("events", &["events", "eventTypes", "subscriptions"], FieldKind::Array),
            opt("last_delivery_status", &["lastDeliveryStatus"], FieldKind::String),
            UPDATED_AT,
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:integration",
        fields: &[
            ID,
            NAME,
            opt("integration_type", &["integrationType", "type", "vendor"], FieldKind::String),
            ENABLED,
            STATUS,
            opt("last_sync", &["lastSync", "lastSyncAt"], FieldKind::Timestamp),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:installer",
        fields: &[
            ID,
            NAME,
            opt("platform", &["platform", "os"], FieldKind::String),
            opt("architecture", &["architecture", "arch"], FieldKind::String),
            VERSION,
            opt("released_at", &["releasedAt", "releaseDate", "createdAt"], FieldKind::Timestamp),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:health",
        fields: &[
            STATUS,
            VERSION,
            opt("components", &["components", "checks", "services"], FieldKind::Any),
            opt("checked_at", &["timestamp", "time", "checkedAt"], FieldKind::Timestamp),
        ],
    },
    RecordSchema {
        sourcetype: "halcyon:auth_event",
        fields: &[
            ID,
            opt("event_type", &["eventType", "type", "action"], FieldKind::String),
            opt("user", &["user", "userName", "email"], FieldKind::String),
            opt("source_ip", &["sourceIp", "ipAddress", "ip"], FieldKind::String),
            opt("outcome", &["outcome", "result", "success"], FieldKind::Any),
            opt("user_agent", &["userAgent"], FieldKind::String),
            opt("occurred_at", &["occurredAt", "timestamp", "time"], FieldKind::Timestamp),
        ],
    },
];

/// Fallback for sourcetypes without a dedicated schema: everything passes.
static PASSTHROUGH: RecordSchema = RecordSchema {
    sourcetype: "",
    fields: &[],
};

/// Schema for `sourcetype`, or an empty passthrough schema.
pub fn schema_for(sourcetype: &str) -> &'static RecordSchema {
    SCHEMAS
        .iter()
        .find(|s| s.sourcetype == sourcetype)
        .unwrap_or(&PASSTHROUGH)
}

impl RecordSchema {
    /// Map a raw vendor object onto this schema.
    pub fn apply(
        &self,
        mut raw: Map<String, Value>,
        unknown: UnknownFieldPolicy,
    ) -> Result<Map<String, Value>, SchemaViolation> {
        let mut out = Map::new();
        // a source may feed more than one rule, so removal waits until the end
        let mut consumed: Vec<&'static str> = Vec::new();

        for rule in self.fields {
            let found = rule
                .sources
                .iter()
                .find_map(|&name| match raw.get(name) {
                    Some(Value::Null) | None => None,
                    Some(_) => Some(name),
                });

            let Some(name) = found else {
                if rule.required {
                    return Err(SchemaViolation::MissingRequired(rule.canonical));
                }
                continue;
            };

            consumed.push(name);
            let value = raw.get(name).cloned().unwrap_or(Value::Null);
            match coerce(value, rule.kind) {
                Some(v) => {
                    out.insert(rule.canonical.to_string(), v);
                },
                None if rule.required => {
                    return Err(SchemaViolation::WrongKind {
                        field: rule.canonical,
                        expected: rule.kind,
                    });
                },
                None => {
                    tracing::debug!(
                        sourcetype = self.sourcetype,
                        field = rule.canonical,
                        expected = %rule.kind,
                        "Dropping field with unexpected type"
                    );
                },
            }
        }

        for name in consumed {
            raw.remove(name);
        }

        if unknown == UnknownFieldPolicy::Keep {
            for (key, value) in raw {
                if out.contains_key(&key) {
                    continue;
                }
                out.insert(key, value);
            }
        }

        Ok(out)
    }
}

fn coerce(value: Value, kind: FieldKind) -> Option<Value> {
    match (kind, value) {
        (FieldKind::Any, v) => Some(v),
        (FieldKind::String, Value::String(s)) => Some(Value::String(s)),
        (FieldKind::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldKind::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
            Some(Value::Number(n))
        },
        (FieldKind::Integer, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| Value::Number(Number::from(f as i64))),
        (FieldKind::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (FieldKind::Number, Value::Number(n)) => Some(Value::Number(n)),
        (FieldKind::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (FieldKind::Boolean, Value::Bool(b)) => Some(Value::Bool(b)),
        (FieldKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldKind::Timestamp, v) => parse_timestamp(&v).map(|t| Value::String(t.to_rfc3339())),
        (FieldKind::Object, v @ Value::Object(_)) => Some(v),
        (FieldKind::Array, v @ Value::Array(_)) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::object_types::sourcetypes;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_every_sourcetype_has_a_schema() {
        for st in sourcetypes() {
            assert_eq!(schema_for(st).sourcetype, st, "missing schema for {st}");
        }
        assert!(schema_for("halcyon:unknown").fields.is_empty());
    }

    #[test]
    fn test_alert_mapping_and_coercion() {
        let raw = obj(json!({
            "id": 42,
            "alertName": "Ransomware behaviour",
            "severity": "critical",
            "instanceCount": "7",
            "createdAt": 1_709_251_200,
            "deviceId": "dev-1",
            "vendorExtra": {"a": 1}
        }));

        let out = schema_for("halcyon:alert")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap();

        assert_eq!(out["id"], json!("42"));
        assert_eq!(out["title"], json!("Ransomware behaviour"));
        assert_eq!(out["instance_count"], json!(7));
        assert_eq!(out["created_at"], json!("2024-03-01T00:00:00+00:00"));
        assert_eq!(out["device_id"], json!("dev-1"));
        assert_eq!(out["vendorExtra"], json!({"a": 1}));
        assert!(!out.contains_key("alertName"));
    }

    #[test]
    fn test_drop_policy_discards_unmapped_fields() {
        let raw = obj(json!({"id": "t1", "name": "prod", "internalFlag": true}));
        let out = schema_for("halcyon:tag")
            .apply(raw, UnknownFieldPolicy::Drop)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out.contains_key("internalFlag"));
    }

    #[test]
    fn test_missing_required_id_is_rejected() {
        let raw = obj(json!({"name": "no id here"}));
        let err = schema_for("halcyon:device")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap_err();
        assert_eq!(err, SchemaViolation::MissingRequired("id"));
    }

    #[test]
    fn test_wrong_kind_on_required_field_is_rejected() {
        let raw = obj(json!({"id": {"nested": true}}));
        let err = schema_for("halcyon:job")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap_err();
        assert!(matches!(err, SchemaViolation::WrongKind { field: "id", .. }));
    }

    #[test]
    fn test_wrong_kind_on_optional_field_is_dropped() {
        let raw = obj(json!({"id": "d1", "isolated": "maybe", "lastSeen": "not a time"}));
        let out = schema_for("halcyon:device")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap();
        assert!(!out.contains_key("isolated"));
        assert!(!out.contains_key("last_seen"));
    }

    #[test]
    fn test_one_source_can_feed_several_rules() {
        let raw = obj(json!({"alertId": "a-1", "severity": "low"}));
        let out = schema_for("halcyon:alert_instance")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap();
        assert_eq!(out["id"], json!("a-1"));
        assert_eq!(out["alert_id"], json!("a-1"));
        assert!(!out.contains_key("alertId"));

        let raw = obj(json!({"id": "i-1", "alertId": "a-1"}));
        let out = schema_for("halcyon:alert_instance")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap();
        assert_eq!(out["id"], json!("i-1"));
        assert_eq!(out["alert_id"], json!("a-1"));
    }

    #[test]
    fn test_null_falls_through_to_next_source() {
        let raw = obj(json!({"hostname": null, "deviceName": "ws-01", "id": "d1"}));
        let out = schema_for("halcyon:device")
            .apply(raw, UnknownFieldPolicy::Keep)
            .unwrap();
        assert_eq!(out["hostname"], json!("ws-01"));
    }
}
