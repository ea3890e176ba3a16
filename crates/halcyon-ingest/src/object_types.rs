//! The 24 collected object types
//!
//! Each object type is described by an immutable [`ObjectTypeSpec`]: where
//! to fetch it, how the endpoint paginates, how incremental collection
//! resumes, and how often to poll. The static table below holds the
//! defaults; [`ObjectTypeRegistry::from_settings`] applies per-type config
//! overrides once at startup. Specs are never mutated afterwards.

use crate::config::{ObjectTypeOverride, Settings};
use crate::error::{IngestError, Result};
use crate::schema::UnknownFieldPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const HOUR: u64 = 3600;
const SIX_HOURS: u64 = 6 * HOUR;
const DAY: u64 = 24 * HOUR;

/// Keys that may hold the record array in a list response.
pub const DEFAULT_LIST_KEYS: &[&str] = &["items", "data", "results", "value"];

/// Keys tried, in order, for a record's identifier.
pub const DEFAULT_ID_FIELDS: &[&str] = &["id", "uuid", "alertId", "eventId"];

/// Keys tried, in order, for a record's event time.
pub const DEFAULT_TIME_FIELDS: &[&str] = &[
    "time",
    "timestamp",
    "createdAt",
    "updatedAt",
    "occurredAt",
    "eventTime",
    "lastSeen",
    "firstSeen",
];

/// How an endpoint exposes its next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Detect next link, cursor token, page metadata, then offset
    #[default]
    Auto,
    /// Absolute URL of the next page in the body
    NextLink,
    /// Opaque continuation token in the body
    Cursor,
    /// `page` / `totalPages` metadata
    PageNumber,
    /// `offset` advanced by page size while full pages come back
    Offset,
    /// Single request
    None,
}

/// What the checkpoint cursor tracks between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    /// Resume after the last record id in API order
    Id,
    /// Resume from the newest record timestamp seen
    Timestamp,
    /// No cursor; every run collects the full collection
    Snapshot,
}

/// Incremental collection settings for one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSpec {
    pub kind: CursorKind,
    /// Record field the cursor value is read from
    pub field: String,
    /// Query parameter that carries the cursor on the next run
    pub param: String,
}

impl CursorSpec {
    pub fn id() -> Self {
        Self {
            kind: CursorKind::Id,
            field: "id".to_string(),
            param: "after".to_string(),
        }
    }

    pub fn timestamp(field: &str) -> Self {
        Self {
            kind: CursorKind::Timestamp,
            field: field.to_string(),
            param: "since".to_string(),
        }
    }

    pub fn snapshot() -> Self {
        Self {
            kind: CursorKind::Snapshot,
            field: String::new(),
            param: String::new(),
        }
    }
}

/// Immutable descriptor of one collected object type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectTypeSpec {
    /// Config key, e.g. `alerts`
    pub name: String,
    /// Output category, e.g. `halcyon:alert`
    pub sourcetype: &'static str,
    /// API path relative to the base URL
    pub path: String,
    pub pagination: PaginationStyle,
    pub cursor: CursorSpec,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub enabled: bool,
    pub unknown_fields: UnknownFieldPolicy,
    #[serde(skip)]
    pub list_keys: &'static [&'static str],
    #[serde(skip)]
    pub id_fields: &'static [&'static str],
    #[serde(skip)]
    pub time_fields: &'static [&'static str],
}

impl ObjectTypeSpec {
    /// `source` value attached to every record of this type.
    pub fn source(&self) -> String {
        format!("halcyon_api:{}", self.name)
    }

    pub fn with_cursor(mut self, cursor: CursorSpec) -> Self {
        self.cursor = cursor;
        self
    }

    fn apply(&mut self, o: &ObjectTypeOverride) {
        if let Some(enabled) = o.enabled {
            self.enabled = enabled;
        }
        if let Some(secs) = o.interval_secs {
            self.interval = Duration::from_secs(secs);
        }
        if let Some(ref path) = o.path {
            self.path = path.clone();
        }
        if let Some(pagination) = o.pagination {
            self.pagination = pagination;
        }
        if let Some(kind) = o.cursor_kind {
            self.cursor = match kind {
                CursorKind::Id => CursorSpec::id(),
                CursorKind::Timestamp => CursorSpec::timestamp("updatedAt"),
                CursorKind::Snapshot => CursorSpec::snapshot(),
            };
        }
        if let Some(ref field) = o.cursor_field {
            self.cursor.field = field.clone();
        }
        if let Some(ref param) = o.cursor_param {
            self.cursor.param = param.clone();
        }
        if let Some(policy) = o.unknown_fields {
            self.unknown_fields = policy;
        }
    }
}

struct Builtin {
    name: &'static str,
    sourcetype: &'static str,
    path: &'static str,
    interval_secs: u64,
    cursor: fn() -> CursorSpec,
}

fn updated_at() -> CursorSpec {
    CursorSpec::timestamp("updatedAt")
}

const BUILTINS: [Builtin; 24] = [
    // Core security objects
    Builtin { name: "alerts", sourcetype: "halcyon:alert", path: "/v2/alerts", interval_secs: HOUR, cursor: CursorSpec::id },
    Builtin { name: "alert_instances", sourcetype: "halcyon:alert_instance", path: "/v2/alert-instances", interval_secs: HOUR, cursor: CursorSpec::id },
    Builtin { name: "events", sourcetype: "halcyon:event", path: "/v2/events", interval_secs: HOUR, cursor: CursorSpec::id },
    Builtin { name: "threats", sourcetype: "halcyon:threat", path: "/v2/threats", interval_secs: SIX_HOURS, cursor: updated_at },
    Builtin { name: "alert_artifacts", sourcetype: "halcyon:artifact", path: "/v2/alerts/artifacts", interval_secs: HOUR, cursor: CursorSpec::id },
    // Assets and devices
    Builtin { name: "assets", sourcetype: "halcyon:asset", path: "/v2/assets", interval_secs: SIX_HOURS, cursor: updated_at },
    Builtin { name: "devices", sourcetype: "halcyon:device", path: "/v2/devices", interval_secs: HOUR, cursor: updated_at },
    Builtin { name: "device_extracted_keys", sourcetype: "halcyon:device_extracted_key", path: "/v2/device-extracted-keys", interval_secs: SIX_HOURS, cursor: updated_at },
    // Identity and access
    Builtin { name: "current_user", sourcetype: "halcyon:user", path: "/v2/users/me", interval_secs: DAY, cursor: CursorSpec::snapshot },
    Builtin { name: "tenant_users", sourcetype: "halcyon:tenant_user", path: "/v2/tenant-users", interval_secs: SIX_HOURS, cursor: CursorSpec::snapshot },
    Builtin { name: "identity_providers", sourcetype: "halcyon:identity_provider", path: "/v2/identity-providers", interval_secs: DAY, cursor: CursorSpec::snapshot },
    // Tenancy and structure
    Builtin { name: "tenants", sourcetype: "halcyon:tenant", path: "/v2/tenants", interval_secs: DAY, cursor: CursorSpec::snapshot },
    Builtin { name: "subtenants", sourcetype: "halcyon:subtenant", path: "/v2/subtenants", interval_secs: DAY, cursor: CursorSpec::snapshot },
    Builtin { name: "deployment_groups", sourcetype: "halcyon:deployment_group", path: "/v2/deployment-groups", interval_secs: DAY, cursor: CursorSpec::snapshot },
    // Policy and control plane
    Builtin { name: "policies", sourcetype: "halcyon:policy", path: "/v2/policies", interval_secs: DAY, cursor: CursorSpec::snapshot },
    Builtin { name: "policy_groups", sourcetype: "halcyon:policy_group", path: "/v2/policy-groups", interval_secs: DAY, cursor: CursorSpec::snapshot },
    Builtin { name: "overrides", sourcetype: "halcyon:override", path: "/v2/overrides", interval_secs: SIX_HOURS, cursor: updated_at },
    Builtin { name: "tags", sourcetype: "halcyon:tag", path: "/v2/tags", interval_secs: DAY, cursor: CursorSpec::snapshot },
    // Operations and automation
    Builtin { name: "jobs", sourcetype: "halcyon:job", path: "/v2/jobs", interval_secs: HOUR, cursor: CursorSpec::id },
    Builtin { name: "webhooks", sourcetype: "halcyon:webhook", path: "/v2/webhooks", interval_secs: SIX_HOURS, cursor: CursorSpec::snapshot },
    Builtin { name: "integrations", sourcetype: "halcyon:integration", path: "/v2/integrations", interval_secs: SIX_HOURS, cursor: CursorSpec::snapshot },
    Builtin { name: "installers", sourcetype: "halcyon:installer", path: "/v2/installers", interval_secs: DAY, cursor: CursorSpec::snapshot },
    // Platform health and meta
    Builtin { name: "health", sourcetype: "halcyon:health", path: "/health", interval_secs: 1800, cursor: CursorSpec::snapshot },
    Builtin { name: "auth_events", sourcetype: "halcyon:auth_event", path: "/v2/auth", interval_secs: DAY, cursor: CursorSpec::id },
];

/// All 24 sourcetype names, in table order.
pub fn sourcetypes() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|b| b.sourcetype)
}

/// Default spec for every object type, before config overrides.
pub fn builtin_specs() -> Vec<ObjectTypeSpec> {
    BUILTINS
        .iter()
        .map(|b| ObjectTypeSpec {
            name: b.name.to_string(),
            sourcetype: b.sourcetype,
            path: b.path.to_string(),
            pagination: PaginationStyle::Auto,
            cursor: (b.cursor)(),
            interval: Duration::from_secs(b.interval_secs),
            enabled: true,
            unknown_fields: UnknownFieldPolicy::Keep,
            list_keys: DEFAULT_LIST_KEYS,
            id_fields: DEFAULT_ID_FIELDS,
            time_fields: DEFAULT_TIME_FIELDS,
        })
        .collect()
}

/// The set of object types the collector knows about.
#[derive(Debug, Clone)]
pub struct ObjectTypeRegistry {
    specs: Vec<Arc<ObjectTypeSpec>>,
    by_name: HashMap<String, usize>,
}

impl ObjectTypeRegistry {
    /// Build from an explicit list of specs (table order is preserved).
    pub fn from_specs(specs: Vec<ObjectTypeSpec>) -> Self {
        let by_name = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self {
            specs: specs.into_iter().map(Arc::new).collect(),
            by_name,
        }
    }

    /// Built-in table with no overrides.
    pub fn builtin() -> Self {
        Self::from_specs(builtin_specs())
    }

    /// Built-in table with the `[object_types.<name>]` overrides applied.
    ///
    /// Overrides naming an unknown object type are rejected so that typos
    /// do not silently leave a type enabled.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut specs = builtin_specs();
        for (name, o) in &settings.object_types {
            let spec = specs
                .iter_mut()
                .find(|s| s.name == *name || s.sourcetype == name.as_str())
                .ok_or_else(|| IngestError::UnknownObjectType(name.clone()))?;
            spec.apply(o);
        }
        Ok(Self::from_specs(specs))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ObjectTypeSpec>> {
        self.by_name.get(name).map(|&i| &self.specs[i])
    }

    pub fn all(&self) -> &[Arc<ObjectTypeSpec>] {
        &self.specs
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<ObjectTypeSpec>> {
        self.specs.iter().filter(|s| s.enabled)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_table_has_24_distinct_sourcetypes() {
        let registry = ObjectTypeRegistry::builtin();
        assert_eq!(registry.len(), 24);

        let unique: HashSet<_> = sourcetypes().collect();
        assert_eq!(unique.len(), 24);
        assert!(unique.contains("halcyon:device_extracted_key"));
        assert!(unique.contains("halcyon:auth_event"));
        assert!(sourcetypes().all(|s| s.starts_with("halcyon:")));
    }

    #[test]
    fn test_defaults() {
        let registry = ObjectTypeRegistry::builtin();
        let alerts = registry.get("alerts").unwrap();
        assert_eq!(alerts.path, "/v2/alerts");
        assert_eq!(alerts.cursor.kind, CursorKind::Id);
        assert_eq!(alerts.interval, Duration::from_secs(3600));
        assert_eq!(alerts.source(), "halcyon_api:alerts");

        let health = registry.get("health").unwrap();
        assert_eq!(health.cursor.kind, CursorKind::Snapshot);
        assert_eq!(health.interval, Duration::from_secs(1800));
        assert_eq!(registry.enabled().count(), 24);
    }

    #[test]
    fn test_overrides_apply_by_name_or_sourcetype() {
        let mut settings = Settings::default();
        settings.object_types.insert(
            "alerts".into(),
            ObjectTypeOverride {
                enabled: Some(false),
                ..Default::default()
            },
        );
        settings.object_types.insert(
            "halcyon:device".into(),
            ObjectTypeOverride {
                interval_secs: Some(120),
                cursor_kind: Some(CursorKind::Id),
                cursor_param: Some("startingAfter".into()),
                ..Default::default()
            },
        );

        let registry = ObjectTypeRegistry::from_settings(&settings).unwrap();
        assert!(!registry.get("alerts").unwrap().enabled);

        let devices = registry.get("devices").unwrap();
        assert_eq!(devices.interval, Duration::from_secs(120));
        assert_eq!(devices.cursor.kind, CursorKind::Id);
        assert_eq!(devices.cursor.param, "startingAfter");
        assert_eq!(registry.enabled().count(), 23);
    }

    #[test]
    fn test_unknown_override_is_rejected() {
        let mut settings = Settings::default();
        settings
            .object_types
            .insert("alertz".into(), ObjectTypeOverride::default());

        let err = ObjectTypeRegistry::from_settings(&settings).unwrap_err();
        assert!(matches!(err, IngestError::UnknownObjectType(name) if name == "alertz"));
    }
}
