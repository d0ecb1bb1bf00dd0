//! Knowledge partition registry.
//!
//! A partition is a named, access-controlled slice of the knowledge corpus
//! with its own freshness policy and metadata schema. The registry is
//! built once at startup and is read-only afterwards.
//!
//! # Access rules
//!
//! 1. A caller may only query or ingest into a partition whose
//!    `allowed_roles` contains the caller's role.
//! 2. A partition with an `identity_field` additionally rejects queries
//!    that carry no caller identity. The identity is injected as an
//!    equality filter on that field by the retrieval engine.
//!
//! Unknown partition ids are treated exactly like denied ones.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::Metadata;

/// Static definition of one knowledge partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDef {
    /// Partition identifier (also the namespace inside its index).
    pub id: String,
    /// Key of the backing vector index.
    pub index: String,
    /// Human-readable label used in rendered context headers.
    pub label: String,
    /// Roles allowed to query and ingest.
    pub allowed_roles: BTreeSet<String>,
    /// Freshness time-to-live in hours.
    pub ttl_hours: f64,
    /// Metadata fields every record in this partition is expected to carry.
    pub required_metadata: Vec<String>,
    /// Metadata field holding the record's freshness timestamp.
    pub timestamp_field: Option<String>,
    /// Metadata field that must match the caller identity on every query.
    pub identity_field: Option<String>,
    /// Free-text note on access handling, surfaced in listings.
    pub access_note: Option<String>,
}

impl PartitionDef {
    pub fn allows(&self, role: &str) -> bool {
        self.allowed_roles.contains(role)
    }

    pub fn requires_identity(&self) -> bool {
        self.identity_field.is_some()
    }

    /// Returns the raw freshness timestamp of a record, if present.
    pub fn timestamp<'a>(&self, metadata: &'a Metadata) -> Option<&'a str> {
        let field = self.timestamp_field.as_deref()?;
        metadata.get(field).and_then(|v| v.as_str())
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("partition id must not be empty");
        }
        if self.index.trim().is_empty() {
            bail!("partition '{}': index must not be empty", self.id);
        }
        if self.allowed_roles.is_empty() {
            bail!("partition '{}': allowed_roles must not be empty", self.id);
        }
        if self.ttl_hours.is_nan() || self.ttl_hours <= 0.0 {
            bail!("partition '{}': ttl_hours must be > 0", self.id);
        }
        for (what, field) in [
            ("timestamp_field", &self.timestamp_field),
            ("identity_field", &self.identity_field),
        ] {
            if let Some(f) = field {
                if !self.required_metadata.iter().any(|m| m == f) {
                    bail!(
                        "partition '{}': {} '{}' must be listed in required_metadata",
                        self.id,
                        what,
                        f
                    );
                }
            }
        }
        Ok(())
    }
}

/// Why a requested partition was left out of a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UnknownPartition,
    RoleNotAllowed,
    IdentityRequired,
}

/// Outcome of filtering a request's partitions against the caller.
#[derive(Debug)]
pub struct AccessDecision<'a> {
    /// Permitted partitions, in request order, deduplicated.
    pub granted: Vec<&'a PartitionDef>,
    /// Dropped partition ids with the reason.
    pub denied: Vec<(String, DenyReason)>,
}

/// Freshness label derived from a record's age against its partition TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessStatus {
    Fresh,
    Stale,
    Expired,
}

/// `fresh` below 80% of the TTL, `stale` below the TTL, `expired` otherwise
/// (including when the age is unknown).
pub fn freshness_status(age_hours: Option<f64>, ttl_hours: f64) -> FreshnessStatus {
    match age_hours {
        Some(age) if ttl_hours > 0.0 && age < ttl_hours * 0.8 => FreshnessStatus::Fresh,
        Some(age) if ttl_hours > 0.0 && age < ttl_hours => FreshnessStatus::Stale,
        _ => FreshnessStatus::Expired,
    }
}

/// Read-only registry of partitions and per-role default partition lists.
#[derive(Debug, Clone)]
pub struct PartitionRegistry {
    partitions: BTreeMap<String, PartitionDef>,
    role_defaults: HashMap<String, Vec<String>>,
}

impl PartitionRegistry {
    /// Build a registry, validating every definition.
    ///
    /// Role defaults may only reference declared partitions.
    pub fn new(
        defs: Vec<PartitionDef>,
        role_defaults: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        let mut partitions = BTreeMap::new();
        for def in defs {
            def.validate()?;
            if partitions.contains_key(&def.id) {
                bail!("duplicate partition id '{}'", def.id);
            }
            partitions.insert(def.id.clone(), def);
        }
        for (role, ids) in &role_defaults {
            for id in ids {
                if !partitions.contains_key(id) {
                    bail!("role '{}' defaults to unknown partition '{}'", role, id);
                }
            }
        }
        Ok(Self {
            partitions,
            role_defaults,
        })
    }

    /// The built-in partition set used when configuration declares none.
    pub fn builtin() -> Self {
        let defs = vec![
            builtin_def(
                "carrier_intel",
                "knowledge",
                "Carrier intelligence",
                &["driver", "recruiter", "admin", "carrier", "b2b"],
                168.0,
                &["dot_number", "chunk_type", "enriched_at"],
                "enriched_at",
            ),
            builtin_def(
                "driver_market",
                "knowledge",
                "Driver market",
                &["driver", "recruiter", "admin", "carrier"],
                24.0,
                &["topic_category", "generated_at"],
                "generated_at",
            ),
            builtin_def(
                "platform_ops",
                "knowledge",
                "Platform operations",
                &["driver", "recruiter", "admin", "carrier"],
                720.0,
                &["doc_type", "last_updated"],
                "last_updated",
            ),
            builtin_def(
                "industry_regs",
                "knowledge",
                "Industry regulations",
                &["driver", "recruiter"],
                2160.0,
                &["reg_category", "effective_date"],
                "effective_date",
            ),
            builtin_def(
                "lane_market",
                "knowledge",
                "Lane market",
                &["driver", "recruiter", "admin", "carrier"],
                6.0,
                &["lane_region", "data_date"],
                "data_date",
            ),
            PartitionDef {
                identity_field: Some("user_id".to_string()),
                access_note: Some("user_id filter is always applied to queries".to_string()),
                ..builtin_def(
                    "conversation_memory",
                    "memory",
                    "Conversation memory",
                    &["driver", "recruiter", "carrier"],
                    2160.0,
                    &["user_id", "role", "conversation_id", "turn_index", "created_at"],
                    "created_at",
                )
            },
        ];

        let role_defaults = [
            (
                "driver",
                &[
                    "carrier_intel",
                    "driver_market",
                    "platform_ops",
                    "industry_regs",
                    "lane_market",
                ][..],
            ),
            (
                "recruiter",
                &[
                    "driver_market",
                    "carrier_intel",
                    "lane_market",
                    "platform_ops",
                    "industry_regs",
                ][..],
            ),
            (
                "admin",
                &["platform_ops", "carrier_intel", "driver_market", "lane_market"][..],
            ),
            (
                "carrier",
                &["driver_market", "carrier_intel", "lane_market", "platform_ops"][..],
            ),
        ]
        .into_iter()
        .map(|(role, ids)| (role.to_string(), ids.iter().map(|s| s.to_string()).collect()))
        .collect();

        Self {
            partitions: defs.into_iter().map(|d| (d.id.clone(), d)).collect(),
            role_defaults,
        }
    }

    pub fn get(&self, id: &str) -> Option<&PartitionDef> {
        self.partitions.get(id)
    }

    /// All partitions, ordered by id.
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionDef> {
        self.partitions.values()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn has_access(&self, role: &str, id: &str) -> bool {
        self.partitions.get(id).is_some_and(|p| p.allows(role))
    }

    pub fn role_defaults(&self) -> &HashMap<String, Vec<String>> {
        &self.role_defaults
    }

    /// Default partitions for a role (empty for unknown roles).
    pub fn default_partitions(&self, role: &str) -> &[String] {
        self.role_defaults
            .get(role)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Context header label for a partition, falling back to its id.
    pub fn label<'a>(&'a self, id: &'a str) -> &'a str {
        self.partitions
            .get(id)
            .map(|p| p.label.as_str())
            .unwrap_or(id)
    }

    /// Filter `requested` down to the partitions this caller may query.
    pub fn accessible<'a>(
        &'a self,
        role: &str,
        requested: &[String],
        identity: Option<&str>,
    ) -> AccessDecision<'a> {
        let has_identity = identity.is_some_and(|i| !i.trim().is_empty());
        let mut seen = BTreeSet::new();
        let mut granted = Vec::new();
        let mut denied = Vec::new();

        for id in requested {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.partitions.get(id) {
                None => denied.push((id.clone(), DenyReason::UnknownPartition)),
                Some(p) if !p.allows(role) => denied.push((id.clone(), DenyReason::RoleNotAllowed)),
                Some(p) if p.requires_identity() && !has_identity => {
                    denied.push((id.clone(), DenyReason::IdentityRequired))
                }
                Some(p) => granted.push(p),
            }
        }

        AccessDecision { granted, denied }
    }
}

fn builtin_def(
    id: &str,
    index: &str,
    label: &str,
    roles: &[&str],
    ttl_hours: f64,
    required: &[&str],
    timestamp_field: &str,
) -> PartitionDef {
    PartitionDef {
        id: id.to_string(),
        index: index.to_string(),
        label: label.to_string(),
        allowed_roles: roles.iter().map(|r| r.to_string()).collect(),
        ttl_hours,
        required_metadata: required.iter().map(|r| r.to_string()).collect(),
        timestamp_field: Some(timestamp_field.to_string()),
        identity_field: None,
        access_note: None,
    }
}
