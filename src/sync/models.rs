//! Document and sync-state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Database kind a diagram targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Generic,
    Postgresql,
    Mysql,
    Mariadb,
    Sqlite,
    SqlServer,
    Clickhouse,
    Cockroachdb,
    Oracle,
}

/// One diagram entity. The engine only cares about the id; everything else is
/// opaque payload carried to and from the remote store unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramEntity {
    pub id: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// The synchronized unit: one header plus six unordered entity collections,
/// each entity keyed by its own id.
///
/// The diagram is owned by the editing layer; the sync engine only takes
/// read-only snapshots and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    pub id: String,
    pub name: String,
    pub database_type: DatabaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_edition: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tables: Vec<DiagramEntity>,
    #[serde(default)]
    pub relationships: Vec<DiagramEntity>,
    #[serde(default)]
    pub dependencies: Vec<DiagramEntity>,
    #[serde(default)]
    pub areas: Vec<DiagramEntity>,
    #[serde(default)]
    pub custom_types: Vec<DiagramEntity>,
    #[serde(default)]
    pub notes: Vec<DiagramEntity>,
}

impl Diagram {
    pub fn collection(&self, kind: EntityCollection) -> &[DiagramEntity] {
        match kind {
            EntityCollection::Tables => &self.tables,
            EntityCollection::Relationships => &self.relationships,
            EntityCollection::Dependencies => &self.dependencies,
            EntityCollection::Areas => &self.areas,
            EntityCollection::CustomTypes => &self.custom_types,
            EntityCollection::Notes => &self.notes,
        }
    }
}

/// The six child collections and their remote table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityCollection {
    Tables,
    Relationships,
    Dependencies,
    Areas,
    CustomTypes,
    Notes,
}

impl EntityCollection {
    pub const ALL: [EntityCollection; 6] = [
        EntityCollection::Tables,
        EntityCollection::Relationships,
        EntityCollection::Dependencies,
        EntityCollection::Areas,
        EntityCollection::CustomTypes,
        EntityCollection::Notes,
    ];

    pub fn table(self) -> &'static str {
        match self {
            EntityCollection::Tables => "db_tables",
            EntityCollection::Relationships => "db_relationships",
            EntityCollection::Dependencies => "db_dependencies",
            EntityCollection::Areas => "areas",
            EntityCollection::CustomTypes => "db_custom_types",
            EntityCollection::Notes => "notes",
        }
    }
}

/// Where the orchestrator currently is in its sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Pending,
    Syncing,
    Synced,
    Error,
}

/// Snapshot of orchestrator state published to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_synced_at: None,
            error: None,
        }
    }
}

/// Cheap identity of a document snapshot: header id, `updated_at` and the
/// entity ids of each collection. Inequality across ticks is what counts as a
/// qualifying change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFingerprint {
    id: String,
    updated_at: DateTime<Utc>,
    collections: [Vec<String>; 6],
}

impl DocumentFingerprint {
    pub fn of(diagram: &Diagram) -> Self {
        Self {
            id: diagram.id.clone(),
            updated_at: diagram.updated_at,
            collections: EntityCollection::ALL.map(|kind| {
                diagram
                    .collection(kind)
                    .iter()
                    .map(|entity| entity.id.clone())
                    .collect()
            }),
        }
    }
}
