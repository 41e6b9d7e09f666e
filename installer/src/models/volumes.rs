// Persistent volume observation model
//
// Snapshots are always taken live from the container engine and never cached across
// invocations.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeRole {
    Database,
    Cache,
    Queue,
}

impl VolumeRole {
    pub const ALL: [VolumeRole; 3] = [VolumeRole::Database, VolumeRole::Cache, VolumeRole::Queue];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeRole::Database => "database",
            VolumeRole::Cache => "cache",
            VolumeRole::Queue => "queue",
        }
    }

    /// Volume name stems seen across releases, newest convention first.
    pub fn stems(&self) -> &'static [&'static str] {
        match self {
            VolumeRole::Database => &["postgres_data", "db_data", "database_data"],
            VolumeRole::Cache => &["redis_data", "cache_data"],
            VolumeRole::Queue => &["rabbitmq_data", "queue_data"],
        }
    }

    /// Every volume name this role may live under for the given project prefix.
    pub fn candidate_names(&self, project: &str) -> Vec<String> {
        let mut out = Vec::new();
        for stem in self.stems() {
            out.push(format!("{}_{}", project, stem));
            out.push(format!("{}-{}", project, stem.replace('_', "-")));
        }
        out
    }
}

impl fmt::Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Empty,
    Small,
    Substantial,
}

impl SizeClass {
    /// Below this a volume holds no meaningful data.
    pub const EMPTY_BELOW_BYTES: u64 = MIB;
    /// Above this a volume is assumed to hold real data.
    pub const SUBSTANTIAL_ABOVE_BYTES: u64 = 10 * MIB;

    pub fn from_bytes(bytes: u64) -> SizeClass {
        if bytes < Self::EMPTY_BELOW_BYTES {
            SizeClass::Empty
        } else if bytes > Self::SUBSTANTIAL_ABOVE_BYTES {
            SizeClass::Substantial
        } else {
            SizeClass::Small
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeObservation {
    pub role: VolumeRole,
    pub name: String,
    /// `None` when the measurement failed or timed out.
    pub size_bytes: Option<u64>,
    pub class: SizeClass,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeSnapshot {
    volumes: BTreeMap<VolumeRole, VolumeObservation>,
    /// False when the engine could not be queried; the snapshot is then a guess.
    pub engine_reachable: bool,
}

impl VolumeSnapshot {
    pub fn new(engine_reachable: bool) -> Self {
        Self {
            volumes: BTreeMap::new(),
            engine_reachable,
        }
    }

    pub fn insert(&mut self, observation: VolumeObservation) {
        self.volumes.insert(observation.role, observation);
    }

    pub fn get(&self, role: VolumeRole) -> Option<&VolumeObservation> {
        self.volumes.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeObservation> {
        self.volumes.values()
    }

    pub fn any_present(&self) -> bool {
        !self.volumes.is_empty()
    }

    pub fn has_substantial(&self) -> bool {
        self.volumes
            .values()
            .any(|v| v.class == SizeClass::Substantial)
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.volumes.values().map(|v| v.name.clone()).collect()
    }
}
