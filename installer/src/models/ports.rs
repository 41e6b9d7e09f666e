// Port assignment model.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Logical service name → host port. Always injective: `assign` refuses a port that is
/// already held by another name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortAssignment {
    by_name: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCollision {
    pub port: u16,
    pub held_by: String,
    pub requested_by: String,
}

impl fmt::Display for PortCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "port {} is already assigned to '{}' (requested by '{}')",
            self.port, self.held_by, self.requested_by
        )
    }
}

impl std::error::Error for PortCollision {}

impl PortAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, name: &str, port: u16) -> Result<(), PortCollision> {
        if let Some((holder, _)) = self
            .by_name
            .iter()
            .find(|(n, p)| **p == port && n.as_str() != name)
        {
            return Err(PortCollision {
                port,
                held_by: holder.clone(),
                requested_by: name.to_string(),
            });
        }
        self.by_name.insert(name.to_string(), port);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.by_name.iter().map(|(n, p)| (n.as_str(), *p))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn is_injective(&self) -> bool {
        let mut seen = std::collections::BTreeSet::new();
        self.by_name.values().all(|p| seen.insert(*p))
    }
}

impl fmt::Display for PortAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .by_name
            .iter()
            .map(|(n, p)| format!("{}={}", n, p))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_rejects_port_held_by_other_name() {
        let mut ports = PortAssignment::new();
        ports.assign("database", 5432).unwrap();
        let err = ports.assign("cache", 5432).unwrap_err();
        assert_eq!(err.held_by, "database");
        assert_eq!(err.requested_by, "cache");
        assert!(ports.is_injective());
    }

    #[test]
    fn reassigning_same_name_replaces_port() {
        let mut ports = PortAssignment::new();
        ports.assign("database", 5432).unwrap();
        ports.assign("database", 5433).unwrap();
        assert_eq!(ports.get("database"), Some(5433));
        assert_eq!(ports.len(), 1);
    }
}
