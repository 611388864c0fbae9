//! Service selector and scale-target grammars.
//!
//! A selector names a service or a single replica of it (`worker`,
//! `worker#2`). Commands that accept multiple selectors aggregate them per
//! service: any bare selector widens the aggregate to all replicas.

use crate::error::{CompoteError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A parsed `service[#replica]` selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSelector {
    pub service: String,
    pub replica: Option<u32>,
}

impl ServiceSelector {
    /// Parse a selector string.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || CompoteError::InvalidServiceSelector { selector: input.to_string() };

        let (service, replica) = match input.split_once('#') {
            Some((service, replica)) => {
                let index = replica.parse::<u32>().ok().filter(|r| *r >= 1).ok_or_else(invalid)?;
                (service, Some(index))
            }
            None => (input, None),
        };

        if service.is_empty() {
            return Err(invalid());
        }

        Ok(Self { service: service.to_string(), replica })
    }

    /// Parse a list of selector strings.
    pub fn parse_all(inputs: &[String]) -> Result<Vec<Self>> {
        inputs.iter().map(|s| Self::parse(s)).collect()
    }

    /// Select a whole service.
    pub fn all(service: impl Into<String>) -> Self {
        Self { service: service.into(), replica: None }
    }
}

impl fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.replica {
            Some(replica) => write!(f, "{}#{}", self.service, replica),
            None => write!(f, "{}", self.service),
        }
    }
}

/// Replica set requested for one service after selector aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaSelection {
    /// Every replica of the service.
    All,
    /// Specific replica indices.
    Indices(BTreeSet<u32>),
}

impl ReplicaSelection {
    /// Whether the given replica index is selected.
    pub fn contains(&self, replica: u32) -> bool {
        match self {
            ReplicaSelection::All => true,
            ReplicaSelection::Indices(set) => set.contains(&replica),
        }
    }
}

/// Aggregate selectors per service: a bare selector for a service wins over
/// any replica-specific ones; otherwise the index sets are unioned.
pub fn aggregate(selectors: &[ServiceSelector]) -> BTreeMap<String, ReplicaSelection> {
    let mut map: BTreeMap<String, ReplicaSelection> = BTreeMap::new();

    for selector in selectors {
        match selector.replica {
            None => {
                map.insert(selector.service.clone(), ReplicaSelection::All);
            }
            Some(index) => {
                let entry = map
                    .entry(selector.service.clone())
                    .or_insert_with(|| ReplicaSelection::Indices(BTreeSet::new()));
                if let ReplicaSelection::Indices(set) = entry {
                    set.insert(index);
                }
            }
        }
    }

    map
}

/// A parsed `service=replicas` scale target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    pub service: String,
    pub replicas: u32,
}

impl ScaleTarget {
    /// Parse a scale target string.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || CompoteError::InvalidScale { target: input.to_string() };

        let (service, count) = input.split_once('=').ok_or_else(invalid)?;
        if service.is_empty() {
            return Err(invalid());
        }

        let replicas = count.parse::<u32>().map_err(|_| invalid())?;

        Ok(Self { service: service.to_string(), replicas })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_selector() {
        let sel = ServiceSelector::parse("web").unwrap();
        assert_eq!(sel.service, "web");
        assert_eq!(sel.replica, None);
    }

    #[test]
    fn test_parse_replica_selector() {
        let sel = ServiceSelector::parse("worker#2").unwrap();
        assert_eq!(sel.service, "worker");
        assert_eq!(sel.replica, Some(2));
    }

    #[test]
    fn test_invalid_selectors() {
        for bad in ["", "#1", "web#", "web#0", "web#x", "web#-1"] {
            assert!(
                matches!(
                    ServiceSelector::parse(bad),
                    Err(CompoteError::InvalidServiceSelector { .. })
                ),
                "expected parse failure for {bad:?}"
            );
        }
    }

    #[test]
    fn test_selector_roundtrip() {
        for s in ["web", "worker#3"] {
            assert_eq!(ServiceSelector::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_aggregate_unions_indices() {
        let selectors = ServiceSelector::parse_all(&[
            "worker#1".to_string(),
            "worker#3".to_string(),
            "web#2".to_string(),
        ])
        .unwrap();
        let map = aggregate(&selectors);

        assert_eq!(
            map["worker"],
            ReplicaSelection::Indices(BTreeSet::from([1, 3]))
        );
        assert_eq!(map["web"], ReplicaSelection::Indices(BTreeSet::from([2])));
    }

    #[test]
    fn test_aggregate_bare_selector_wins() {
        let selectors = ServiceSelector::parse_all(&[
            "worker#1".to_string(),
            "worker".to_string(),
            "worker#3".to_string(),
        ])
        .unwrap();
        let map = aggregate(&selectors);
        assert_eq!(map["worker"], ReplicaSelection::All);
    }

    #[test]
    fn test_parse_scale_target() {
        let target = ScaleTarget::parse("worker=3").unwrap();
        assert_eq!(target.service, "worker");
        assert_eq!(target.replicas, 3);

        let zero = ScaleTarget::parse("worker=0").unwrap();
        assert_eq!(zero.replicas, 0);
    }

    #[test]
    fn test_invalid_scale_targets() {
        for bad in ["worker", "=3", "worker=", "worker=-1", "worker=lots"] {
            assert!(
                matches!(ScaleTarget::parse(bad), Err(CompoteError::InvalidScale { .. })),
                "expected parse failure for {bad:?}"
            );
        }
    }
}
