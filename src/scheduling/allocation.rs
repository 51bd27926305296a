//! Container allocation strategies
//!
//! A strategy picks a node for a (RAM, container) pair from the scheduling
//! tick's node snapshot. Ties are broken by node name so placement is
//! deterministic.

use std::collections::HashMap;

/// Per-node view used during one scheduling pass.
#[derive(Debug, Clone, Copy)]
pub struct NodeSnapshot {
    /// Total RAM in MiB
    pub total_ram: u64,

    /// RAM not reserved by non-terminal containers, in MiB
    pub free_ram: i64,
}

/// Picks a node with at least `minimum_ram` MiB free, or `None`.
pub type Allocator = fn(&HashMap<String, NodeSnapshot>, u64) -> Option<String>;

/// Fill the fullest node that still fits.
pub fn binpack(nodes: &HashMap<String, NodeSnapshot>, minimum_ram: u64) -> Option<String> {
    candidates(nodes, minimum_ram)
        .into_iter()
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(name, _)| name)
}

/// Fill the emptiest node.
pub fn spread(nodes: &HashMap<String, NodeSnapshot>, minimum_ram: u64) -> Option<String> {
    candidates(nodes, minimum_ram)
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(name, _)| name)
}

fn candidates(nodes: &HashMap<String, NodeSnapshot>, minimum_ram: u64) -> Vec<(String, i64)> {
    nodes
        .iter()
        .filter(|(_, node)| node.free_ram >= minimum_ram as i64)
        .map(|(name, node)| (name.clone(), node.free_ram))
        .collect()
}

/// Look up a strategy by its config name.
pub fn by_name(name: &str) -> Option<Allocator> {
    match name {
        "binpack" => Some(binpack),
        "spread" => Some(spread),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(entries: &[(&str, i64)]) -> HashMap<String, NodeSnapshot> {
        entries
            .iter()
            .map(|(name, free_ram)| {
                (
                    name.to_string(),
                    NodeSnapshot {
                        total_ram: 4096,
                        free_ram: *free_ram,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_binpack_picks_fullest_fitting() {
        let nodes = nodes(&[("node-a", 1024), ("node-b", 512), ("node-c", 256)]);
        assert_eq!(binpack(&nodes, 512).as_deref(), Some("node-b"));
    }

    #[test]
    fn test_spread_picks_emptiest() {
        let nodes = nodes(&[("node-a", 1024), ("node-b", 512)]);
        assert_eq!(spread(&nodes, 256).as_deref(), Some("node-a"));
    }

    #[test]
    fn test_no_node_fits() {
        let nodes = nodes(&[("node-a", 256)]);
        assert_eq!(binpack(&nodes, 512), None);
        assert_eq!(spread(&nodes, 512), None);
    }

    #[test]
    fn test_deterministic_tiebreak_on_name() {
        let nodes = nodes(&[("node-b", 512), ("node-a", 512)]);
        assert_eq!(binpack(&nodes, 256).as_deref(), Some("node-a"));
        assert_eq!(spread(&nodes, 256).as_deref(), Some("node-a"));
    }

    #[test]
    fn test_by_name() {
        assert!(by_name("binpack").is_some());
        assert!(by_name("spread").is_some());
        assert!(by_name("random").is_none());
    }
}
