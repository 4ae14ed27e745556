//! Topological island decomposition.
//!
//! Partitions the bus set into maximal connected components under the
//! currently active branches. Each [`Island`] carries a bijective remap
//! between global and local indices so per-island solutions can be scattered
//! back into full-network arrays. Islands never share state and can be
//! solved independently.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{NodeIndex, UnGraph};

use crate::model::{BusIdx, Network};

/// One maximal connected component of the network under active branches.
#[derive(Debug, Clone)]
pub struct Island {
    /// Global bus index for each local bus position.
    pub bus_global: Vec<usize>,
    /// Global branch index for each local branch position.
    pub branch_global: Vec<usize>,
    /// Reverse lookup: global bus index -> local position.
    pub bus_local: HashMap<usize, usize>,
}

impl Island {
    #[inline]
    pub fn n_bus(&self) -> usize {
        self.bus_global.len()
    }

    #[inline]
    pub fn n_branch(&self) -> usize {
        self.branch_global.len()
    }

    /// Slice a locally-reindexed sub-network out of the full snapshot.
    /// Single-island networks go through the same path with an identity
    /// remap; the bus/branch copies are cheap relative to a solve.
    pub fn extract(&self, net: &Network) -> Network {
        let mut sub = Network::new();
        sub.base_mva = net.base_mva;
        for &g in &self.bus_global {
            sub.buses.push(net.buses[g].clone());
        }
        for &g in &self.branch_global {
            let mut br = net.branches[g].clone();
            br.from = BusIdx::new(self.bus_local[&br.from.value()]);
            br.to = BusIdx::new(self.bus_local[&br.to.value()]);
            sub.branches.push(br);
        }
        sub
    }
}

/// Labels connected components (breadth-first search) over buses joined by
/// active branches. Inactive branches contribute no edges, so deactivating
/// the only tie between two sub-networks doubles the island count. An
/// isolated bus yields a valid 1-bus island.
pub fn find_islands(net: &Network) -> Vec<Island> {
    let mut graph: UnGraph<usize, usize> = UnGraph::default();
    let nodes: Vec<NodeIndex> = (0..net.n_bus()).map(|i| graph.add_node(i)).collect();
    for (k, br) in net.branches.iter().enumerate() {
        if br.active {
            graph.add_edge(nodes[br.from.value()], nodes[br.to.value()], k);
        }
    }

    let mut visited = HashSet::new();
    let mut islands = Vec::new();
    for start in graph.node_indices() {
        if visited.contains(&start) {
            continue;
        }
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut members = Vec::new();
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            members.push(node.index());
            for neighbor in graph.neighbors(node) {
                if !visited.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        members.sort_unstable();

        let bus_local: HashMap<usize, usize> =
            members.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        let branch_global: Vec<usize> = net
            .branches
            .iter()
            .enumerate()
            .filter(|(_, br)| {
                br.active
                    && bus_local.contains_key(&br.from.value())
                    && bus_local.contains_key(&br.to.value())
            })
            .map(|(k, _)| k)
            .collect();

        islands.push(Island {
            bus_global: members,
            branch_global,
            bus_local,
        });
    }
    islands
}
