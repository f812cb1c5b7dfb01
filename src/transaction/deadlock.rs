use std::collections::{BTreeMap, BTreeSet};

use crate::transaction::TransactionId;

/// Wait-for graph rebuilt on every detection round. Edges run from a
/// blocked requester to each holder of the lock it awaits. Ordered
/// containers make traversal deterministic: starts and neighbours are
/// always visited in ascending transaction id order.
#[derive(Debug, Default)]
pub struct WaitsForGraph {
    edges: BTreeMap<TransactionId, BTreeSet<TransactionId>>,
}

impl WaitsForGraph {
    pub fn add_edge(&mut self, waiter: TransactionId, holder: TransactionId) {
        if waiter == holder {
            return;
        }
        self.edges.entry(waiter).or_default().insert(holder);
    }

    pub fn remove_edge(&mut self, waiter: TransactionId, holder: TransactionId) {
        if let Some(neighbours) = self.edges.get_mut(&waiter) {
            neighbours.remove(&holder);
            if neighbours.is_empty() {
                self.edges.remove(&waiter);
            }
        }
    }

    /// Deletes a transaction's node and every edge pointing at it.
    pub fn remove_txn(&mut self, txn_id: TransactionId) {
        self.edges.remove(&txn_id);
        self.edges.retain(|_, neighbours| {
            neighbours.remove(&txn_id);
            !neighbours.is_empty()
        });
    }

    pub fn edge_list(&self) -> Vec<(TransactionId, TransactionId)> {
        self.edges
            .iter()
            .flat_map(|(waiter, neighbours)| {
                neighbours.iter().map(move |holder| (*waiter, *holder))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Finds a cycle and names its victim: the youngest (largest id)
    /// transaction on the cycle. Returns `None` when the graph is acyclic.
    pub fn find_victim(&self) -> Option<TransactionId> {
        let mut visited = BTreeSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if let Some(victim) = self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TransactionId,
        visited: &mut BTreeSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        on_path: &mut BTreeSet<TransactionId>,
    ) -> Option<TransactionId> {
        visited.insert(node);
        path.push(node);
        on_path.insert(node);

        if let Some(neighbours) = self.edges.get(&node) {
            for &next in neighbours {
                if on_path.contains(&next) {
                    // Cycle closes at `next`; everything from there to the
                    // end of the path participates.
                    let start = path
                        .iter()
                        .position(|&n| n == next)
                        .expect("cycle entry must be on the path");
                    return path[start..].iter().copied().max();
                }
                if !visited.contains(&next) {
                    if let Some(victim) = self.dfs(next, visited, path, on_path) {
                        return Some(victim);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}
