//! Union-find over ports, carrying a membership mask per set
//!
//! Each element starts as a singleton set whose mask holds its own port.
//! Merging two sets ORs their masks into the surviving root, so after all
//! merges every root's mask names exactly the ports of its set.

use ctxsync_types::{PortId, PortMask};
use std::collections::HashMap;
use std::hash::Hash;

/// Disjoint sets of ports with union by rank and path halving
#[derive(Debug, Clone)]
pub struct PortUnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
    masks: Vec<PortMask>,
}

impl PortUnionFind {
    /// One singleton set per port, in the given order
    pub fn new(ports: &[PortId]) -> Self {
        Self {
            parent: (0..ports.len()).collect(),
            rank: vec![0; ports.len()],
            masks: ports.iter().map(|p| p.mask()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Root of the set containing element `x`
    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            let grandparent = self.parent[self.parent[x]];
            self.parent[x] = grandparent;
            x = grandparent;
        }
        x
    }

    /// Merge the sets of `a` and `b`; returns the surviving root
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let (root, child) = match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => (rb, ra),
            std::cmp::Ordering::Greater => (ra, rb),
            std::cmp::Ordering::Equal => {
                self.rank[ra] += 1;
                (ra, rb)
            }
        };
        self.parent[child] = root;
        self.masks[root] = self.masks[root].union(self.masks[child]);
        root
    }

    /// Membership mask of the set containing `x`
    pub fn mask(&mut self, x: usize) -> PortMask {
        let root = self.find(x);
        self.masks[root]
    }

    /// `(root, mask)` for every set, ordered by the set's first element
    pub fn sets(&mut self) -> Vec<(usize, PortMask)> {
        let mut seen = vec![false; self.len()];
        let mut sets = Vec::new();
        for x in 0..self.len() {
            let root = self.find(x);
            if !seen[root] {
                seen[root] = true;
                sets.push((root, self.masks[root]));
            }
        }
        sets
    }
}

/// Group ports by equal value.
///
/// Returns one `(index, mask)` per distinct value, where `index` points at
/// the first item holding that value and `mask` names every port holding
/// it. Groups come out in order of first appearance.
pub fn group_equal<K: Eq + Hash>(items: &[(PortId, K)]) -> Vec<(usize, PortMask)> {
    let ports: Vec<PortId> = items.iter().map(|(port, _)| *port).collect();
    let mut uf = PortUnionFind::new(&ports);
    let mut first_seen: HashMap<&K, usize> = HashMap::with_capacity(items.len());

    for (i, (_, value)) in items.iter().enumerate() {
        match first_seen.get(value) {
            Some(&first) => {
                uf.union(first, i);
            }
            None => {
                first_seen.insert(value, i);
            }
        }
    }

    let mut groups: Vec<(usize, PortMask)> = first_seen
        .into_values()
        .map(|first| {
            let mask = uf.mask(first);
            (first, mask)
        })
        .collect();
    groups.sort_unstable_by_key(|(first, _)| *first);
    groups
}
