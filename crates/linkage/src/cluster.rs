use std::collections::HashMap;

use crate::model::{ClusterStatus, MatchDecision, Source};
use crate::table::RecordTable;

/// Disjoint sets over the dense record index arena.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<u32>,
    size: Vec<u32>,
}

impl UnionFind {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len as u32).collect(),
            size: vec![1; len],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] as usize != x {
            let grandparent = self.parent[self.parent[x] as usize];
            self.parent[x] = grandparent;
            x = grandparent as usize;
        }
        x
    }

    /// Merge the sets holding `a` and `b`. Returns false if already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra as u32;
        self.size[ra] += self.size[rb];
        true
    }
}

/// A connected component of accepted pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: u32,
    /// Sorted table indices.
    pub members: Vec<usize>,
    /// Accepted decisions joining the members, in acceptance order.
    pub decisions: Vec<MatchDecision>,
    pub status: ClusterStatus,
}

/// Group every record of `table` into clusters joined by `accepted`.
///
/// Ids run from 1 in order of each cluster's lowest member index, so they
/// depend only on the final components and not on the order pairs arrive.
pub fn build_clusters(table: &RecordTable, accepted: &[MatchDecision]) -> Vec<Cluster> {
    let mut uf = UnionFind::new(table.len());
    for d in accepted {
        uf.union(d.pair.census, d.pair.survey);
    }

    let mut by_root: HashMap<usize, usize> = HashMap::new();
    let mut clusters: Vec<Cluster> = Vec::new();
    for idx in 0..table.len() {
        let root = uf.find(idx);
        let slot = *by_root.entry(root).or_insert_with(|| {
            clusters.push(Cluster {
                id: clusters.len() as u32 + 1,
                members: Vec::new(),
                decisions: Vec::new(),
                status: ClusterStatus::Unique,
            });
            clusters.len() - 1
        });
        clusters[slot].members.push(idx);
    }

    for d in accepted {
        let slot = by_root[&uf.find(d.pair.census)];
        clusters[slot].decisions.push(d.clone());
    }

    for cluster in &mut clusters {
        let census = cluster
            .members
            .iter()
            .filter(|&&i| table.get(i).source == Source::Census)
            .count();
        let survey = cluster.members.len() - census;
        if census > 1 || survey > 1 {
            cluster.status = ClusterStatus::Multi;
        }
    }

    clusters
}
