//! Conflict resolution over multi clusters.
//!
//! Each multi cluster is reduced to one-to-one links by taking accepted pairs
//! greedily in rank order `(priority, combined distance)`. A pair that ties
//! on rank with a still-viable competitor sharing one of its records cannot
//! be decided mechanically, so the whole cluster is sent to clerical review.

use std::cmp::Ordering;
use std::collections::HashSet;

use rayon::prelude::*;

use crate::cluster::Cluster;
use crate::config::MatchKey;
use crate::model::{
    ClericalCluster, ClusterStatus, ConflictReason, LinkedCluster, MatchDecision, PairEvidence,
    ResidualReason, ResidualRecord, ResidualSet,
};
use crate::scoring::DISTANCE_EPSILON;
use crate::table::RecordTable;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub linked: Vec<LinkedCluster>,
    pub clerical: Vec<ClericalCluster>,
    pub residuals: ResidualSet,
}

/// What happened to one cluster, before final ids are handed out.
#[derive(Debug)]
enum Verdict<'a> {
    Unmatched(usize),
    Linked {
        kept: Vec<&'a MatchDecision>,
        ejected: Vec<usize>,
        resolved: bool,
    },
    Clerical(ConflictReason),
}

/// Compare two accepted pairs by `(priority, combined distance)`.
/// Distances within `DISTANCE_EPSILON` of each other rank equal.
pub fn rank_cmp(a: &MatchDecision, b: &MatchDecision) -> Ordering {
    a.pair.priority.cmp(&b.pair.priority).then_with(|| {
        let (da, db) = (a.evidence.combined_distance(), b.evidence.combined_distance());
        if (da - db).abs() <= DISTANCE_EPSILON {
            Ordering::Equal
        } else {
            da.total_cmp(&db)
        }
    })
}

fn shares_record(a: &MatchDecision, b: &MatchDecision) -> bool {
    a.pair.census == b.pair.census || a.pair.survey == b.pair.survey
}

/// Greedy one-to-one selection. Returns `None` on an unbreakable tie.
fn select_pairs(decisions: &[MatchDecision]) -> Option<Vec<&MatchDecision>> {
    let mut ranked: Vec<&MatchDecision> = decisions.iter().collect();
    ranked.sort_by(|a, b| {
        a.pair
            .priority
            .cmp(&b.pair.priority)
            .then(a.evidence.combined_distance().total_cmp(&b.evidence.combined_distance()))
            .then(a.pair.census.cmp(&b.pair.census))
            .then(a.pair.survey.cmp(&b.pair.survey))
    });

    let mut used: HashSet<usize> = HashSet::new();
    let viable = |d: &MatchDecision, used: &HashSet<usize>| {
        !used.contains(&d.pair.census) && !used.contains(&d.pair.survey)
    };
    let mut kept = Vec::new();

    for (i, &d) in ranked.iter().enumerate() {
        if !viable(d, &used) {
            continue;
        }
        let tied = ranked.iter().enumerate().any(|(j, &other)| {
            j != i
                && viable(other, &used)
                && shares_record(d, other)
                && rank_cmp(d, other) == Ordering::Equal
        });
        if tied {
            return None;
        }
        used.insert(d.pair.census);
        used.insert(d.pair.survey);
        kept.push(d);
    }

    Some(kept)
}

fn judge(cluster: &Cluster, max_cluster_size: usize) -> Verdict<'_> {
    if cluster.decisions.is_empty() {
        return Verdict::Unmatched(cluster.members[0]);
    }

    match cluster.status {
        ClusterStatus::Unique => {
            let best = cluster
                .decisions
                .iter()
                .min_by(|a, b| rank_cmp(a, b));
            Verdict::Linked {
                kept: best.into_iter().collect(),
                ejected: Vec::new(),
                resolved: false,
            }
        }
        _ if cluster.members.len() > max_cluster_size => {
            log::warn!(
                "cluster {}: {} members exceeds ceiling {}, sent to clerical review",
                cluster.id,
                cluster.members.len(),
                max_cluster_size
            );
            Verdict::Clerical(ConflictReason::OversizedCluster)
        }
        _ => match select_pairs(&cluster.decisions) {
            Some(kept) => {
                let ejected = cluster
                    .members
                    .iter()
                    .copied()
                    .filter(|&m| !kept.iter().any(|d| d.pair.census == m || d.pair.survey == m))
                    .collect();
                Verdict::Linked {
                    kept,
                    ejected,
                    resolved: true,
                }
            }
            None => {
                log::debug!("cluster {}: tied candidates, sent to clerical review", cluster.id);
                Verdict::Clerical(ConflictReason::TiedCandidates)
            }
        },
    }
}

pub fn pair_evidence(table: &RecordTable, keys: &[MatchKey], d: &MatchDecision) -> PairEvidence {
    PairEvidence {
        census_id: table.get(d.pair.census).record_id.clone(),
        survey_id: table.get(d.pair.survey).record_id.clone(),
        match_key: keys
            .iter()
            .find(|k| k.priority == d.pair.priority)
            .map(|k| k.name.clone())
            .unwrap_or_default(),
        priority: d.pair.priority,
        distance: d.evidence.combined_distance(),
        age_difference: d.evidence.age_difference,
        multi_match: d.multi_match,
    }
}

/// Links resolution would keep if it ran over `clusters` now, and the
/// members of clusters it would hold back for clerical review.
#[derive(Debug, Default)]
pub struct Provisional<'a> {
    pub kept: Vec<&'a MatchDecision>,
    pub held: Vec<usize>,
}

/// Resolve without finalizing. Used between the main and associative keys
/// so that only one-to-one links associate households.
pub fn provisional(clusters: &[Cluster], max_cluster_size: usize) -> Provisional<'_> {
    let verdicts: Vec<(&Cluster, Verdict<'_>)> = clusters
        .par_iter()
        .map(|c| (c, judge(c, max_cluster_size)))
        .collect();

    let mut out = Provisional::default();
    for (cluster, verdict) in verdicts {
        match verdict {
            Verdict::Linked { kept, .. } => out.kept.extend(kept),
            Verdict::Clerical(_) => out.held.extend(cluster.members.iter().copied()),
            Verdict::Unmatched(_) => {}
        }
    }
    out
}

/// Finalize every cluster into linked, clerical or residual output.
///
/// Clusters are judged independently in parallel. A split hands the first
/// kept pair the original id and later pairs fresh ids after the highest
/// existing id, in cluster order then rank order.
pub fn resolve(
    table: &RecordTable,
    clusters: &[Cluster],
    keys: &[MatchKey],
    max_cluster_size: usize,
) -> Resolution {
    let verdicts: Vec<Verdict<'_>> = clusters
        .par_iter()
        .map(|c| judge(c, max_cluster_size))
        .collect();

    let mut next_id = clusters.iter().map(|c| c.id).max().unwrap_or(0) + 1;
    let mut out = Resolution::default();

    for (cluster, verdict) in clusters.iter().zip(verdicts) {
        match verdict {
            Verdict::Unmatched(idx) => {
                let record = table.get(idx);
                out.residuals.push(
                    record.source,
                    ResidualRecord {
                        record_id: record.record_id.clone(),
                        reason: ResidualReason::Unmatched,
                    },
                );
            }
            Verdict::Linked {
                kept,
                ejected,
                resolved,
            } => {
                for (n, d) in kept.into_iter().enumerate() {
                    let cluster_id = if n == 0 {
                        cluster.id
                    } else {
                        next_id += 1;
                        next_id - 1
                    };
                    out.linked.push(LinkedCluster {
                        cluster_id,
                        members: vec![table.member(d.pair.census), table.member(d.pair.survey)],
                        pair: pair_evidence(table, keys, d),
                        status: ClusterStatus::Unique,
                        resolved,
                        reviewed: false,
                    });
                }
                for idx in ejected {
                    let record = table.get(idx);
                    out.residuals.push(
                        record.source,
                        ResidualRecord {
                            record_id: record.record_id.clone(),
                            reason: ResidualReason::Ejected {
                                cluster_id: cluster.id,
                            },
                        },
                    );
                }
            }
            Verdict::Clerical(reason) => out.clerical.push(ClericalCluster {
                cluster_id: cluster.id,
                members: cluster.members.iter().map(|&m| table.member(m)).collect(),
                status: match reason {
                    ConflictReason::TiedCandidates => ClusterStatus::Conflict,
                    ConflictReason::OversizedCluster => ClusterStatus::Multi,
                },
                reason,
                competing: cluster
                    .decisions
                    .iter()
                    .map(|d| pair_evidence(table, keys, d))
                    .collect(),
            }),
        }
    }

    out.linked.sort_by_key(|l| l.cluster_id);
    out.residuals.census.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    out.residuals.survey.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    out
}
