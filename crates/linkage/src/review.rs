//! Clerical review decisions fed back into a resolution.
//!
//! A reviewer takes `clerical.csv`, keeps the rows for the pairs they accept
//! and hands the file back. Each kept row becomes a finalized link; members of
//! a reviewed cluster that no kept row names become residuals ejected from
//! that cluster. A row naming a cluster with both ids blank records that the
//! cluster was reviewed and nothing in it links.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::crow::Resolution;
use crate::error::LinkError;
use crate::model::{
    ClericalCluster, ClusterStatus, LinkedCluster, MemberRef, ResidualReason, ResidualRecord,
    Source,
};

/// One reviewer row. Extra columns (status, reason, distance ...) are ignored
/// so a filtered `clerical.csv` can be fed back as is.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewDecision {
    pub cluster_id: u32,
    #[serde(default)]
    pub census_id: Option<String>,
    #[serde(default)]
    pub survey_id: Option<String>,
}

impl ReviewDecision {
    pub fn keep(cluster_id: u32, census_id: &str, survey_id: &str) -> Self {
        Self {
            cluster_id,
            census_id: Some(census_id.to_string()),
            survey_id: Some(survey_id.to_string()),
        }
    }

    pub fn reject_all(cluster_id: u32) -> Self {
        Self { cluster_id, census_id: None, survey_id: None }
    }
}

pub fn load_review_decisions(csv_data: &str) -> Result<Vec<ReviewDecision>, LinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    reader
        .deserialize()
        .enumerate()
        .map(|(line, row)| {
            row.map_err(|e| LinkError::Review {
                cluster_id: None,
                message: format!("row {}: {e}", line + 2),
            })
        })
        .collect()
}

/// Apply `decisions` to the clerical clusters of `resolution`.
///
/// Clusters no decision names stay in clerical review. Links after the first
/// in a cluster take fresh ids from `first_free_id` upward, in cluster order.
/// Returns the number of clusters settled.
pub fn apply_review(
    resolution: &mut Resolution,
    decisions: &[ReviewDecision],
    first_free_id: u32,
) -> Result<usize, LinkError> {
    let mut by_cluster: BTreeMap<u32, Vec<&ReviewDecision>> = BTreeMap::new();
    for d in decisions {
        by_cluster.entry(d.cluster_id).or_default().push(d);
    }

    // Check every cluster before touching the resolution so a bad file
    // leaves it unchanged.
    let mut settled = Vec::with_capacity(by_cluster.len());
    for (&cluster_id, rows) in &by_cluster {
        let pos = resolution
            .clerical
            .iter()
            .position(|c| c.cluster_id == cluster_id)
            .ok_or_else(|| review_err(cluster_id, "no clerical cluster has this id"))?;
        let kept = kept_pairs(&resolution.clerical[pos], rows)?;
        settled.push((cluster_id, kept));
    }

    let mut next_id = first_free_id;
    for (cluster_id, kept) in &settled {
        let Some(pos) = resolution.clerical.iter().position(|c| c.cluster_id == *cluster_id) else {
            continue;
        };
        let cluster = resolution.clerical.remove(pos);

        let mut linked: HashSet<(Source, &str)> = HashSet::new();
        for (n, &i) in kept.iter().enumerate() {
            let pair = cluster.competing[i].clone();
            let id = if n == 0 {
                *cluster_id
            } else {
                next_id += 1;
                next_id - 1
            };
            linked.insert((Source::Census, cluster.competing[i].census_id.as_str()));
            linked.insert((Source::Survey, cluster.competing[i].survey_id.as_str()));
            resolution.linked.push(LinkedCluster {
                cluster_id: id,
                members: vec![
                    MemberRef { source: Source::Census, record_id: pair.census_id.clone() },
                    MemberRef { source: Source::Survey, record_id: pair.survey_id.clone() },
                ],
                pair,
                status: ClusterStatus::Unique,
                resolved: false,
                reviewed: true,
            });
        }
        for m in &cluster.members {
            if !linked.contains(&(m.source, m.record_id.as_str())) {
                resolution.residuals.push(
                    m.source,
                    ResidualRecord {
                        record_id: m.record_id.clone(),
                        reason: ResidualReason::Ejected { cluster_id: *cluster_id },
                    },
                );
            }
        }
        log::debug!("cluster {cluster_id}: reviewer kept {} link(s)", kept.len());
    }

    resolution.linked.sort_by_key(|l| l.cluster_id);
    resolution.residuals.census.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    resolution.residuals.survey.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    Ok(settled.len())
}

/// Indices into `cluster.competing` of the pairs the reviewer kept.
fn kept_pairs(cluster: &ClericalCluster, rows: &[&ReviewDecision]) -> Result<Vec<usize>, LinkError> {
    let id = cluster.cluster_id;
    let mut kept = Vec::new();
    let mut census_used = HashSet::new();
    let mut survey_used = HashSet::new();

    for row in rows {
        let (census_id, survey_id) = match (row.census_id.as_deref(), row.survey_id.as_deref()) {
            (None, None) => continue,
            (Some(c), Some(s)) => (c, s),
            (Some(c), None) => {
                return Err(review_err(id, format!("census record '{c}' has no survey record")))
            }
            (None, Some(s)) => {
                return Err(review_err(id, format!("survey record '{s}' has no census record")))
            }
        };
        let i = cluster
            .competing
            .iter()
            .position(|p| p.census_id == census_id && p.survey_id == survey_id)
            .ok_or_else(|| {
                review_err(id, format!("{census_id}/{survey_id} is not a competing pair"))
            })?;
        if !census_used.insert(census_id) {
            return Err(review_err(id, format!("census record '{census_id}' is kept twice")));
        }
        if !survey_used.insert(survey_id) {
            return Err(review_err(id, format!("survey record '{survey_id}' is kept twice")));
        }
        kept.push(i);
    }
    Ok(kept)
}

fn review_err(cluster_id: u32, message: impl Into<String>) -> LinkError {
    LinkError::Review { cluster_id: Some(cluster_id), message: message.into() }
}
