use std::collections::{BTreeMap, HashSet};

use crate::crow::Resolution;
use crate::error::LinkError;
use crate::model::{AreaRate, LinkSummary, Source};
use crate::table::RecordTable;

/// Pair-level counters gathered while running the match keys.
#[derive(Debug, Clone, Default)]
pub struct PairStats {
    pub candidate_pairs: usize,
    pub multi_match_pairs: usize,
    pub oversized_blocks: usize,
    pub accepted_by_key: BTreeMap<String, usize>,
}

/// Compute summary statistics from the final resolution.
pub fn compute_summary(
    table: &RecordTable,
    stats: &PairStats,
    clusters: usize,
    resolution: &Resolution,
) -> LinkSummary {
    let census_records = table.count(Source::Census);
    let survey_records = table.count(Source::Survey);
    let linked = resolution.linked.len();
    let rate = |linked: usize, total: usize| if total == 0 { 0.0 } else { linked as f64 / total as f64 };

    let linked_ids: HashSet<(Source, &str)> = resolution
        .linked
        .iter()
        .flat_map(|l| l.members.iter().map(|m| (m.source, m.record_id.as_str())))
        .collect();

    let mut link_rate_by_area: BTreeMap<String, AreaRate> = BTreeMap::new();
    for record in table.records() {
        let Some(area) = record.area_id.as_deref() else {
            continue;
        };
        let entry = link_rate_by_area.entry(area.to_string()).or_default();
        let is_linked = linked_ids.contains(&(record.source, record.record_id.as_str()));
        match record.source {
            Source::Census => {
                entry.census_records += 1;
                entry.census_linked += usize::from(is_linked);
            }
            Source::Survey => {
                entry.survey_records += 1;
                entry.survey_linked += usize::from(is_linked);
            }
        }
    }
    for entry in link_rate_by_area.values_mut() {
        entry.census_link_rate = rate(entry.census_linked, entry.census_records);
        entry.survey_link_rate = rate(entry.survey_linked, entry.survey_records);
    }

    LinkSummary {
        census_records,
        survey_records,
        candidate_pairs: stats.candidate_pairs,
        accepted_pairs: stats.accepted_by_key.values().sum(),
        multi_match_pairs: stats.multi_match_pairs,
        clusters,
        linked,
        resolved: resolution.linked.iter().filter(|l| l.resolved).count(),
        reviewed: resolution.linked.iter().filter(|l| l.reviewed).count(),
        clerical: resolution.clerical.len(),
        residual_census: resolution.residuals.census.len(),
        residual_survey: resolution.residuals.survey.len(),
        oversized_blocks: stats.oversized_blocks,
        accepted_by_key: stats.accepted_by_key.clone(),
        survey_link_rate: rate(linked, survey_records),
        census_link_rate: rate(linked, census_records),
        link_rate_by_area,
    }
}

/// Every record must land in exactly one of linked, clerical or residual.
pub fn verify_partition(table: &RecordTable, resolution: &Resolution) -> Result<(), LinkError> {
    let mut seen: HashSet<(Source, &str)> = HashSet::with_capacity(table.len());

    for link in &resolution.linked {
        for m in &link.members {
            place(&mut seen, m.source, &m.record_id, "linked")?;
        }
    }
    for cluster in &resolution.clerical {
        for m in &cluster.members {
            place(&mut seen, m.source, &m.record_id, "clerical")?;
        }
    }
    for r in &resolution.residuals.census {
        place(&mut seen, Source::Census, &r.record_id, "residuals")?;
    }
    for r in &resolution.residuals.survey {
        place(&mut seen, Source::Survey, &r.record_id, "residuals")?;
    }

    if let Some(r) = table
        .records()
        .iter()
        .find(|r| !seen.contains(&(r.source, r.record_id.as_str())))
    {
        return Err(LinkError::Integrity(format!(
            "{} record '{}' is missing from the output",
            r.source, r.record_id
        )));
    }
    if seen.len() != table.len() {
        return Err(LinkError::Integrity(format!(
            "output holds {} records but the input has {}",
            seen.len(),
            table.len()
        )));
    }
    Ok(())
}

fn place<'a>(
    seen: &mut HashSet<(Source, &'a str)>,
    source: Source,
    id: &'a str,
    collection: &str,
) -> Result<(), LinkError> {
    if !seen.insert((source, id)) {
        return Err(LinkError::Integrity(format!(
            "{source} record '{id}' appears more than once (last in {collection})"
        )));
    }
    Ok(())
}
