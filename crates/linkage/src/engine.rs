use std::collections::{BTreeSet, HashSet};

use rayon::prelude::*;

use crate::blocking::{generate_candidates, Scope};
use crate::cluster::build_clusters;
use crate::config::{InputConfig, LinkConfig, MatchKey};
use crate::crow::{provisional, resolve, Provisional};
use crate::error::LinkError;
use crate::evidence::{compute_summary, verify_partition, PairStats};
use crate::model::{
    BlockReport, Field, LinkInput, LinkMeta, LinkResult, MatchDecision, Outcome, Record, Source,
};
use crate::review::{apply_review, ReviewDecision};
use crate::scoring::{flag_multi_matches, score_block};
use crate::table::RecordTable;

/// Run linkage per config. Returns the finalized partition plus summary.
pub fn run(config: &LinkConfig, input: LinkInput) -> Result<LinkResult, LinkError> {
    run_with_review(config, input, &[])
}

/// Run linkage, then settle the clerical clusters a reviewer has decided.
///
/// Cluster ids are deterministic for a given config and input, so decisions
/// taken on one run's `clerical.csv` apply to a rerun over the same data.
pub fn run_with_review(
    config: &LinkConfig,
    input: LinkInput,
    review: &[ReviewDecision],
) -> Result<LinkResult, LinkError> {
    let keys = config.match_keys()?;
    let table = RecordTable::build(input.records, input.manifest.as_ref())?;

    log::info!(
        "linking {} census and {} survey records with {} match keys",
        table.count(Source::Census),
        table.count(Source::Survey),
        keys.len()
    );

    let mut pass = KeyPass::new(&table, config.max_block_pairs);
    for key in keys.iter().filter(|k| !k.associative) {
        pass.run_key(key, Scope::All);
    }

    let associative: Vec<&MatchKey> = keys.iter().filter(|k| k.associative).collect();
    if !associative.is_empty() {
        let main_clusters = build_clusters(&table, &pass.accepted);
        let settled = provisional(&main_clusters, config.max_cluster_size);
        let households = pass.household_pairs(&settled.kept);
        let eligible = pass.eligible(&settled);
        log::debug!(
            "associative pass: {} household pairs, {} eligible records",
            households.len(),
            eligible.iter().filter(|e| **e).count()
        );
        for key in associative {
            pass.run_key(
                key,
                Scope::Associative {
                    households: &households,
                    eligible: &eligible,
                },
            );
        }
    }

    let KeyPass {
        accepted,
        stats,
        blocking,
        ..
    } = pass;

    let clusters = build_clusters(&table, &accepted);
    let mut resolution = resolve(&table, &clusters, &keys, config.max_cluster_size);
    if !review.is_empty() {
        let first_free_id = clusters
            .iter()
            .map(|c| c.id)
            .chain(resolution.linked.iter().map(|l| l.cluster_id))
            .max()
            .unwrap_or(0)
            + 1;
        let settled = apply_review(&mut resolution, review, first_free_id)?;
        log::info!("applied clerical review to {settled} cluster(s)");
    }
    verify_partition(&table, &resolution)?;

    let summary = compute_summary(&table, &stats, clusters.len(), &resolution);
    log::info!(
        "{} linked ({} resolved, {} reviewed), {} clerical, {} census / {} survey residuals",
        summary.linked,
        summary.resolved,
        summary.reviewed,
        summary.clerical,
        summary.residual_census,
        summary.residual_survey
    );

    Ok(LinkResult {
        meta: LinkMeta {
            config_name: config.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
            match_keys: keys.iter().map(|k| k.name.clone()).collect(),
        },
        summary,
        linked: resolution.linked,
        clerical: resolution.clerical,
        residuals: resolution.residuals,
        blocking,
    })
}

/// Accepted-pair state carried from one match key to the next.
struct KeyPass<'t> {
    table: &'t RecordTable,
    max_block_pairs: usize,
    settled: HashSet<(usize, usize)>,
    accepted: Vec<MatchDecision>,
    stats: PairStats,
    blocking: Vec<BlockReport>,
}

impl<'t> KeyPass<'t> {
    fn new(table: &'t RecordTable, max_block_pairs: usize) -> Self {
        Self {
            table,
            max_block_pairs,
            settled: HashSet::new(),
            accepted: Vec::new(),
            stats: PairStats::default(),
            blocking: Vec::new(),
        }
    }

    fn run_key(&mut self, key: &MatchKey, scope: Scope<'_>) {
        let candidates = generate_candidates(self.table, key, scope, self.max_block_pairs);

        let settled = &self.settled;
        let table = self.table;
        let mut decisions: Vec<MatchDecision> = candidates
            .blocks
            .par_iter()
            .map(|block| score_block(table, key, &block.pairs(key.priority, settled)))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        let scored = decisions.len();
        let undecided = decisions.iter().filter(|d| d.outcome == Outcome::Residual).count();
        decisions.retain(|d| d.outcome == Outcome::Accepted);
        let multi = flag_multi_matches(&mut decisions);

        log::debug!(
            "matchkey '{}' (priority {}): {} scored, {} accepted, {} multi-match, {} undecided",
            key.name,
            key.priority,
            scored,
            decisions.len(),
            multi,
            undecided
        );

        self.stats.candidate_pairs += scored;
        self.stats.multi_match_pairs += multi;
        self.stats.oversized_blocks += candidates.oversized.len();
        self.stats
            .accepted_by_key
            .insert(key.name.clone(), decisions.len());
        self.blocking.extend(candidates.oversized);

        for d in &decisions {
            self.settled.insert((d.pair.census, d.pair.survey));
        }
        self.accepted.extend(decisions);
    }

    /// `(census household, survey household)` for every kept link where
    /// both households are known. Pairs that lost resolution or wait on
    /// clerical review associate nothing.
    fn household_pairs(&self, links: &[&MatchDecision]) -> BTreeSet<(String, String)> {
        links
            .iter()
            .filter_map(|d| {
                let census = self.table.get(d.pair.census).household_id.clone()?;
                let survey = self.table.get(d.pair.survey).household_id.clone()?;
                Some((census, survey))
            })
            .collect()
    }

    /// Per table index, whether the record may take an associative link:
    /// it is neither in a kept link nor held for clerical review. Records
    /// ejected by resolution stay eligible.
    fn eligible(&self, settled: &Provisional<'_>) -> Vec<bool> {
        let mut eligible = vec![true; self.table.len()];
        for d in &settled.kept {
            eligible[d.pair.census] = false;
            eligible[d.pair.survey] = false;
        }
        for &idx in &settled.held {
            eligible[idx] = false;
        }
        eligible
    }
}

/// Parse a standardized CSV into records of `source`.
///
/// Columns are found by header: `input.id_column` for the id and each
/// field's canonical name unless overridden. A field in `required` with no
/// column is an error; other absent columns leave the field null. Values
/// listed in `input.missing_values` (after trimming) become null.
pub fn load_csv_records(
    source: Source,
    csv_data: &str,
    input: &InputConfig,
    required: &BTreeSet<Field>,
) -> Result<Vec<Record>, LinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| LinkError::Io(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let idx = |name: &str| headers.iter().position(|h| h == name);

    let id_idx = idx(&input.id_column).ok_or_else(|| LinkError::MissingColumn {
        source,
        column: input.id_column.clone(),
    })?;

    let mut columns: Vec<(Field, usize)> = Vec::new();
    for field in Field::ALL {
        let column = input.column_for(field);
        match idx(column) {
            Some(i) => columns.push((field, i)),
            None if required.contains(&field) => {
                return Err(LinkError::MissingColumn {
                    source,
                    column: column.to_string(),
                })
            }
            None => {}
        }
    }

    let is_missing = |v: &str| input.missing_values.iter().any(|m| m == v);

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| LinkError::Io(e.to_string()))?;
        let record_id = row.get(id_idx).unwrap_or("").trim();
        if record_id.is_empty() || is_missing(record_id) {
            return Err(LinkError::Io(format!(
                "{source}: row {} has no record id",
                line + 2
            )));
        }

        let mut record = Record::new(source, record_id);
        for &(field, i) in &columns {
            let value = row.get(i).unwrap_or("").trim();
            if is_missing(value) {
                continue;
            }
            if field == Field::Age {
                record.age = Some(value.parse().map_err(|_| LinkError::AgeParse {
                    source,
                    record_id: record_id.to_string(),
                    value: value.to_string(),
                })?);
            } else {
                record.set_text(field, Some(value.to_string()));
            }
        }
        records.push(record);
    }

    Ok(records)
}

/// Parse a manifest: one record id per line, blank lines and `#` comments
/// ignored.
pub fn parse_manifest_ids(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResidualReason;

    fn input_config() -> InputConfig {
        InputConfig {
            file: "x.csv".into(),
            id_column: "puid".into(),
            columns: [("area".to_string(), "ea".to_string())].into(),
            missing_values: vec!["".into(), "-9".into()],
            manifest: None,
        }
    }

    #[test]
    fn load_csv_maps_columns_and_sentinels() {
        let csv = "\
puid,forename,surname,ea,age,sex
C1,JON,SMITH,E01,34,1
C2,-9,JONES,E01,,2
";
        let required = BTreeSet::from([Field::Forename, Field::Area]);
        let records = load_csv_records(Source::Census, csv, &input_config(), &required).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_id, "C1");
        assert_eq!(records[0].area_id.as_deref(), Some("E01"));
        assert_eq!(records[0].age, Some(34));
        assert_eq!(records[1].forename, None);
        assert_eq!(records[1].age, None);
        assert_eq!(records[1].dob, None);
    }

    #[test]
    fn load_csv_missing_required_column() {
        let csv = "puid,forename\nC1,JON\n";
        let required = BTreeSet::from([Field::Dob]);
        let err = load_csv_records(Source::Survey, csv, &input_config(), &required).unwrap_err();
        assert!(matches!(err, LinkError::MissingColumn { ref column, .. } if column == "dob"));
    }

    #[test]
    fn load_csv_bad_age() {
        let csv = "puid,age\nC1,thirty\n";
        let err = load_csv_records(Source::Census, csv, &input_config(), &BTreeSet::new()).unwrap_err();
        assert!(err.to_string().contains("cannot parse age 'thirty'"));
    }

    #[test]
    fn load_csv_requires_id() {
        let csv = "puid,forename\n,JON\n";
        let err = load_csv_records(Source::Census, csv, &input_config(), &BTreeSet::new()).unwrap_err();
        assert!(err.to_string().contains("row 2 has no record id"));
    }

    #[test]
    fn manifest_ignores_blanks_and_comments() {
        let ids = parse_manifest_ids("# census\nC1\n\n  C2  \n");
        assert_eq!(ids, BTreeSet::from(["C1".to_string(), "C2".to_string()]));
    }

    fn config(extra: &str) -> LinkConfig {
        LinkConfig::from_toml(&format!(
            r#"
name = "test"
[[matchkeys]]
name = "name_dob"
block = ["dob"]
age = {{ mode = "fixed", tolerance = 0 }}
[[matchkeys.distance]]
field = "full_name"
threshold = 0.2
{extra}
"#
        ))
        .unwrap()
    }

    fn person(source: Source, id: &str, hh: &str, name: &str, dob: &str, age: &str) -> Record {
        Record::new(source, id)
            .with(Field::Household, hh)
            .with(Field::FullName, name)
            .with(Field::Dob, dob)
            .with(Field::Age, age)
    }

    #[test]
    fn run_links_near_identical_names() {
        let input = LinkInput {
            records: vec![
                person(Source::Census, "P1", "H1", "JON SMITH", "1990-01-01", "34"),
                person(Source::Survey, "P2", "S1", "JOHN SMITH", "1990-01-01", "34"),
            ],
            manifest: None,
        };
        let result = run(&config(""), input).unwrap();
        assert_eq!(result.linked.len(), 1);
        assert_eq!(result.linked[0].members.len(), 2);
        assert!(!result.linked[0].resolved);
        assert!(result.residuals.is_empty());
        assert_eq!(result.summary.accepted_by_key["name_dob"], 1);
        assert_eq!(result.meta.match_keys, vec!["name_dob"]);
    }

    #[test]
    fn run_associative_pass_links_household_members() {
        let assoc = r#"
[associative]
[[associative.matchkeys]]
name = "assoc_name"
block = ["forename"]
"#;
        let input = LinkInput {
            records: vec![
                person(Source::Census, "C1", "H1", "ANN LEE", "1980-05-05", "44"),
                person(Source::Survey, "P1", "S1", "ANN LEE", "1980-05-05", "44"),
                // Child with a wrong dob in the survey; only the household ties them.
                person(Source::Census, "C2", "H1", "TOM LEE", "2015-03-03", "9").with(Field::Forename, "TOM"),
                person(Source::Survey, "P2", "S1", "TOM LEE", "2015-03-04", "9").with(Field::Forename, "TOM"),
                // Same forename but a household with no association.
                person(Source::Survey, "P3", "S9", "TOM KAY", "2001-01-01", "23").with(Field::Forename, "TOM"),
            ],
            manifest: None,
        };
        let result = run(&config(assoc), input).unwrap();
        assert_eq!(result.linked.len(), 2);
        let assoc_link = result
            .linked
            .iter()
            .find(|l| l.pair.match_key == "assoc_name")
            .unwrap();
        assert_eq!(assoc_link.pair.census_id, "C2");
        assert_eq!(assoc_link.pair.survey_id, "P2");
        assert_eq!(assoc_link.pair.priority, 2);
        assert_eq!(result.residuals.survey.len(), 1);
        assert_eq!(result.residuals.survey[0].record_id, "P3");
        assert_eq!(result.residuals.survey[0].reason, ResidualReason::Unmatched);
    }

    const ASSOC_FORENAME: &str = r#"
[associative]
[[associative.matchkeys]]
name = "assoc_forename"
block = ["forename"]
"#;

    /// C1 and C2 compete for P1; C3 (C2's household) and P3 (P1's
    /// household) share a forename but not a dob.
    fn contested_households(c2_name: &str) -> Vec<Record> {
        vec![
            person(Source::Census, "C1", "H1", "ANN LEE", "1980-05-05", "44"),
            person(Source::Census, "C2", "H2", c2_name, "1980-05-05", "44"),
            person(Source::Survey, "P1", "S1", "ANN LEE", "1980-05-05", "44"),
            person(Source::Census, "C3", "H2", "TOM LEE", "2015-03-03", "9").with(Field::Forename, "TOM"),
            person(Source::Survey, "P3", "S1", "TOM LEE", "2015-03-04", "9").with(Field::Forename, "TOM"),
        ]
    }

    #[test]
    fn ejected_pair_does_not_associate_households() {
        let input = LinkInput {
            records: contested_households("ANNE LEE"),
            manifest: None,
        };
        let result = run(&config(ASSOC_FORENAME), input).unwrap();

        assert_eq!(result.linked.len(), 1);
        assert_eq!(result.linked[0].pair.census_id, "C1");
        assert_eq!(result.summary.accepted_by_key["assoc_forename"], 0);
        let census: Vec<(&str, ResidualReason)> = result
            .residuals
            .census
            .iter()
            .map(|r| (r.record_id.as_str(), r.reason))
            .collect();
        assert_eq!(
            census,
            vec![
                ("C2", ResidualReason::Ejected { cluster_id: 1 }),
                ("C3", ResidualReason::Unmatched),
            ]
        );
        assert_eq!(result.residuals.survey[0].record_id, "P3");
    }

    #[test]
    fn clerical_cluster_does_not_associate_households() {
        let input = LinkInput {
            records: contested_households("ANN LEE"),
            manifest: None,
        };
        let result = run(&config(ASSOC_FORENAME), input).unwrap();

        assert!(result.linked.is_empty());
        assert_eq!(result.clerical.len(), 1);
        assert_eq!(result.summary.accepted_by_key["assoc_forename"], 0);
        let residual: Vec<&str> = result
            .residuals
            .census
            .iter()
            .chain(&result.residuals.survey)
            .map(|r| r.record_id.as_str())
            .collect();
        assert_eq!(residual, vec!["C3", "P3"]);
    }

    #[test]
    fn run_rejects_manifest_drift() {
        let input = LinkInput {
            records: vec![person(Source::Census, "C1", "H1", "A", "x", "1")],
            manifest: Some(crate::model::Manifest {
                ids: [(Source::Census, ["C1".to_string(), "C2".to_string()].into())].into(),
            }),
        };
        let err = run(&config(""), input).unwrap_err();
        assert!(matches!(err, LinkError::MissingRecord { .. }));
    }
}
