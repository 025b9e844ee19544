use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::MatchKey;
use crate::model::{BlockReport, CandidatePair, Field, Record, Source};
use crate::table::RecordTable;

/// Records sharing identical blocking values, split by source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub key: Vec<String>,
    pub census: Vec<usize>,
    pub survey: Vec<usize>,
}

impl Block {
    pub fn pair_count(&self) -> usize {
        self.census.len().saturating_mul(self.survey.len())
    }

    /// Every cross-source pair in the block, skipping pairs in `settled`.
    pub fn pairs(&self, priority: u32, settled: &HashSet<(usize, usize)>) -> Vec<CandidatePair> {
        let mut out = Vec::with_capacity(self.pair_count());
        for &census in &self.census {
            for &survey in &self.survey {
                if settled.contains(&(census, survey)) {
                    continue;
                }
                out.push(CandidatePair {
                    census,
                    survey,
                    priority,
                });
            }
        }
        out
    }
}

/// Which records a match key may consider.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    All,
    /// Only `eligible` records, blocked within associated household pairs
    /// `(census household, survey household)`.
    Associative {
        households: &'a BTreeSet<(String, String)>,
        eligible: &'a [bool],
    },
}

#[derive(Debug, Default)]
pub struct Candidates {
    /// Blocks within the ceiling that have records on both sides, in key order.
    pub blocks: Vec<Block>,
    /// Blocks skipped for exceeding the ceiling.
    pub oversized: Vec<BlockReport>,
}

impl Candidates {
    pub fn pair_count(&self) -> usize {
        self.blocks.iter().map(Block::pair_count).sum()
    }
}

/// Partition the table into blocks for `key`.
///
/// A record with a null in any blocking field is left out of every block.
/// Blocks with an empty side are dropped; blocks above `max_block_pairs`
/// are reported instead of expanded.
pub fn generate_candidates(
    table: &RecordTable,
    key: &MatchKey,
    scope: Scope<'_>,
    max_block_pairs: usize,
) -> Candidates {
    let census_fields = key.census_fields();
    let survey_fields = key.survey_fields();
    let mut blocks: BTreeMap<Vec<String>, Block> = BTreeMap::new();

    let partners = match scope {
        Scope::All => None,
        Scope::Associative { households, .. } => Some(HouseholdPartners::new(households)),
    };

    for source in [Source::Census, Source::Survey] {
        let fields = match source {
            Source::Census => &census_fields,
            Source::Survey => &survey_fields,
        };
        for idx in table.range(source) {
            let record = table.get(idx);
            let Some(values) = block_values(record, fields) else {
                continue;
            };

            let keys = match (&scope, &partners) {
                (Scope::Associative { eligible, .. }, Some(partners)) => {
                    if !eligible[idx] {
                        continue;
                    }
                    partners.prefixed(record, &values)
                }
                _ => vec![values],
            };

            for block_key in keys {
                let block = blocks.entry(block_key.clone()).or_insert_with(|| Block {
                    key: block_key,
                    census: Vec::new(),
                    survey: Vec::new(),
                });
                match source {
                    Source::Census => block.census.push(idx),
                    Source::Survey => block.survey.push(idx),
                }
            }
        }
    }

    let mut candidates = Candidates::default();
    for block in blocks.into_values() {
        if block.census.is_empty() || block.survey.is_empty() {
            continue;
        }
        if block.pair_count() > max_block_pairs {
            log::warn!(
                "matchkey '{}': block [{}] has {} pairs (ceiling {}), skipped",
                key.name,
                block.key.join("|"),
                block.pair_count(),
                max_block_pairs
            );
            candidates.oversized.push(BlockReport {
                match_key: key.name.clone(),
                block_key: block.key.join("|"),
                census_records: block.census.len(),
                survey_records: block.survey.len(),
                pairs: block.pair_count(),
            });
            continue;
        }
        candidates.blocks.push(block);
    }

    log::debug!(
        "matchkey '{}': {} blocks, {} candidate pairs, {} oversized",
        key.name,
        candidates.blocks.len(),
        candidates.pair_count(),
        candidates.oversized.len()
    );

    candidates
}

fn block_values(record: &Record, fields: &[Field]) -> Option<Vec<String>> {
    fields
        .iter()
        .map(|f| record.value(*f).map(|v| v.into_owned()))
        .collect()
}

/// Household pair lookup for associative blocking.
struct HouseholdPartners<'a> {
    by_census: BTreeMap<&'a str, Vec<&'a str>>,
    by_survey: BTreeMap<&'a str, Vec<&'a str>>,
}

impl<'a> HouseholdPartners<'a> {
    fn new(households: &'a BTreeSet<(String, String)>) -> Self {
        let mut by_census: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut by_survey: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (census, survey) in households {
            by_census.entry(census).or_default().push(survey);
            by_survey.entry(survey).or_default().push(census);
        }
        Self { by_census, by_survey }
    }

    /// One block key per household pair the record's household belongs to.
    fn prefixed(&self, record: &Record, values: &[String]) -> Vec<Vec<String>> {
        let Some(household) = record.household_id.as_deref() else {
            return Vec::new();
        };
        let (lookup, census_side) = match record.source {
            Source::Census => (&self.by_census, true),
            Source::Survey => (&self.by_survey, false),
        };
        lookup
            .get(household)
            .map(|partners| {
                partners
                    .iter()
                    .map(|partner| {
                        let (c, s) = if census_side {
                            (household, *partner)
                        } else {
                            (*partner, household)
                        };
                        let mut key = Vec::with_capacity(values.len() + 2);
                        key.push(c.to_string());
                        key.push(s.to_string());
                        key.extend(values.iter().cloned());
                        key
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwapPair;

    fn person(source: Source, id: &str, forename: Option<&str>, dob: &str) -> Record {
        let mut r = Record::new(source, id).with(Field::Dob, dob);
        r.forename = forename.map(String::from);
        r
    }

    fn table(records: Vec<Record>) -> RecordTable {
        RecordTable::build(records, None).unwrap()
    }

    fn all_pairs(c: &Candidates) -> Vec<(usize, usize)> {
        c.blocks
            .iter()
            .flat_map(|b| b.pairs(1, &HashSet::new()))
            .map(|p| (p.census, p.survey))
            .collect()
    }

    #[test]
    fn cross_source_pairs_only() {
        let t = table(vec![
            person(Source::Census, "C1", Some("ANN"), "1990-01-01"),
            person(Source::Census, "C2", Some("ANN"), "1990-01-01"),
            person(Source::Survey, "P1", Some("ANN"), "1990-01-01"),
        ]);
        let key = MatchKey::blocking("mk", 1, &[Field::Forename, Field::Dob]);
        let c = generate_candidates(&t, &key, Scope::All, 100);
        assert_eq!(c.blocks.len(), 1);
        assert_eq!(all_pairs(&c), vec![(0, 2), (1, 2)]);
        for (a, b) in all_pairs(&c) {
            assert_ne!(t.get(a).source, t.get(b).source);
        }
    }

    #[test]
    fn one_sided_blocks_produce_nothing() {
        let t = table(vec![
            person(Source::Census, "C1", Some("ANN"), "1990-01-01"),
            person(Source::Census, "C2", Some("ANN"), "1990-01-01"),
            person(Source::Survey, "P1", Some("BOB"), "1990-01-01"),
        ]);
        let key = MatchKey::blocking("mk", 1, &[Field::Forename]);
        let c = generate_candidates(&t, &key, Scope::All, 100);
        assert!(c.blocks.is_empty());
        assert_eq!(c.pair_count(), 0);
    }

    #[test]
    fn null_block_field_excludes_record() {
        let t = table(vec![
            person(Source::Census, "C1", None, "1990-01-01"),
            person(Source::Survey, "P1", None, "1990-01-01"),
            person(Source::Survey, "P2", Some("ANN"), "1990-01-01"),
        ]);
        let key = MatchKey::blocking("mk", 1, &[Field::Forename, Field::Dob]);
        let c = generate_candidates(&t, &key, Scope::All, 100);
        assert!(c.blocks.is_empty());
    }

    #[test]
    fn oversized_block_reported_and_skipped() {
        let mut records = Vec::new();
        for i in 0..4 {
            records.push(person(Source::Census, &format!("C{i}"), Some("ANN"), "1990-01-01"));
            records.push(person(Source::Survey, &format!("P{i}"), Some("ANN"), "1990-01-01"));
        }
        records.push(person(Source::Census, "C9", Some("BOB"), "1980-01-01"));
        records.push(person(Source::Survey, "P9", Some("BOB"), "1980-01-01"));
        let t = table(records);
        let key = MatchKey::blocking("mk", 1, &[Field::Forename]);
        let c = generate_candidates(&t, &key, Scope::All, 15);

        assert_eq!(c.oversized.len(), 1);
        let report = &c.oversized[0];
        assert_eq!(report.block_key, "ANN");
        assert_eq!(report.pairs, 16);
        assert_eq!((report.census_records, report.survey_records), (4, 4));
        assert_eq!(c.blocks.len(), 1);
        assert_eq!(c.blocks[0].key, vec!["BOB"]);
    }

    #[test]
    fn settled_pairs_are_skipped() {
        let t = table(vec![
            person(Source::Census, "C1", Some("ANN"), "1990-01-01"),
            person(Source::Survey, "P1", Some("ANN"), "1990-01-01"),
            person(Source::Survey, "P2", Some("ANN"), "1990-01-01"),
        ]);
        let key = MatchKey::blocking("mk", 2, &[Field::Forename]);
        let c = generate_candidates(&t, &key, Scope::All, 100);
        let settled = HashSet::from([(0, 1)]);
        let pairs = c.blocks[0].pairs(2, &settled);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].census, pairs[0].survey, pairs[0].priority), (0, 2, 2));
    }

    #[test]
    fn swap_fields_compare_across_sides() {
        let mut c1 = Record::new(Source::Census, "C1").with(Field::Dob, "2000-02-02");
        c1.middle_name = Some("JONES".into());
        let mut p1 = Record::new(Source::Survey, "P1").with(Field::Dob, "2000-02-02");
        p1.surname = Some("JONES".into());
        let mut p2 = Record::new(Source::Survey, "P2").with(Field::Dob, "2000-02-02");
        p2.middle_name = Some("JONES".into());
        let t = table(vec![c1, p1, p2]);

        let mut key = MatchKey::blocking("swap", 1, &[Field::Dob]);
        key.swap.push(SwapPair {
            census: Field::MiddleName,
            survey: Field::Surname,
        });
        let c = generate_candidates(&t, &key, Scope::All, 100);
        assert_eq!(all_pairs(&c), vec![(0, 1)]);
    }

    #[test]
    fn associative_scope_blocks_within_household_pairs() {
        let hh = |r: Record, h: &str| Record {
            household_id: Some(h.into()),
            ..r
        };
        let t = table(vec![
            hh(person(Source::Census, "C1", Some("ANN"), "x"), "H1"),
            hh(person(Source::Census, "C2", Some("ANN"), "x"), "H2"),
            hh(person(Source::Survey, "P1", Some("ANN"), "x"), "S1"),
            hh(person(Source::Survey, "P2", Some("ANN"), "x"), "S2"),
        ]);
        let households = BTreeSet::from([("H1".to_string(), "S1".to_string())]);
        let eligible = vec![true; 4];
        let key = MatchKey::blocking("assoc", 3, &[Field::Forename]);
        let c = generate_candidates(
            &t,
            &key,
            Scope::Associative {
                households: &households,
                eligible: &eligible,
            },
            100,
        );
        assert_eq!(all_pairs(&c), vec![(0, 2)]);
        assert_eq!(c.blocks[0].key, vec!["H1", "S1", "ANN"]);
    }

    #[test]
    fn associative_scope_respects_eligibility() {
        let hh = |r: Record, h: &str| Record {
            household_id: Some(h.into()),
            ..r
        };
        let t = table(vec![
            hh(person(Source::Census, "C1", Some("ANN"), "x"), "H1"),
            hh(person(Source::Survey, "P1", Some("ANN"), "x"), "S1"),
        ]);
        let households = BTreeSet::from([("H1".to_string(), "S1".to_string())]);
        let eligible = vec![false, true];
        let key = MatchKey::blocking("assoc", 3, &[Field::Forename]);
        let c = generate_candidates(
            &t,
            &key,
            Scope::Associative {
                households: &households,
                eligible: &eligible,
            },
            100,
        );
        assert!(c.blocks.is_empty());
    }
}
