use std::collections::HashMap;

use crate::config::{AgeCriterion, DistanceRule, MatchKey};
use crate::model::{CandidatePair, Evidence, Failure, Field, FieldDistance, MatchDecision, Outcome};
use crate::table::RecordTable;

/// Slack applied when comparing a normalized distance against its threshold.
pub const DISTANCE_EPSILON: f64 = 1e-9;

/// Levenshtein distance over chars, and the same distance divided by the
/// longer string's length. Two empty strings are identical.
pub fn normalized_levenshtein(a: &str, b: &str) -> (usize, f64) {
    let raw = strsim::levenshtein(a, b);
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return (0, 0.0);
    }
    (raw, raw as f64 / longest as f64)
}

/// Largest accepted age difference for the banded criterion. The band is
/// picked by the older of the two ages.
pub fn banded_tolerance(age_a: u32, age_b: u32) -> u32 {
    match age_a.max(age_b) {
        0..=10 => 1,
        11..=20 => 2,
        21..=40 => 3,
        _ => 4,
    }
}

pub fn age_agrees(criterion: AgeCriterion, age_a: u32, age_b: u32) -> bool {
    let diff = age_a.abs_diff(age_b);
    match criterion {
        AgeCriterion::Fixed { tolerance } => diff <= tolerance,
        AgeCriterion::Banded => diff <= banded_tolerance(age_a, age_b),
    }
}

/// Evaluate one candidate pair against `key`.
///
/// Criteria run exact → age → distance and stop at the first failure.
/// A null on either side of a scoring field makes the pair undecidable
/// (`Residual`) rather than rejected.
pub fn score_pair(table: &RecordTable, key: &MatchKey, pair: CandidatePair) -> MatchDecision {
    let census = table.get(pair.census);
    let survey = table.get(pair.survey);
    let mut evidence = Evidence::default();

    let decide = |outcome: Outcome, evidence: Evidence| MatchDecision {
        pair,
        outcome,
        evidence,
        multi_match: false,
    };

    for &field in &key.exact {
        match (census.value(field), survey.value(field)) {
            (Some(c), Some(s)) if c == s => {}
            (Some(_), Some(_)) => {
                evidence.failure = Some(Failure::Exact { field });
                return decide(Outcome::Rejected, evidence);
            }
            _ => {
                evidence.failure = Some(Failure::Missing { field });
                return decide(Outcome::Residual, evidence);
            }
        }
    }

    if let Some(criterion) = key.age {
        let (Some(age_c), Some(age_s)) = (census.age, survey.age) else {
            evidence.failure = Some(Failure::Missing { field: Field::Age });
            return decide(Outcome::Residual, evidence);
        };
        let difference = age_c.abs_diff(age_s);
        evidence.age_difference = Some(difference);
        if !age_agrees(criterion, age_c, age_s) {
            evidence.failure = Some(Failure::Age { difference });
            return decide(Outcome::Rejected, evidence);
        }
    }

    for rule in &key.distance {
        let (c, s) = match (census.value(rule.census_field), survey.value(rule.survey_field)) {
            (Some(c), Some(s)) => (c, s),
            (None, _) => {
                evidence.failure = Some(Failure::Missing { field: rule.census_field });
                return decide(Outcome::Residual, evidence);
            }
            (Some(_), None) => {
                evidence.failure = Some(Failure::Missing { field: rule.survey_field });
                return decide(Outcome::Residual, evidence);
            }
        };
        let (raw, distance) = normalized_levenshtein(&c, &s);
        evidence.distances.push(FieldDistance {
            census_field: rule.census_field,
            survey_field: rule.survey_field,
            raw,
            distance,
        });
        if let Some(failure) = distance_failure(rule, raw, distance) {
            evidence.failure = Some(failure);
            return decide(Outcome::Rejected, evidence);
        }
    }

    decide(Outcome::Accepted, evidence)
}

fn distance_failure(rule: &DistanceRule, raw: usize, distance: f64) -> Option<Failure> {
    if rule.max_raw.is_some_and(|cap| raw > cap) {
        return Some(Failure::RawDistance {
            field: rule.census_field,
            raw,
        });
    }
    if distance > rule.threshold + DISTANCE_EPSILON {
        return Some(Failure::Distance {
            field: rule.census_field,
            distance,
        });
    }
    None
}

pub fn score_block(table: &RecordTable, key: &MatchKey, pairs: &[CandidatePair]) -> Vec<MatchDecision> {
    pairs.iter().map(|&pair| score_pair(table, key, pair)).collect()
}

/// Flag accepted decisions whose census or survey record has more than one
/// accepted pair among `decisions`. Call once per match key.
pub fn flag_multi_matches(decisions: &mut [MatchDecision]) -> usize {
    let mut census_hits: HashMap<usize, usize> = HashMap::new();
    let mut survey_hits: HashMap<usize, usize> = HashMap::new();
    for d in decisions.iter().filter(|d| d.outcome == Outcome::Accepted) {
        *census_hits.entry(d.pair.census).or_default() += 1;
        *survey_hits.entry(d.pair.survey).or_default() += 1;
    }

    let mut flagged = 0;
    for d in decisions.iter_mut().filter(|d| d.outcome == Outcome::Accepted) {
        if census_hits[&d.pair.census] > 1 || survey_hits[&d.pair.survey] > 1 {
            d.multi_match = true;
            flagged += 1;
        }
    }
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, Source};

    fn table(census: Record, survey: Record) -> RecordTable {
        RecordTable::build(vec![census, survey], None).unwrap()
    }

    fn pair() -> CandidatePair {
        CandidatePair {
            census: 0,
            survey: 1,
            priority: 1,
        }
    }

    fn aged(source: Source, id: &str, age: &str, name: &str) -> Record {
        Record::new(source, id)
            .with(Field::Age, age)
            .with(Field::FullName, name)
    }

    #[test]
    fn levenshtein_normalized_by_longer_string() {
        assert_eq!(normalized_levenshtein("CHARLIE", "CHARLIE"), (0, 0.0));
        let (raw, d) = normalized_levenshtein("JON SMITH", "JOHN SMITH");
        assert_eq!(raw, 1);
        assert!((d - 0.1).abs() < 1e-12);
        assert_eq!(normalized_levenshtein("", ""), (0, 0.0));
        assert_eq!(normalized_levenshtein("", "AB"), (2, 1.0));
    }

    #[test]
    fn banded_tolerance_widens_with_age() {
        assert!(age_agrees(AgeCriterion::Banded, 5, 5));
        assert!(!age_agrees(AgeCriterion::Banded, 5, 8));
        assert!(age_agrees(AgeCriterion::Banded, 45, 49));
        assert!(!age_agrees(AgeCriterion::Banded, 45, 50));
        assert!(age_agrees(AgeCriterion::Banded, 9, 11));
        assert!(age_agrees(AgeCriterion::Banded, 30, 33));
        assert!(!age_agrees(AgeCriterion::Banded, 30, 34));
    }

    #[test]
    fn fixed_age_boundary() {
        let key = MatchKey::blocking("mk", 1, &[Field::Dob]).with_age(AgeCriterion::Fixed { tolerance: 2 });

        let t = table(aged(Source::Census, "C", "30", "A"), aged(Source::Survey, "P", "32", "A"));
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Accepted);
        assert_eq!(d.evidence.age_difference, Some(2));

        let t = table(aged(Source::Census, "C", "30", "A"), aged(Source::Survey, "P", "33", "A"));
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Rejected);
        assert_eq!(d.evidence.failure, Some(Failure::Age { difference: 3 }));
    }

    #[test]
    fn zero_tolerance_requires_equal_age() {
        let key = MatchKey::blocking("mk", 1, &[Field::Dob]).with_age(AgeCriterion::Fixed { tolerance: 0 });
        let t = table(aged(Source::Census, "C", "34", "A"), aged(Source::Survey, "P", "34", "A"));
        assert_eq!(score_pair(&t, &key, pair()).outcome, Outcome::Accepted);
        let t = table(aged(Source::Census, "C", "34", "A"), aged(Source::Survey, "P", "35", "A"));
        assert_eq!(score_pair(&t, &key, pair()).outcome, Outcome::Rejected);
    }

    #[test]
    fn distance_boundary_is_inclusive() {
        // 1 edit over 5 chars = 0.2
        let t = table(aged(Source::Census, "C", "1", "ABCDE"), aged(Source::Survey, "P", "1", "ABCDX"));
        let at = MatchKey::blocking("mk", 1, &[Field::Dob]).with_distance(Field::FullName, 0.2, None);
        assert_eq!(score_pair(&t, &at, pair()).outcome, Outcome::Accepted);

        let below = MatchKey::blocking("mk", 1, &[Field::Dob]).with_distance(Field::FullName, 0.19, None);
        let d = score_pair(&t, &below, pair());
        assert_eq!(d.outcome, Outcome::Rejected);
        assert!(matches!(d.evidence.failure, Some(Failure::Distance { field: Field::FullName, .. })));
    }

    #[test]
    fn raw_cap_rejects_short_strings() {
        let t = table(aged(Source::Census, "C", "1", "AB"), aged(Source::Survey, "P", "1", "XY"));
        let key = MatchKey::blocking("mk", 1, &[Field::Dob]).with_distance(Field::FullName, 1.0, Some(1));
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Rejected);
        assert_eq!(
            d.evidence.failure,
            Some(Failure::RawDistance {
                field: Field::FullName,
                raw: 2
            })
        );
    }

    #[test]
    fn exact_mismatch_rejects_and_null_is_residual() {
        let key = MatchKey::blocking("mk", 1, &[Field::Dob]).with_exact(Field::Sex);

        let t = table(
            Record::new(Source::Census, "C").with(Field::Sex, "1"),
            Record::new(Source::Survey, "P").with(Field::Sex, "2"),
        );
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Rejected);
        assert_eq!(d.evidence.failure, Some(Failure::Exact { field: Field::Sex }));

        let t = table(
            Record::new(Source::Census, "C").with(Field::Sex, "1"),
            Record::new(Source::Survey, "P"),
        );
        assert_eq!(score_pair(&t, &key, pair()).outcome, Outcome::Residual);
    }

    #[test]
    fn missing_age_or_distance_field_is_residual() {
        let key = MatchKey::blocking("mk", 1, &[Field::Dob]).with_age(AgeCriterion::Banded);
        let t = table(
            Record::new(Source::Census, "C").with(Field::Age, "30"),
            Record::new(Source::Survey, "P"),
        );
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Residual);
        assert_eq!(d.evidence.failure, Some(Failure::Missing { field: Field::Age }));

        let key = MatchKey::blocking("mk", 1, &[Field::Dob]).with_distance(Field::Surname, 0.5, None);
        let t = table(
            Record::new(Source::Census, "C").with(Field::Surname, "SMITH"),
            Record::new(Source::Survey, "P"),
        );
        assert_eq!(score_pair(&t, &key, pair()).outcome, Outcome::Residual);
    }

    #[test]
    fn short_circuits_on_first_failure() {
        let key = MatchKey::blocking("mk", 1, &[Field::Dob])
            .with_age(AgeCriterion::Fixed { tolerance: 0 })
            .with_distance(Field::FullName, 0.0, None);
        let t = table(aged(Source::Census, "C", "20", "AAA"), aged(Source::Survey, "P", "40", "BBB"));
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Rejected);
        assert!(d.evidence.distances.is_empty());
    }

    #[test]
    fn swapped_distance_fields() {
        let mut key = MatchKey::blocking("mk", 1, &[Field::Dob]);
        key.distance.push(DistanceRule {
            census_field: Field::MiddleName,
            survey_field: Field::Forename,
            threshold: 0.0,
            max_raw: None,
        });
        let t = table(
            Record::new(Source::Census, "C").with(Field::MiddleName, "ROSE"),
            Record::new(Source::Survey, "P").with(Field::Forename, "ROSE"),
        );
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Accepted);
        assert_eq!(d.evidence.distances[0].survey_field, Field::Forename);
        assert_eq!(d.evidence.combined_distance(), 0.0);
    }

    #[test]
    fn swapped_distance_names_the_null_side() {
        let mut key = MatchKey::blocking("mk", 1, &[Field::Dob]);
        key.distance.push(DistanceRule {
            census_field: Field::MiddleName,
            survey_field: Field::Surname,
            threshold: 0.2,
            max_raw: None,
        });

        let t = table(
            Record::new(Source::Census, "C").with(Field::MiddleName, "JONES"),
            Record::new(Source::Survey, "P"),
        );
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.outcome, Outcome::Residual);
        assert_eq!(d.evidence.failure, Some(Failure::Missing { field: Field::Surname }));

        let t = table(
            Record::new(Source::Census, "C"),
            Record::new(Source::Survey, "P").with(Field::Surname, "JONES"),
        );
        let d = score_pair(&t, &key, pair());
        assert_eq!(d.evidence.failure, Some(Failure::Missing { field: Field::MiddleName }));
    }

    #[test]
    fn multi_match_flags_shared_records() {
        let accepted = |census, survey| MatchDecision {
            pair: CandidatePair {
                census,
                survey,
                priority: 1,
            },
            outcome: Outcome::Accepted,
            evidence: Evidence::default(),
            multi_match: false,
        };
        let mut decisions = vec![
            accepted(0, 3),
            accepted(1, 3),
            accepted(2, 4),
            MatchDecision {
                outcome: Outcome::Rejected,
                ..accepted(2, 5)
            },
        ];
        assert_eq!(flag_multi_matches(&mut decisions), 2);
        let flags: Vec<bool> = decisions.iter().map(|d| d.multi_match).collect();
        assert_eq!(flags, vec![true, true, false, false]);
    }
}
