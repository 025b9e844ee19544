use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// The two datasets being linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Census,
    Survey,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Census => write!(f, "census"),
            Self::Survey => write!(f, "survey"),
        }
    }
}

/// A matchable attribute of a standardized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Household,
    Area,
    Forename,
    MiddleName,
    Surname,
    FullName,
    ForenameSoundex,
    SurnameSoundex,
    ForenameTrigram,
    Dob,
    BirthYear,
    Age,
    Sex,
    MaritalStatus,
    Relationship,
    Telephone,
}

impl Field {
    pub const ALL: [Field; 16] = [
        Field::Household,
        Field::Area,
        Field::Forename,
        Field::MiddleName,
        Field::Surname,
        Field::FullName,
        Field::ForenameSoundex,
        Field::SurnameSoundex,
        Field::ForenameTrigram,
        Field::Dob,
        Field::BirthYear,
        Field::Age,
        Field::Sex,
        Field::MaritalStatus,
        Field::Relationship,
        Field::Telephone,
    ];

    /// Canonical snake_case name, also the default CSV column header.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Household => "household",
            Self::Area => "area",
            Self::Forename => "forename",
            Self::MiddleName => "middle_name",
            Self::Surname => "surname",
            Self::FullName => "full_name",
            Self::ForenameSoundex => "forename_soundex",
            Self::SurnameSoundex => "surname_soundex",
            Self::ForenameTrigram => "forename_trigram",
            Self::Dob => "dob",
            Self::BirthYear => "birth_year",
            Self::Age => "age",
            Self::Sex => "sex",
            Self::MaritalStatus => "marital_status",
            Self::Relationship => "relationship",
            Self::Telephone => "telephone",
        }
    }

    /// Whether edit distance is meaningful for this field.
    pub fn is_text(&self) -> bool {
        !matches!(self, Self::Age)
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One standardized person observation. Never mutated after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub source: Source,
    pub record_id: String,
    pub household_id: Option<String>,
    pub area_id: Option<String>,
    pub forename: Option<String>,
    pub middle_name: Option<String>,
    pub surname: Option<String>,
    pub full_name: Option<String>,
    pub forename_soundex: Option<String>,
    pub surname_soundex: Option<String>,
    pub forename_trigram: Option<String>,
    pub dob: Option<String>,
    pub birth_year: Option<String>,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub marital_status: Option<String>,
    pub relationship: Option<String>,
    pub telephone: Option<String>,
}

impl Record {
    pub fn new(source: Source, record_id: impl Into<String>) -> Self {
        Self {
            source,
            record_id: record_id.into(),
            household_id: None,
            area_id: None,
            forename: None,
            middle_name: None,
            surname: None,
            full_name: None,
            forename_soundex: None,
            surname_soundex: None,
            forename_trigram: None,
            dob: None,
            birth_year: None,
            age: None,
            sex: None,
            marital_status: None,
            relationship: None,
            telephone: None,
        }
    }

    /// Value of `field`, or `None` when the standardizer left it null.
    pub fn value(&self, field: Field) -> Option<Cow<'_, str>> {
        let text = match field {
            Field::Household => &self.household_id,
            Field::Area => &self.area_id,
            Field::Forename => &self.forename,
            Field::MiddleName => &self.middle_name,
            Field::Surname => &self.surname,
            Field::FullName => &self.full_name,
            Field::ForenameSoundex => &self.forename_soundex,
            Field::SurnameSoundex => &self.surname_soundex,
            Field::ForenameTrigram => &self.forename_trigram,
            Field::Dob => &self.dob,
            Field::BirthYear => &self.birth_year,
            Field::Age => return self.age.map(|a| Cow::Owned(a.to_string())),
            Field::Sex => &self.sex,
            Field::MaritalStatus => &self.marital_status,
            Field::Relationship => &self.relationship,
            Field::Telephone => &self.telephone,
        };
        text.as_deref().map(Cow::Borrowed)
    }

    /// Set a text field. Age is parsed by the loader and set directly.
    pub fn set_text(&mut self, field: Field, value: Option<String>) {
        let slot = match field {
            Field::Household => &mut self.household_id,
            Field::Area => &mut self.area_id,
            Field::Forename => &mut self.forename,
            Field::MiddleName => &mut self.middle_name,
            Field::Surname => &mut self.surname,
            Field::FullName => &mut self.full_name,
            Field::ForenameSoundex => &mut self.forename_soundex,
            Field::SurnameSoundex => &mut self.surname_soundex,
            Field::ForenameTrigram => &mut self.forename_trigram,
            Field::Dob => &mut self.dob,
            Field::BirthYear => &mut self.birth_year,
            Field::Age => return,
            Field::Sex => &mut self.sex,
            Field::MaritalStatus => &mut self.marital_status,
            Field::Relationship => &mut self.relationship,
            Field::Telephone => &mut self.telephone,
        };
        *slot = value;
    }

    pub fn with(mut self, field: Field, value: &str) -> Self {
        if field == Field::Age {
            self.age = value.parse().ok();
        } else {
            self.set_text(field, Some(value.to_string()));
        }
        self
    }
}

/// Record ids the standardizer reported producing, per source.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub ids: BTreeMap<Source, BTreeSet<String>>,
}

/// Pre-loaded records for both sources.
#[derive(Debug, Clone)]
pub struct LinkInput {
    pub records: Vec<Record>,
    pub manifest: Option<Manifest>,
}

// ---------------------------------------------------------------------------
// Pair decisions
// ---------------------------------------------------------------------------

/// Indices into the record table. `census` always refers to a census record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidatePair {
    pub census: usize,
    pub survey: usize,
    pub priority: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    /// A scoring field was null on one side; the pair cannot be decided.
    Residual,
}

/// Which criterion ended scoring, when the pair was not accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "criterion")]
pub enum Failure {
    Exact { field: Field },
    Age { difference: u32 },
    Distance { field: Field, distance: f64 },
    RawDistance { field: Field, raw: usize },
    Missing { field: Field },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDistance {
    pub census_field: Field,
    pub survey_field: Field,
    pub raw: usize,
    pub distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evidence {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_difference: Option<u32>,
    pub distances: Vec<FieldDistance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl Evidence {
    /// Sum of normalized distances; the resolver's second ranking term.
    pub fn combined_distance(&self) -> f64 {
        self.distances.iter().map(|d| d.distance).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub pair: CandidatePair,
    pub outcome: Outcome,
    pub evidence: Evidence,
    pub multi_match: bool,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MemberRef {
    pub source: Source,
    pub record_id: String,
}

/// Evidence for one accepted pair, as shown to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairEvidence {
    pub census_id: String,
    pub survey_id: String,
    pub match_key: String,
    pub priority: u32,
    pub distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_difference: Option<u32>,
    pub multi_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Unique,
    Multi,
    Conflict,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unique => write!(f, "unique"),
            Self::Multi => write!(f, "multi"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// A finalized, one-to-one link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedCluster {
    pub cluster_id: u32,
    pub members: Vec<MemberRef>,
    pub pair: PairEvidence,
    /// Always `Unique`: a finalized link holds one record per source.
    pub status: ClusterStatus,
    /// True when the link came out of multi-cluster resolution.
    pub resolved: bool,
    /// True when a clerical reviewer chose the link.
    pub reviewed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Competing pairs tie on both priority and distance.
    TiedCandidates,
    /// Cluster exceeds the resolution size ceiling.
    OversizedCluster,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TiedCandidates => write!(f, "tied_candidates"),
            Self::OversizedCluster => write!(f, "oversized_cluster"),
        }
    }
}

/// An unresolved cluster routed to clerical review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClericalCluster {
    pub cluster_id: u32,
    pub members: Vec<MemberRef>,
    /// `Conflict` when resolution found a tie, `Multi` when the cluster was
    /// too large to attempt.
    pub status: ClusterStatus,
    pub reason: ConflictReason,
    pub competing: Vec<PairEvidence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResidualReason {
    /// No accepted pair under any match key.
    Unmatched,
    /// Lost multi-cluster resolution.
    Ejected { cluster_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidualRecord {
    pub record_id: String,
    pub reason: ResidualReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResidualSet {
    pub census: Vec<ResidualRecord>,
    pub survey: Vec<ResidualRecord>,
}

impl ResidualSet {
    pub fn push(&mut self, source: Source, record: ResidualRecord) {
        match source {
            Source::Census => self.census.push(record),
            Source::Survey => self.survey.push(record),
        }
    }

    pub fn len(&self) -> usize {
        self.census.len() + self.survey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A block skipped because its pair count exceeded the ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub match_key: String,
    pub block_key: String,
    pub census_records: usize,
    pub survey_records: usize,
    pub pairs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub census_records: usize,
    pub survey_records: usize,
    pub candidate_pairs: usize,
    pub accepted_pairs: usize,
    pub multi_match_pairs: usize,
    pub clusters: usize,
    pub linked: usize,
    pub resolved: usize,
    /// Links finalized from clerical review decisions.
    pub reviewed: usize,
    pub clerical: usize,
    pub residual_census: usize,
    pub residual_survey: usize,
    pub oversized_blocks: usize,
    pub accepted_by_key: BTreeMap<String, usize>,
    /// Share of survey records with a finalized link (coverage estimate input).
    pub survey_link_rate: f64,
    pub census_link_rate: f64,
    /// Link rates per enumeration area. Records without an area are left out.
    pub link_rate_by_area: BTreeMap<String, AreaRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AreaRate {
    pub census_records: usize,
    pub survey_records: usize,
    pub census_linked: usize,
    pub survey_linked: usize,
    pub census_link_rate: f64,
    pub survey_link_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkMeta {
    pub config_name: String,
    pub engine_version: String,
    pub run_at: String,
    pub match_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub meta: LinkMeta,
    pub summary: LinkSummary,
    pub linked: Vec<LinkedCluster>,
    pub clerical: Vec<ClericalCluster>,
    pub residuals: ResidualSet,
    pub blocking: Vec<BlockReport>,
}
