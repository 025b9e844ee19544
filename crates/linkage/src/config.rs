use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Deserialize;

use crate::error::LinkError;
use crate::model::Field;

/// Largest age tolerance accepted by validation.
pub const MAX_AGE_TOLERANCE: u32 = 120;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub name: String,
    /// Blocks producing more candidate pairs than this are skipped and reported.
    #[serde(default = "default_max_block_pairs")]
    pub max_block_pairs: usize,
    /// Multi clusters above this size go to clerical review unresolved.
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,
    pub matchkeys: Vec<MatchKeyConfig>,
    #[serde(default)]
    pub associative: Option<AssociativeConfig>,
    #[serde(default)]
    pub inputs: Option<InputsConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_max_block_pairs() -> usize {
    10_000
}

fn default_max_cluster_size() -> usize {
    12
}

// ---------------------------------------------------------------------------
// Match keys
// ---------------------------------------------------------------------------

/// One match key as written in TOML. Priority comes from its position.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchKeyConfig {
    pub name: String,
    pub block: Vec<Field>,
    #[serde(default)]
    pub swap: Vec<SwapPair>,
    #[serde(default)]
    pub exact: Vec<Field>,
    #[serde(default)]
    pub age: Option<AgeCriterion>,
    #[serde(default)]
    pub distance: Vec<DistanceCriterion>,
}

/// Agreement required between different fields on each side,
/// e.g. census middle name against survey surname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwapPair {
    pub census: Field,
    pub survey: Field,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AgeCriterion {
    /// Absolute difference must not exceed `tolerance` years.
    Fixed { tolerance: u32 },
    /// Tolerance widens with age.
    Banded,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistanceCriterion {
    #[serde(default)]
    pub field: Option<Field>,
    #[serde(default)]
    pub census_field: Option<Field>,
    #[serde(default)]
    pub survey_field: Option<Field>,
    /// Maximum normalized edit distance, in [0, 1].
    pub threshold: f64,
    /// Hard cap on the raw edit distance.
    #[serde(default)]
    pub max_raw: Option<usize>,
}

impl DistanceCriterion {
    fn fields(&self) -> Option<(Field, Field)> {
        Some((self.census_field.or(self.field)?, self.survey_field.or(self.field)?))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssociativeConfig {
    pub matchkeys: Vec<MatchKeyConfig>,
}

// ---------------------------------------------------------------------------
// Inputs + Output (read by the CLI, ignored by the engine)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputsConfig {
    pub census: InputConfig,
    pub survey: InputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub file: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Column header overrides keyed by field name; fields not listed use
    /// their canonical name.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default = "default_missing_values")]
    pub missing_values: Vec<String>,
    /// File listing every record id the standardizer produced, one per line.
    #[serde(default)]
    pub manifest: Option<String>,
}

impl InputConfig {
    pub fn column_for(&self, field: Field) -> &str {
        self.columns.get(field.name()).map(String::as_str).unwrap_or(field.name())
    }

    fn validate(&self, source: &str) -> Result<(), LinkError> {
        if let Some(unknown) = self
            .columns
            .keys()
            .find(|k| !Field::ALL.iter().any(|f| f.name() == k.as_str()))
        {
            return Err(LinkError::ConfigValidation(format!(
                "inputs.{source}.columns: unknown field '{unknown}'"
            )));
        }
        Ok(())
    }
}

fn default_id_column() -> String {
    "record_id".into()
}

fn default_missing_values() -> Vec<String> {
    vec![String::new(), "-9".into()]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub json: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Compiled match keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceRule {
    pub census_field: Field,
    pub survey_field: Field,
    pub threshold: f64,
    pub max_raw: Option<usize>,
}

/// A validated match key. Lower `priority` is stronger.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchKey {
    pub name: String,
    pub priority: u32,
    pub associative: bool,
    pub block: Vec<Field>,
    pub swap: Vec<SwapPair>,
    pub exact: Vec<Field>,
    pub age: Option<AgeCriterion>,
    pub distance: Vec<DistanceRule>,
}

impl MatchKey {
    /// A key that blocks on `block` and applies no further criteria.
    pub fn blocking(name: &str, priority: u32, block: &[Field]) -> Self {
        Self {
            name: name.into(),
            priority,
            associative: false,
            block: block.to_vec(),
            swap: Vec::new(),
            exact: Vec::new(),
            age: None,
            distance: Vec::new(),
        }
    }

    pub fn with_age(mut self, age: AgeCriterion) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_distance(mut self, field: Field, threshold: f64, max_raw: Option<usize>) -> Self {
        self.distance.push(DistanceRule {
            census_field: field,
            survey_field: field,
            threshold,
            max_raw,
        });
        self
    }

    pub fn with_exact(mut self, field: Field) -> Self {
        self.exact.push(field);
        self
    }

    /// Fields read on the census side.
    pub fn census_fields(&self) -> Vec<Field> {
        let mut fields = self.block.clone();
        fields.extend(self.swap.iter().map(|s| s.census));
        fields
    }

    /// Fields read on the survey side.
    pub fn survey_fields(&self) -> Vec<Field> {
        let mut fields = self.block.clone();
        fields.extend(self.swap.iter().map(|s| s.survey));
        fields
    }

    fn compile(config: &MatchKeyConfig, priority: u32, associative: bool) -> Result<Self, LinkError> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(LinkError::ConfigValidation(format!(
                "matchkey #{priority} has an empty name"
            )));
        }
        if config.block.is_empty() && config.swap.is_empty() {
            return Err(LinkError::ConfigValidation(format!(
                "matchkey '{name}': at least one block field is required"
            )));
        }

        let mut distance = Vec::with_capacity(config.distance.len());
        for criterion in &config.distance {
            let (census_field, survey_field) = criterion.fields().ok_or_else(|| {
                LinkError::ConfigValidation(format!(
                    "matchkey '{name}': distance criterion needs `field` or both `census_field` and `survey_field`"
                ))
            })?;
            for field in [census_field, survey_field] {
                if !field.is_text() {
                    return Err(LinkError::UnknownField {
                        matchkey: name.into(),
                        field: field.to_string(),
                    });
                }
            }
            if !criterion.threshold.is_finite() || !(0.0..=1.0).contains(&criterion.threshold) {
                return Err(LinkError::ConfigValidation(format!(
                    "matchkey '{name}': distance threshold must be in [0, 1], got {}",
                    criterion.threshold
                )));
            }
            distance.push(DistanceRule {
                census_field,
                survey_field,
                threshold: criterion.threshold,
                max_raw: criterion.max_raw,
            });
        }

        if let Some(AgeCriterion::Fixed { tolerance }) = config.age {
            if tolerance > MAX_AGE_TOLERANCE {
                return Err(LinkError::ConfigValidation(format!(
                    "matchkey '{name}': age tolerance must be at most {MAX_AGE_TOLERANCE}, got {tolerance}"
                )));
            }
        }

        Ok(Self {
            name: name.into(),
            priority,
            associative,
            block: config.block.clone(),
            swap: config.swap.clone(),
            exact: config.exact.clone(),
            age: config.age,
            distance,
        })
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl LinkConfig {
    pub fn from_toml(input: &str) -> Result<Self, LinkError> {
        let config: LinkConfig =
            toml::from_str(input).map_err(|e| LinkError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if let Some(ref inputs) = self.inputs {
            inputs.census.validate("census")?;
            inputs.survey.validate("survey")?;
        }
        self.match_keys().map(|_| ())
    }

    /// Compile every match key in priority order: main keys first, then
    /// associative keys.
    pub fn match_keys(&self) -> Result<Vec<MatchKey>, LinkError> {
        if self.matchkeys.is_empty() {
            return Err(LinkError::ConfigValidation(
                "at least one matchkey is required".into(),
            ));
        }
        if self.max_block_pairs == 0 {
            return Err(LinkError::ConfigValidation(
                "max_block_pairs must be at least 1".into(),
            ));
        }
        if self.max_cluster_size < 2 {
            return Err(LinkError::ConfigValidation(format!(
                "max_cluster_size must be at least 2, got {}",
                self.max_cluster_size
            )));
        }

        let associative = self
            .associative
            .as_ref()
            .map(|a| a.matchkeys.as_slice())
            .unwrap_or(&[]);

        let mut keys = Vec::with_capacity(self.matchkeys.len() + associative.len());
        let mut names = HashSet::new();
        let tagged = self
            .matchkeys
            .iter()
            .map(|k| (k, false))
            .chain(associative.iter().map(|k| (k, true)));

        for (i, (config, is_associative)) in tagged.enumerate() {
            let key = MatchKey::compile(config, i as u32 + 1, is_associative)?;
            if !names.insert(key.name.clone()) {
                return Err(LinkError::ConfigValidation(format!(
                    "duplicate matchkey name '{}'",
                    key.name
                )));
            }
            keys.push(key);
        }

        Ok(keys)
    }

    /// Every field any match key reads, on either side.
    pub fn referenced_fields(&self) -> BTreeSet<Field> {
        let associative = self
            .associative
            .as_ref()
            .map(|a| a.matchkeys.as_slice())
            .unwrap_or(&[]);
        let mut fields = BTreeSet::new();
        for key in self.matchkeys.iter().chain(associative) {
            fields.extend(key.block.iter().copied());
            fields.extend(key.exact.iter().copied());
            for swap in &key.swap {
                fields.insert(swap.census);
                fields.insert(swap.survey);
            }
            for d in &key.distance {
                fields.extend([d.field, d.census_field, d.survey_field].into_iter().flatten());
            }
            if key.age.is_some() {
                fields.insert(Field::Age);
            }
        }
        if !associative.is_empty() {
            fields.insert(Field::Household);
        }
        fields
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
