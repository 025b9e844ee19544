//! `coverlink run` and `coverlink validate`: config-driven person linkage.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

use coverlink_linkage::config::InputConfig;
use coverlink_linkage::model::{
    ClusterStatus, ConflictReason, Field, Manifest, ResidualReason, ResidualRecord,
};
use coverlink_linkage::{
    load_csv_records, load_review_decisions, parse_manifest_ids, LinkConfig, LinkError, LinkInput,
    LinkResult, Record, Source,
};

use crate::exit_codes::{
    EXIT_ERROR, EXIT_LINK_CLERICAL, EXIT_LINK_INVALID_CONFIG, EXIT_LINK_RUNTIME,
};
use crate::CliError;

#[derive(Subcommand)]
pub enum LinkCommands {
    /// Link census and survey records from a TOML config file
    #[command(after_help = "\
Examples:
  coverlink run stage1.toml
  coverlink run stage1.toml --json
  coverlink run stage1.toml --output result.json --out-dir out/
  coverlink run stage1.toml --fail-on-clerical
  coverlink run stage1.toml --review decisions.csv

Outputs:
  linked.csv      one row per finalized census/survey link
  clerical.csv    one row per competing pair in a cluster needing review
  residuals.csv   one row per record left unlinked

Review decisions:
  Keep the clerical.csv rows for the pairs to link and pass the file back
  with --review. A row with the cluster_id and blank census_id/survey_id
  marks a reviewed cluster with no link. Clusters without rows stay in
  clerical review.")]
    Run {
        /// Path to the link config (.toml)
        config: PathBuf,

        /// Output JSON to stdout
        #[arg(long)]
        json: bool,

        /// Write JSON output to file (overrides [output] json)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Write linked / clerical / residual CSVs to this directory
        /// (overrides [output] dir)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Exit non-zero when any cluster needs clerical review
        #[arg(long)]
        fail_on_clerical: bool,

        /// Clerical review decisions (.csv) to finalize
        #[arg(long, value_name = "FILE")]
        review: Option<PathBuf>,
    },

    /// Validate a link config without running
    #[command(after_help = "\
Examples:
  coverlink validate stage1.toml")]
    Validate {
        /// Path to the link config (.toml)
        config: PathBuf,
    },
}

pub fn cmd_link(cmd: LinkCommands) -> Result<(), CliError> {
    match cmd {
        LinkCommands::Run { config, json, output, out_dir, fail_on_clerical, review } => {
            cmd_link_run(config, json, output, out_dir, fail_on_clerical, review)
        }
        LinkCommands::Validate { config } => cmd_link_validate(config),
    }
}

/// Config problems are 60, everything else the engine reports is 61.
fn link_err(e: LinkError) -> CliError {
    let code = match e {
        LinkError::ConfigParse(_)
        | LinkError::ConfigValidation(_)
        | LinkError::UnknownField { .. } => EXIT_LINK_INVALID_CONFIG,
        _ => EXIT_LINK_RUNTIME,
    };
    let hint = match &e {
        LinkError::MissingRecord { .. } | LinkError::UnexpectedRecord { .. } => {
            Some("the input does not match the standardizer's manifest; rerun standardization")
        }
        LinkError::MissingColumn { .. } => Some("map the column under [inputs.<source>.columns]"),
        LinkError::Review { .. } => {
            Some("review decisions must come from clerical.csv of a run over the same input")
        }
        _ => None,
    };
    let err = CliError::new(code, e.to_string());
    match hint {
        Some(h) => err.with_hint(h),
        None => err,
    }
}

fn read_config(config_path: &Path) -> Result<LinkConfig, CliError> {
    let config_str = std::fs::read_to_string(config_path).map_err(|e| {
        CliError::usage(format!("cannot read config {}: {e}", config_path.display()))
    })?;
    LinkConfig::from_toml(&config_str).map_err(link_err)
}

fn cmd_link_run(
    config_path: PathBuf,
    json_output: bool,
    output_file: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    fail_on_clerical: bool,
    review_file: Option<PathBuf>,
) -> Result<(), CliError> {
    let config = read_config(&config_path)?;

    // Resolve file paths relative to config file's directory
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let inputs = config.inputs.as_ref().ok_or_else(|| {
        CliError::new(EXIT_LINK_INVALID_CONFIG, "config has no [inputs] section")
            .with_hint("add [inputs.census] and [inputs.survey] with a `file` each")
    })?;

    let required = config.referenced_fields();
    let mut records = Vec::new();
    let mut manifest = Manifest::default();

    for (source, input) in [(Source::Census, &inputs.census), (Source::Survey, &inputs.survey)] {
        records.extend(load_source(base_dir, source, input, &required)?);
        if let Some(ref file) = input.manifest {
            let path = base_dir.join(file);
            let text = std::fs::read_to_string(&path).map_err(|e| {
                CliError::runtime(format!("cannot read manifest {}: {e}", path.display()))
            })?;
            manifest.ids.insert(source, parse_manifest_ids(&text));
        }
    }

    let input = LinkInput {
        records,
        manifest: (!manifest.ids.is_empty()).then_some(manifest),
    };

    let review = match review_file {
        Some(ref path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                CliError::usage(format!("cannot read review decisions {}: {e}", path.display()))
            })?;
            load_review_decisions(&text).map_err(link_err)?
        }
        None => Vec::new(),
    };

    let result = coverlink_linkage::run_with_review(&config, input, &review).map_err(link_err)?;

    // Output
    let json_str = serde_json::to_string_pretty(&result)
        .map_err(|e| CliError::new(EXIT_ERROR, format!("JSON serialization error: {e}")))?;

    let json_path = output_file.or_else(|| config.output.json.as_ref().map(|p| base_dir.join(p)));
    if let Some(ref path) = json_path {
        std::fs::write(path, &json_str)
            .map_err(|e| CliError::runtime(format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    let csv_dir = out_dir.or_else(|| config.output.dir.as_ref().map(|p| base_dir.join(p)));
    if let Some(ref dir) = csv_dir {
        write_csv_outputs(dir, &result)?;
        eprintln!("wrote linked.csv, clerical.csv, residuals.csv to {}", dir.display());
    }

    if json_output {
        println!("{json_str}");
    }

    // Human summary to stderr
    let s = &result.summary;
    eprintln!(
        "'{}': {} census, {} survey records; {} candidate pairs, {} accepted",
        result.meta.config_name,
        s.census_records,
        s.survey_records,
        s.candidate_pairs,
        s.accepted_pairs,
    );
    eprintln!(
        "{} linked ({} resolved, {} reviewed), {} clerical, {} census / {} survey residual",
        s.linked, s.resolved, s.reviewed, s.clerical, s.residual_census, s.residual_survey,
    );
    eprintln!(
        "survey link rate {:.1}%, census link rate {:.1}%",
        s.survey_link_rate * 100.0,
        s.census_link_rate * 100.0,
    );
    if s.oversized_blocks > 0 {
        eprintln!(
            "{} oversized block(s) skipped; see \"blocking\" in the JSON output",
            s.oversized_blocks
        );
    }

    if fail_on_clerical && s.clerical > 0 {
        return Err(CliError::new(
            EXIT_LINK_CLERICAL,
            format!("{} cluster(s) need clerical review", s.clerical),
        ));
    }

    Ok(())
}

fn load_source(
    base_dir: &Path,
    source: Source,
    input: &InputConfig,
    required: &BTreeSet<Field>,
) -> Result<Vec<Record>, CliError> {
    let csv_path = base_dir.join(&input.file);
    let csv_data = std::fs::read_to_string(&csv_path)
        .map_err(|e| CliError::runtime(format!("cannot read {}: {e}", csv_path.display())))?;
    let records = load_csv_records(source, &csv_data, input, required).map_err(link_err)?;
    tracing::debug!("loaded {} {source} records from {}", records.len(), csv_path.display());
    Ok(records)
}

// ---------------------------------------------------------------------------
// CSV outputs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct LinkedRow<'a> {
    cluster_id: u32,
    census_id: &'a str,
    survey_id: &'a str,
    match_key: &'a str,
    priority: u32,
    distance: f64,
    age_difference: Option<u32>,
    multi_match: bool,
    resolved: bool,
    reviewed: bool,
}

/// One competing pair of a clerical cluster. The column set doubles as the
/// `--review` input: `cluster_id`, `census_id` and `survey_id` are read back.
#[derive(Serialize)]
struct ClericalRow<'a> {
    cluster_id: u32,
    status: ClusterStatus,
    reason: ConflictReason,
    census_id: &'a str,
    survey_id: &'a str,
    match_key: &'a str,
    priority: u32,
    distance: f64,
    age_difference: Option<u32>,
}

#[derive(Serialize)]
struct ResidualRow<'a> {
    source: Source,
    record_id: &'a str,
    reason: &'static str,
    cluster_id: Option<u32>,
}

impl<'a> ResidualRow<'a> {
    fn new(source: Source, r: &'a ResidualRecord) -> Self {
        let (reason, cluster_id) = match r.reason {
            ResidualReason::Unmatched => ("unmatched", None),
            ResidualReason::Ejected { cluster_id } => ("ejected", Some(cluster_id)),
        };
        Self { source, record_id: &r.record_id, reason, cluster_id }
    }
}

fn write_rows<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<(), CliError> {
    let io_err = |e: csv::Error| CliError::runtime(format!("cannot write {}: {e}", path.display()));
    let mut writer = csv::Writer::from_path(path).map_err(io_err)?;
    for row in rows {
        writer.serialize(row).map_err(io_err)?;
    }
    writer
        .flush()
        .map_err(|e| CliError::runtime(format!("cannot write {}: {e}", path.display())))
}

fn write_csv_outputs(dir: &Path, result: &LinkResult) -> Result<(), CliError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CliError::runtime(format!("cannot create {}: {e}", dir.display())))?;

    write_rows(
        &dir.join("linked.csv"),
        result.linked.iter().map(|l| LinkedRow {
            cluster_id: l.cluster_id,
            census_id: &l.pair.census_id,
            survey_id: &l.pair.survey_id,
            match_key: &l.pair.match_key,
            priority: l.pair.priority,
            distance: l.pair.distance,
            age_difference: l.pair.age_difference,
            multi_match: l.pair.multi_match,
            resolved: l.resolved,
            reviewed: l.reviewed,
        }),
    )?;

    write_rows(
        &dir.join("clerical.csv"),
        result.clerical.iter().flat_map(|c| {
            c.competing.iter().map(move |p| ClericalRow {
                cluster_id: c.cluster_id,
                status: c.status,
                reason: c.reason,
                census_id: &p.census_id,
                survey_id: &p.survey_id,
                match_key: &p.match_key,
                priority: p.priority,
                distance: p.distance,
                age_difference: p.age_difference,
            })
        }),
    )?;

    let residuals = &result.residuals;
    write_rows(
        &dir.join("residuals.csv"),
        residuals
            .census
            .iter()
            .map(|r| ResidualRow::new(Source::Census, r))
            .chain(residuals.survey.iter().map(|r| ResidualRow::new(Source::Survey, r))),
    )
}

fn cmd_link_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = read_config(&config_path)?;
    let keys = config.match_keys().map_err(link_err)?;
    let associative = keys.iter().filter(|k| k.associative).count();

    eprintln!(
        "valid: '{}' with {} match key(s) ({} associative)",
        config.name,
        keys.len(),
        associative,
    );
    for key in &keys {
        eprintln!("  {}: {}", key.priority, key.name);
    }
    Ok(())
}
