use std::collections::HashSet;

use crate::error::LinkError;
use crate::model::{Manifest, MemberRef, Record, Source};

/// The closed record universe, sorted by `(source, record_id)`.
///
/// Position in the table is the dense index used by blocking, scoring and
/// union-find, so index order is also the deterministic tie-break order.
#[derive(Debug)]
pub struct RecordTable {
    records: Vec<Record>,
    census_len: usize,
}

impl RecordTable {
    /// Build the table, rejecting duplicate ids and, for every source the
    /// manifest lists, any record the manifest does not account for.
    pub fn build(mut records: Vec<Record>, manifest: Option<&Manifest>) -> Result<Self, LinkError> {
        records.sort_by(|a, b| (a.source, &a.record_id).cmp(&(b.source, &b.record_id)));

        for w in records.windows(2) {
            if w[0].source == w[1].source && w[0].record_id == w[1].record_id {
                return Err(LinkError::DuplicateRecord {
                    source: w[0].source,
                    record_id: w[0].record_id.clone(),
                });
            }
        }

        if let Some(manifest) = manifest {
            check_manifest(&records, manifest)?;
        }

        let census_len = records.partition_point(|r| r.source == Source::Census);
        Ok(Self { records, census_len })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Record {
        &self.records[idx]
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Dense index range of one source.
    pub fn range(&self, source: Source) -> std::ops::Range<usize> {
        match source {
            Source::Census => 0..self.census_len,
            Source::Survey => self.census_len..self.records.len(),
        }
    }

    pub fn count(&self, source: Source) -> usize {
        self.range(source).len()
    }

    pub fn member(&self, idx: usize) -> MemberRef {
        let r = &self.records[idx];
        MemberRef {
            source: r.source,
            record_id: r.record_id.clone(),
        }
    }
}

fn check_manifest(records: &[Record], manifest: &Manifest) -> Result<(), LinkError> {
    let present: HashSet<(Source, &str)> = records
        .iter()
        .map(|r| (r.source, r.record_id.as_str()))
        .collect();

    for (&source, expected) in &manifest.ids {
        if let Some(missing) = expected.iter().find(|id| !present.contains(&(source, id.as_str()))) {
            return Err(LinkError::MissingRecord {
                source,
                record_id: missing.clone(),
            });
        }
    }

    if let Some(extra) = records.iter().find(|r| {
        manifest
            .ids
            .get(&r.source)
            .is_some_and(|ids| !ids.contains(&r.record_id))
    }) {
        return Err(LinkError::UnexpectedRecord {
            source: extra.source,
            record_id: extra.record_id.clone(),
        });
    }

    Ok(())
}
