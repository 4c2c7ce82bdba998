//! Run Controller: discovery, planning and the sequential processing pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::{info, warn};

use crate::allocator::{RecordingLog, SubjectAllocator, SubjectCode, SubjectKey};
use crate::anonymize::{AnonymizeStatus, Anonymizer, TMP_SUFFIX};
use crate::audit::{AuditRecorder, MappingRow, SkippedRow};
use crate::bids::{BidsWriter, MetadataSink, ParticipantRow};
use crate::clinical::{ClinicalIndex, ClinicalRecord};
use crate::config::RunConfig;
use crate::error::BidsError;
use crate::identity::{self, CandidateIdentity};
use crate::matcher::find_match;

/// Reason recorded for recordings whose destination already exists
pub const ALREADY_PROCESSED: &str = "already processed";

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    /// Recordings that reached the anonymizer
    pub processed: usize,
    pub anonymized: usize,
    pub copied_unanonymized: usize,
    pub failed: usize,
    pub unmatched: usize,
    pub skipped: usize,
}

/// A recording scheduled for processing
struct Planned {
    path: PathBuf,
    identity: CandidateIdentity,
    key: SubjectKey,
    run: Option<u32>,
}

/// Finds `*.edf` / `*.EDF` below `input_dir`, sorted and without duplicates.
/// Anything inside `exclude` (the output tree) is ignored.
pub fn discover(input_dir: &Path, exclude: &Path) -> Result<Vec<PathBuf>, BidsError> {
    let base = Pattern::escape(&input_dir.to_string_lossy());
    let mut found = BTreeSet::new();

    for extension in ["edf", "EDF"] {
        for entry in glob::glob(&format!("{}/**/*.{}", base, extension))? {
            match entry {
                Ok(path) if path.is_file() && !path.starts_with(exclude) => {
                    found.insert(path);
                }
                Ok(_) => {}
                Err(e) => warn!("Cannot read {}: {}", e.path().display(), e.error()),
            }
        }
    }
    Ok(found.into_iter().collect())
}

/// Deletes temp files left behind by an interrupted run
pub fn remove_orphaned_temp_files(bids_dir: &Path) -> Result<usize, BidsError> {
    let pattern = format!("{}/**/*{}", Pattern::escape(&bids_dir.to_string_lossy()), TMP_SUFFIX);
    let mut removed = 0;
    for path in glob::glob(&pattern)?.filter_map(|entry| entry.ok()) {
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!("Removed orphaned temp file {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Cannot remove orphaned temp file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Extracts identities, matches them and orders the work by grouping key
///
/// Sources known from `recordings` keep the key and run they were given
/// before. New sources of a subject with earlier recordings continue after
/// its highest run; a subject seen for the first time with several
/// recordings numbers them from 1.
fn plan(paths: Vec<PathBuf>, index: &ClinicalIndex, recordings: &RecordingLog) -> Vec<Planned> {
    let mut planned: Vec<Planned> = paths
        .into_iter()
        .map(|path| {
            let identity = identity::extract(&path).unwrap_or_else(|e| {
                warn!("{}: header unreadable ({}), using file name only", path.display(), e);
                CandidateIdentity::unreadable(&path)
            });
            if let Some(logged) = recordings.get(&path) {
                return Planned { path, identity, key: logged.key.clone(), run: logged.run };
            }
            let key = match find_match(&identity, index) {
                Some(record) => SubjectKey::Clinical(record.identifier.clone()),
                None => SubjectKey::Recording(path.clone()),
            };
            Planned { path, identity, key, run: None }
        })
        .collect();

    planned.sort_by(|a, b| (&a.key, &a.path).cmp(&(&b.key, &b.path)));

    let mut fresh: BTreeMap<SubjectKey, Vec<usize>> = BTreeMap::new();
    for (i, p) in planned.iter().enumerate() {
        if recordings.get(&p.path).is_none() {
            fresh.entry(p.key.clone()).or_default().push(i);
        }
    }

    // 同一受试者多条记录时编号 run-1, run-2 ...
    for (key, indices) in fresh {
        let first = match recordings.highest_run(&key) {
            Some(highest) => highest + 1,
            None if indices.len() > 1 => 1,
            None => continue,
        };
        for (offset, i) in indices.into_iter().enumerate() {
            planned[i].run = Some(first + offset as u32);
        }
    }

    planned
}

/// Runs the whole conversion
///
/// # Errors
///
/// Only configuration problems and failures to write the audit or dataset
/// tables abort the run. Per-recording problems end up in the audit tables.
pub fn run(config: &RunConfig) -> Result<RunSummary, BidsError> {
    config.validate()?;

    let index = match &config.clinical_sheet {
        Some(sheet) => ClinicalIndex::load(sheet, &config.columns)?,
        None => {
            warn!("No clinical sheet given, every recording will be unmatched");
            ClinicalIndex::default()
        }
    };

    fs::create_dir_all(&config.bids_dir).map_err(|e| BidsError::io(&config.bids_dir, e))?;
    let audit_dir = config.audit_dir();
    let mut audit = AuditRecorder::open(&audit_dir)?;
    let mut allocator = SubjectAllocator::open(&config.bids_dir, &audit_dir)?;
    let mut recordings = RecordingLog::open(&audit_dir)?;
    let mut sink = BidsWriter::new(config);
    let anonymizer = Anonymizer::new(config);

    remove_orphaned_temp_files(&config.bids_dir)?;

    let mut summary = RunSummary::default();
    let discovered = discover(&config.input_dir, &config.bids_dir)?;
    summary.discovered = discovered.len();
    info!("Found {} EDF files under {}", discovered.len(), config.input_dir.display());

    let mut accepted = Vec::new();
    for path in discovered {
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > config.max_file_size => {
                warn!("Skipping {}: {} bytes exceeds {}", path.display(), meta.len(), config.max_file_size);
                audit.record_skipped(&SkippedRow {
                    path: path.display().to_string(),
                    size_bytes: meta.len(),
                    reason: format!("size exceeds threshold of {} bytes", config.max_file_size),
                })?;
                summary.skipped += 1;
            }
            Ok(_) => accepted.push(path),
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                audit.record_skipped(&SkippedRow {
                    path: path.display().to_string(),
                    size_bytes: 0,
                    reason: format!("cannot stat: {}", e),
                })?;
                summary.skipped += 1;
            }
        }
    }

    let mut participants = Vec::new();
    for planned in plan(accepted, &index, &recordings) {
        let Planned { path, mut identity, key, run } = planned;
        let code = allocator.allocate(&key)?;
        let clinical = key.clinical_identifier().and_then(|id| index.get(id));

        // 新来源的 run 编号接在已记录的之后，不会与已有文件重名
        let dest = sink.recording_path(code, run);
        if dest.exists() && !config.overwrite {
            info!("Skipping {}: {} already exists", path.display(), dest.display());
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            audit.record_skipped(&SkippedRow {
                path: path.display().to_string(),
                size_bytes,
                reason: ALREADY_PROCESSED.to_string(),
            })?;
            summary.skipped += 1;
            continue;
        }
        recordings.record(&path, &key, run)?;

        if clinical.is_none() {
            summary.unmatched += 1;
            warn!("{}: no clinical match, assigned {}", path.display(), code.label());
            audit.record_unmatched(&path)?;
        }

        summary.processed += 1;
        let mut row = MappingRow {
            participant_id: code.label(),
            source_path: path.display().to_string(),
            anonymized_path: dest.display().to_string(),
            original_identity: identity.raw.clone(),
            status: String::new(),
            strategy: String::new(),
            detail: String::new(),
        };

        let eeg_dir = sink.eeg_dir(code);
        if let Err(e) = fs::create_dir_all(&eeg_dir) {
            warn!("Cannot create {}: {}", eeg_dir.display(), e);
            row.status = AnonymizeStatus::Failed.to_string();
            row.detail = format!("cannot create {}: {}", eeg_dir.display(), e);
            summary.failed += 1;
            audit.record_mapping(&row)?;
            continue;
        }

        let outcome = anonymizer.anonymize(&path, &dest, &code.label());
        row.status = outcome.status.to_string();
        row.strategy = outcome.strategy.unwrap_or_default().to_string();
        row.detail = outcome.detail();

        match outcome.status {
            AnonymizeStatus::Anonymized => summary.anonymized += 1,
            AnonymizeStatus::CopiedUnanonymized => summary.copied_unanonymized += 1,
            AnonymizeStatus::Failed => summary.failed += 1,
        }

        // channels.tsv 必须与写出的文件一致（标签可能已被清理）
        if let Some(written) = &outcome.recording {
            identity.rename_channels(&written.labels);
        }

        if outcome.status != AnonymizeStatus::Failed {
            if let Err(e) = sink.write_recording(code, run, &identity) {
                warn!("{}: sidecars not written: {}", dest.display(), e);
                if !row.detail.is_empty() {
                    row.detail.push_str("; ");
                }
                row.detail.push_str(&format!("sidecars: {}", e));
            }
            participants.push(ParticipantRow::new(code, clinical, &identity));
        }

        audit.record_mapping(&row)?;
    }

    let phenotype: Vec<(SubjectCode, &ClinicalRecord)> = allocator
        .allocations()
        .filter_map(|(key, code)| {
            key.clinical_identifier()
                .and_then(|id| index.get(id))
                .map(|record| (code, record))
        })
        .collect();

    sink.finish(&participants, &phenotype)?;
    audit.finish()?;

    info!(
        "Run complete: {} processed ({} anonymized, {} copied unanonymized, {} failed), {} unmatched, {} skipped",
        summary.processed,
        summary.anonymized,
        summary.copied_unanonymized,
        summary.failed,
        summary.unmatched,
        summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctest_utils::create_simple_test_file;

    #[test]
    fn test_discover_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(input.join("b")).unwrap();
        fs::create_dir_all(input.join("bids/sub-0001")).unwrap();
        fs::write(input.join("b/z.EDF"), b"x").unwrap();
        fs::write(input.join("a.edf"), b"x").unwrap();
        fs::write(input.join("notes.txt"), b"x").unwrap();
        fs::write(input.join("bids/sub-0001/out.edf"), b"x").unwrap();

        let found = discover(&input, &input.join("bids")).unwrap();
        assert_eq!(found, vec![input.join("a.edf"), input.join("b/z.EDF")]);
    }

    #[test]
    fn test_orphaned_temp_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub-0001/eeg")).unwrap();
        fs::write(dir.path().join("sub-0001/eeg/x_eeg.edf.tmp"), b"partial").unwrap();
        assert_eq!(remove_orphaned_temp_files(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("sub-0001/eeg/x_eeg.edf.tmp").exists());
    }

    #[test]
    fn test_plan_numbers_runs_per_subject() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.edf");
        let b = dir.path().join("b.edf");
        create_simple_test_file(&a).unwrap();
        create_simple_test_file(&b).unwrap();
        let c = dir.path().join("c.edf");
        fs::write(&c, b"not an edf").unwrap();

        let text = "DOC_NO,PATIENT_NAME,BIRTH_DATE,GENDER,HFL_NAME,PARA_RESULT\n5,Test Patient,1985,F,CBC,1\n";
        let reader = csv::Reader::from_reader(text.as_bytes());
        let index = ClinicalIndex::from_csv(reader, &Default::default(), Path::new("s.csv")).unwrap();

        let planned = plan(vec![c.clone(), b.clone(), a.clone()], &index, &RecordingLog::default());
        let order: Vec<(&Path, Option<u32>)> = planned.iter().map(|p| (p.path.as_path(), p.run)).collect();
        assert_eq!(order, vec![(a.as_path(), Some(1)), (b.as_path(), Some(2)), (c.as_path(), None)]);
        assert_eq!(planned[0].key, SubjectKey::Clinical("5".to_string()));
    }

    #[test]
    fn test_plan_keeps_logged_runs_and_appends_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = ["a.edf", "b.edf", "c.edf"].iter().map(|n| dir.path().join(n)).collect();
        for path in &paths {
            create_simple_test_file(path).unwrap();
        }

        let text = "DOC_NO,PATIENT_NAME,BIRTH_DATE,GENDER,HFL_NAME,PARA_RESULT\n5,Test Patient,1985,F,CBC,1\n";
        let reader = csv::Reader::from_reader(text.as_bytes());
        let index = ClinicalIndex::from_csv(reader, &Default::default(), Path::new("s.csv")).unwrap();

        let patient = SubjectKey::Clinical("5".to_string());
        let mut recordings = RecordingLog::open(&dir.path().join("audit")).unwrap();
        recordings.record(&paths[1], &patient, Some(1)).unwrap();
        recordings.record(&paths[2], &patient, Some(2)).unwrap();

        let planned = plan(paths.clone(), &index, &recordings);
        let runs: Vec<(&Path, Option<u32>)> = planned.iter().map(|p| (p.path.as_path(), p.run)).collect();
        assert_eq!(
            runs,
            vec![(paths[0].as_path(), Some(3)), (paths[1].as_path(), Some(1)), (paths[2].as_path(), Some(2))]
        );
    }

    #[test]
    fn test_plan_numbers_second_recording_after_unnumbered_one() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.edf");
        let new = dir.path().join("new.edf");
        create_simple_test_file(&old).unwrap();
        create_simple_test_file(&new).unwrap();

        let patient = SubjectKey::Clinical("5".to_string());
        let mut recordings = RecordingLog::default();
        recordings.record(&old, &patient, None).unwrap();

        let text = "DOC_NO,PATIENT_NAME,BIRTH_DATE,GENDER,HFL_NAME,PARA_RESULT\n5,Test Patient,1985,F,CBC,1\n";
        let reader = csv::Reader::from_reader(text.as_bytes());
        let index = ClinicalIndex::from_csv(reader, &Default::default(), Path::new("s.csv")).unwrap();

        let planned = plan(vec![new.clone(), old.clone()], &index, &recordings);
        let runs: Vec<(&Path, &SubjectKey, Option<u32>)> =
            planned.iter().map(|p| (p.path.as_path(), &p.key, p.run)).collect();
        assert_eq!(runs, vec![(new.as_path(), &patient, Some(2)), (old.as_path(), &patient, None)]);
    }
}
