//! Exact-after-normalization matching of a recording to a clinical record.

use log::{debug, warn};

use crate::clinical::{ClinicalIndex, ClinicalRecord};
use crate::identity::CandidateIdentity;

/// Finds the clinical record for a candidate identity
///
/// When the candidate carries a birth-year suffix and the index has birth
/// years at all, both the normalized name and the suffix must agree (the
/// record's four-digit year must end with the suffix). Otherwise the name
/// alone decides. The first matching record in sheet order is returned;
/// more than one match is logged as ambiguous.
pub fn find_match<'a>(candidate: &CandidateIdentity, index: &'a ClinicalIndex) -> Option<&'a ClinicalRecord> {
    let name = candidate.name.as_deref()?;

    let suffix = candidate
        .birth_year_suffix
        .as_deref()
        .filter(|s| !s.is_empty() && index.has_birth_years());

    let mut matches = index.records().iter().filter(|record| {
        record.name.as_deref() == Some(name)
            && suffix.map_or(true, |s| record.birth_year_suffix.ends_with(s))
    });

    let first = matches.next()?;
    let others = matches.count();
    if others > 0 {
        warn!(
            "{}: {} clinical records match {:?}, using identifier {}",
            candidate.source_path.display(),
            others + 1,
            name,
            first.identifier
        );
    }

    debug!(
        "{}: matched {:?} (suffix {:?}) to identifier {}",
        candidate.source_path.display(),
        name,
        suffix,
        first.identifier
    );
    Some(first)
}
