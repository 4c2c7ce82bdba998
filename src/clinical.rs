//! Clinical Record Index: lab-result sheet grouped per patient identifier.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use log::{info, warn};

use crate::config::{normalize_column, ColumnNames};
use crate::error::BidsError;
use crate::normalize::normalize_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabResult {
    pub test_name: String,
    pub result: String,
    pub unit: String,
}

/// One patient, built from every sheet row sharing an identifier
#[derive(Debug, Clone)]
pub struct ClinicalRecord {
    pub identifier: String,
    /// Normalized patient name
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    /// Four-digit birth year, or empty when the birth date is unknown
    pub birth_year_suffix: String,
    pub gender: Option<String>,
    pub lab_results: Vec<LabResult>,
}

/// Read-only index over the clinical sheet; records keep first-seen order.
#[derive(Debug, Default)]
pub struct ClinicalIndex {
    records: Vec<ClinicalRecord>,
    by_identifier: HashMap<String, usize>,
}

struct ColumnPositions {
    identifier: usize,
    patient_name: usize,
    birth_date: usize,
    gender: usize,
    test_name: usize,
    result: usize,
    unit: Option<usize>,
}

impl ColumnPositions {
    fn resolve(headers: &csv::StringRecord, columns: &ColumnNames, path: &Path) -> Result<Self, BidsError> {
        let normalized: Vec<String> = headers.iter().map(normalize_column).collect();
        let find = |name: &str| {
            let wanted = normalize_column(name);
            normalized.iter().position(|h| *h == wanted)
        };

        let required = [
            &columns.identifier,
            &columns.patient_name,
            &columns.birth_date,
            &columns.gender,
            &columns.test_name,
            &columns.result,
        ];
        let missing: Vec<String> = required
            .iter()
            .filter(|name| find(name.as_str()).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BidsError::MissingColumns { path: path.to_path_buf(), missing });
        }

        let position = |name: &str| find(name).unwrap_or_default();
        Ok(ColumnPositions {
            identifier: position(&columns.identifier),
            patient_name: position(&columns.patient_name),
            birth_date: position(&columns.birth_date),
            gender: position(&columns.gender),
            test_name: position(&columns.test_name),
            result: position(&columns.result),
            unit: find(&columns.unit),
        })
    }
}

/// Text of a worksheet cell; dates become `YYYY-MM-DD`
fn cell_text(value: &Data) -> String {
    match value {
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| value.to_string()),
        Data::Empty | Data::Error(_) => String::new(),
        other => other.to_string(),
    }
}

fn cell(record: &csv::StringRecord, index: usize) -> Option<String> {
    record
        .get(index)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("nan"))
        .map(str::to_string)
}

/// Parses the birth-date spellings found in clinical exports
pub fn parse_birth_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    const DATE_FORMATS: [&str; 6] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y%m%d"];
    const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

    if let Some(date) = DATE_FORMATS.iter().find_map(|f| NaiveDate::parse_from_str(s, f).ok()) {
        return Some(date);
    }
    if let Some(dt) = DATETIME_FORMATS.iter().find_map(|f| NaiveDateTime::parse_from_str(s, f).ok()) {
        return Some(dt.date());
    }

    // 只有年份
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().ok().and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1));
    }
    None
}

impl ClinicalIndex {
    /// Loads the clinical sheet
    ///
    /// `.xlsx`, `.xlsm`, `.xls` and `.ods` workbooks are read from their
    /// first worksheet; `.tsv`/`.tab` use tabs and anything else is read as
    /// CSV.
    ///
    /// # Errors
    ///
    /// `BidsError::ClinicalSheet` or `BidsError::Workbook` when the file
    /// cannot be read and `BidsError::MissingColumns` when a required column
    /// is absent. All of them abort the run.
    pub fn load(path: &Path, columns: &ColumnNames) -> Result<Self, BidsError> {
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        let index = match extension.as_deref() {
            Some("xlsx" | "xlsm" | "xls" | "ods") => Self::load_workbook(path, columns)?,
            Some("tsv" | "tab") => Self::load_delimited(path, b'\t', columns)?,
            _ => Self::load_delimited(path, b',', columns)?,
        };

        info!(
            "Loaded {} clinical records ({} lab rows) from {}",
            index.len(),
            index.records.iter().map(|r| r.lab_results.len()).sum::<usize>(),
            path.display()
        );
        Ok(index)
    }

    fn load_delimited(path: &Path, delimiter: u8, columns: &ColumnNames) -> Result<Self, BidsError> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(path)
            .map_err(|source| BidsError::ClinicalSheet { path: path.to_path_buf(), source })?;
        Self::from_csv(reader, columns, path)
    }

    fn load_workbook(path: &Path, columns: &ColumnNames) -> Result<Self, BidsError> {
        let workbook_error = |source: calamine::Error| BidsError::Workbook { path: path.to_path_buf(), source };

        let mut workbook = open_workbook_auto(path).map_err(workbook_error)?;
        // 只读第一个工作表
        let range = workbook
            .worksheet_range_at(0)
            .unwrap_or(Err(calamine::Error::Msg("workbook has no worksheets")))
            .map_err(workbook_error)?;
        Self::from_range(&range, columns, path)
    }

    /// Builds the index from a worksheet whose first row holds the headers.
    /// `path` is only used in error messages.
    pub fn from_range(range: &Range<Data>, columns: &ColumnNames, path: &Path) -> Result<Self, BidsError> {
        let mut rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect::<csv::StringRecord>());
        let headers = rows.next().unwrap_or_default();
        Self::build(&headers, rows.map(Ok), columns, path)
    }

    /// Builds the index from an already configured `csv` reader. `path` is
    /// only used in error messages.
    pub fn from_csv<R: Read>(
        mut reader: csv::Reader<R>,
        columns: &ColumnNames,
        path: &Path,
    ) -> Result<Self, BidsError> {
        let sheet_error = |source: csv::Error| BidsError::ClinicalSheet { path: path.to_path_buf(), source };

        let headers = reader.headers().map_err(sheet_error)?.clone();
        Self::build(&headers, reader.records().map(|row| row.map_err(sheet_error)), columns, path)
    }

    fn build<I>(headers: &csv::StringRecord, rows: I, columns: &ColumnNames, path: &Path) -> Result<Self, BidsError>
    where
        I: Iterator<Item = Result<csv::StringRecord, BidsError>>,
    {
        let pos = ColumnPositions::resolve(headers, columns, path)?;

        let mut index = ClinicalIndex::default();
        for (row_number, row) in rows.enumerate() {
            let row = row?;

            let identifier = match cell(&row, pos.identifier) {
                Some(id) => id,
                None => {
                    warn!("{}: row {} has no identifier, ignored", path.display(), row_number + 2);
                    continue;
                }
            };

            let slot = match index.by_identifier.get(&identifier) {
                Some(&slot) => slot,
                None => {
                    index.records.push(ClinicalRecord {
                        identifier: identifier.clone(),
                        name: None,
                        birth_date: None,
                        birth_year_suffix: String::new(),
                        gender: None,
                        lab_results: Vec::new(),
                    });
                    index.by_identifier.insert(identifier, index.records.len() - 1);
                    index.records.len() - 1
                }
            };
            let record = &mut index.records[slot];

            // 每组取第一个非空值
            if record.name.is_none() {
                record.name = cell(&row, pos.patient_name)
                    .map(|n| normalize_name(&n))
                    .filter(|n| !n.is_empty());
            }
            if record.birth_date.is_none() {
                record.birth_date = cell(&row, pos.birth_date).and_then(|d| parse_birth_date(&d));
                if let Some(date) = record.birth_date {
                    record.birth_year_suffix = format!("{:04}", chrono::Datelike::year(&date));
                }
            }
            if record.gender.is_none() {
                record.gender = cell(&row, pos.gender);
            }

            let test_name = cell(&row, pos.test_name);
            let result = cell(&row, pos.result);
            if test_name.is_some() || result.is_some() {
                record.lab_results.push(LabResult {
                    test_name: test_name.unwrap_or_default(),
                    result: result.unwrap_or_default(),
                    unit: pos.unit.and_then(|u| cell(&row, u)).unwrap_or_default(),
                });
            }
        }

        Ok(index)
    }

    pub fn records(&self) -> &[ClinicalRecord] {
        &self.records
    }

    pub fn get(&self, identifier: &str) -> Option<&ClinicalRecord> {
        self.by_identifier.get(identifier).map(|&i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether any record carries a birth-year suffix
    pub fn has_birth_years(&self) -> bool {
        self.records.iter().any(|r| !r.birth_year_suffix.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_from(text: &str) -> Result<ClinicalIndex, BidsError> {
        let reader = csv::ReaderBuilder::new().flexible(true).from_reader(text.as_bytes());
        ClinicalIndex::from_csv(reader, &ColumnNames::default(), Path::new("sheet.csv"))
    }

    #[test]
    fn test_rows_group_by_identifier() {
        let index = index_from(
            "DOC_NO,PATIENT_NAME,BIRTH_DATE,GENDER,HFL_NAME,PARA_RESULT,UNIT\n\
             7,Trần Thị B,1985-03-01,Female,CBC,4.2,10^9/L\n\
             7,,,,HGB,135,g/L\n\
             9,Lê Văn C,,Male,CRP,<5,mg/L\n",
        )
        .unwrap();

        assert_eq!(index.len(), 2);
        let record = index.get("7").unwrap();
        assert_eq!(record.name.as_deref(), Some("TRAN THI B"));
        assert_eq!(record.birth_year_suffix, "1985");
        assert_eq!(record.gender.as_deref(), Some("Female"));
        assert_eq!(record.lab_results.len(), 2);
        assert_eq!(record.lab_results[1].unit, "g/L");

        let record = index.get("9").unwrap();
        assert_eq!(record.birth_year_suffix, "");
        assert!(index.has_birth_years());
        assert_eq!(index.records()[0].identifier, "7");
    }

    #[test]
    fn test_headers_match_loosely_and_unit_is_optional() {
        let index = index_from(
            " doc no ,Patient Name,birth_date,Gender,HFL_NAME,para result\n\
             A1,X Y,,M,Na,140\n",
        )
        .unwrap();
        let record = index.get("A1").unwrap();
        assert_eq!(record.lab_results[0].unit, "");
        assert!(!index.has_birth_years());
    }

    #[test]
    fn test_missing_columns_are_listed() {
        match index_from("DOC_NO,PATIENT_NAME,GENDER\n1,A,M\n") {
            Err(BidsError::MissingColumns { missing, .. }) => {
                assert_eq!(missing, vec!["BIRTH_DATE", "HFL_NAME", "PARA_RESULT"]);
            }
            other => panic!("expected missing columns, got {:?}", other.map(|i| i.len())),
        }
    }

    #[test]
    fn test_birth_date_formats() {
        let expected = NaiveDate::from_ymd_opt(1985, 3, 1);
        for s in ["1985-03-01", "1985-03-01 00:00:00", "1985/03/01", "01/03/1985", "01-03-1985", "01.03.1985", "19850301"] {
            assert_eq!(parse_birth_date(s), expected, "format {:?}", s);
        }
        assert_eq!(parse_birth_date("1985"), NaiveDate::from_ymd_opt(1985, 1, 1));
        assert_eq!(parse_birth_date("unknown"), None);
    }

    #[test]
    fn test_tsv_sheet_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labs.tsv");
        std::fs::write(
            &path,
            "DOC_NO\tPATIENT_NAME\tBIRTH_DATE\tGENDER\tHFL_NAME\tPARA_RESULT\n42\tAn\t1990\tF\tCBC\t5\n",
        )
        .unwrap();
        let index = ClinicalIndex::load(&path, &ColumnNames::default()).unwrap();
        assert_eq!(index.get("42").unwrap().birth_year_suffix, "1990");
    }

    #[test]
    fn test_worksheet_rows_feed_the_same_columns() {
        let mut range: Range<Data> = Range::new((0, 0), (2, 6));
        let headers = ["DOC_NO", "PATIENT_NAME", "BIRTH_DATE", "GENDER", "HFL_NAME", "PARA_RESULT", "UNIT"];
        for (col, header) in headers.iter().enumerate() {
            range.set_value((0, col as u32), Data::String(header.to_string()));
        }
        range.set_value((1, 0), Data::Float(7.0));
        range.set_value((1, 1), Data::String("Trần Thị B".to_string()));
        range.set_value((1, 2), Data::String("1985-03-01".to_string()));
        range.set_value((1, 3), Data::String("Female".to_string()));
        range.set_value((1, 4), Data::String("CBC".to_string()));
        range.set_value((1, 5), Data::Float(4.2));
        range.set_value((1, 6), Data::String("10^9/L".to_string()));
        range.set_value((2, 0), Data::Int(7));
        range.set_value((2, 4), Data::String("HGB".to_string()));
        range.set_value((2, 5), Data::Int(135));

        let index = ClinicalIndex::from_range(&range, &ColumnNames::default(), Path::new("labs.xlsx")).unwrap();
        assert_eq!(index.len(), 1);
        let record = index.get("7").unwrap();
        assert_eq!(record.name.as_deref(), Some("TRAN THI B"));
        assert_eq!(record.birth_year_suffix, "1985");
        assert_eq!(
            record.lab_results,
            vec![
                LabResult { test_name: "CBC".to_string(), result: "4.2".to_string(), unit: "10^9/L".to_string() },
                LabResult { test_name: "HGB".to_string(), result: "135".to_string(), unit: String::new() },
            ]
        );
    }

    #[test]
    fn test_worksheet_without_columns_is_rejected() {
        let mut range: Range<Data> = Range::new((0, 0), (0, 1));
        range.set_value((0, 0), Data::String("DOC_NO".to_string()));
        range.set_value((0, 1), Data::String("PATIENT_NAME".to_string()));
        assert!(matches!(
            ClinicalIndex::from_range(&range, &ColumnNames::default(), Path::new("labs.xlsx")),
            Err(BidsError::MissingColumns { .. })
        ));
    }

    #[test]
    fn test_corrupt_workbook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labs.xlsx");
        std::fs::write(&path, "DOC_NO,PATIENT_NAME\n1,A\n").unwrap();
        let result = ClinicalIndex::load(&path, &ColumnNames::default());
        assert!(matches!(result, Err(BidsError::Workbook { .. })));
    }

    #[test]
    fn test_unreadable_sheet_is_an_error() {
        let result = ClinicalIndex::load(Path::new("/nonexistent/labs.csv"), &ColumnNames::default());
        assert!(matches!(result, Err(BidsError::ClinicalSheet { .. })));
    }
}
