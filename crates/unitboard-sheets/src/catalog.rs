//! Reshaping raw tab rows into the structure the form consumes.
//!
//! Everything here is pure: the endpoint reads the `units` and `school`
//! tabs, and these functions turn the header-keyed rows into the grade
//! list, school list, and per-grade unit listing.

use std::collections::BTreeMap;

use serde::Serialize;

pub const GRADE_COLUMN: &str = "grade";
pub const NUMBER_COLUMN: &str = "number";
pub const UNITS_COLUMN: &str = "units";
pub const SCHOOL_COLUMN: &str = "school";

/// One curriculum unit as read from the `units` tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRow {
    pub grade: String,
    pub number: String,
    pub unit_name: String,
}

/// One selectable unit in the lookup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitEntry {
    pub number: String,
    pub unit: String,
}

/// The lookup structure: distinct grades, deduplicated schools, and units
/// grouped per grade in source-row order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub grades: Vec<String>,
    pub schools: Vec<String>,
    pub units_by_grade: BTreeMap<String, Vec<UnitEntry>>,
}

/// Extract unit rows from the `units` tab. A row survives only if grade,
/// number, and unit name are all non-empty after trimming.
pub fn unit_rows(records: &[BTreeMap<String, String>]) -> Vec<UnitRow> {
    records
        .iter()
        .filter_map(|record| {
            let grade = field(record, GRADE_COLUMN);
            let number = field(record, NUMBER_COLUMN);
            let unit_name = field(record, UNITS_COLUMN);
            if grade.is_empty() || number.is_empty() || unit_name.is_empty() {
                return None;
            }
            Some(UnitRow {
                grade,
                number,
                unit_name,
            })
        })
        .collect()
}

/// Extract school names from the `school` tab, in source order. Empty cells
/// are skipped; deduplication happens in [`build_catalog`].
pub fn school_names(records: &[BTreeMap<String, String>]) -> Vec<String> {
    records
        .iter()
        .map(|record| field(record, SCHOOL_COLUMN))
        .filter(|name| !name.is_empty())
        .collect()
}

pub fn build_catalog(units: Vec<UnitRow>, schools: Vec<String>) -> Catalog {
    let mut units_by_grade: BTreeMap<String, Vec<UnitEntry>> = BTreeMap::new();
    for row in units {
        units_by_grade
            .entry(row.grade)
            .or_default()
            .push(UnitEntry {
                number: row.number,
                unit: row.unit_name,
            });
    }

    let mut grades: Vec<String> = units_by_grade.keys().cloned().collect();
    grades.sort_by_key(grade_sort_key);

    let mut schools = schools;
    schools.sort();
    schools.dedup();

    Catalog {
        grades,
        schools,
        units_by_grade,
    }
}

/// Grades sort numerically when they parse as integers; anything else sorts
/// after every numeric grade, alphabetically among itself.
fn grade_sort_key(grade: &String) -> (i64, String) {
    match grade.parse::<i64>() {
        Ok(n) => (n, String::new()),
        Err(_) => (i64::MAX, grade.clone()),
    }
}

fn field(record: &BTreeMap<String, String>, column: &str) -> String {
    record
        .get(column)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}
