use chrono::NaiveDate;
use mortality_core::{AgeGroup, Morbidity, Race, Record, RecordStore, Sex};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// One raw line of the medical-examiner extract, untyped.
/// Everything except the case number is optional in the wild.
#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "CASE_NUMBER")]
    case_number: String,
    #[serde(rename = "DATE_OF_DEATH", default)]
    date_of_death: String,
    #[serde(rename = "AGE", default)]
    age: String,
    #[serde(rename = "AGE_GROUP", default)]
    age_group: String,
    #[serde(rename = "SEX", default)]
    sex: String,
    #[serde(rename = "RACE", default)]
    race: String,
    #[serde(rename = "MORBIDITY", default)]
    morbidity: String,
    #[serde(rename = "POPULATION", default)]
    population: String,
}

/// The extract has shipped both ISO and US date forms over time.
fn coerce_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}

fn coerce_record(row: RawRow) -> Option<Record> {
    let case_id = row.case_number.trim().to_string();
    if case_id.is_empty() {
        // a row without an identifier cannot be distinct-counted
        warn!("skipping row without a case number");
        return None;
    }

    let date_of_death = coerce_date(&row.date_of_death);
    if date_of_death.is_none() && !row.date_of_death.trim().is_empty() {
        warn!(case = %case_id, raw = %row.date_of_death, "unparsable date of death");
    }

    let age = row.age.trim().parse::<u32>().ok();
    let age_group = match row.age_group.parse::<AgeGroup>() {
        Ok(bucket) => bucket,
        Err(_) => {
            debug!(case = %case_id, raw = %row.age_group, "rebucketing age group from age");
            AgeGroup::from_age(age)
        }
    };
    let sex = row.sex.parse::<Sex>().unwrap_or_else(|_| {
        warn!(case = %case_id, raw = %row.sex, "unrecognized sex, keeping as Unknown");
        Sex::Unknown
    });
    let race = row.race.parse::<Race>().unwrap_or_else(|_| {
        warn!(case = %case_id, raw = %row.race, "unrecognized race, keeping as Unknown");
        Race::Unknown
    });
    let morbidity = row.morbidity.parse::<Morbidity>().unwrap_or_else(|_| {
        warn!(case = %case_id, raw = %row.morbidity, "unrecognized morbidity, keeping as Unknown");
        Morbidity::Unknown
    });
    let population = row.population.trim().parse::<u64>().ok();

    Some(Record {
        case_id,
        date_of_death,
        age,
        age_group,
        sex,
        race,
        morbidity,
        population,
    })
}

/// Read the extract from any byte source into a fully typed store.
///
/// Rows survive bad values: a broken date stays in the store undated, a dirty
/// dimension string becomes the Unknown category. Only rows with no case
/// number at all are dropped.
pub fn read_csv<R: Read>(reader: R) -> Result<RecordStore, FeedError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in csv_reader.deserialize::<RawRow>() {
        match coerce_record(row?) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    let undated = records.iter().filter(|r| r.date_of_death.is_none()).count();
    info!(
        rows = records.len(),
        skipped, undated, "loaded mortality extract"
    );
    Ok(RecordStore::new(records))
}

/// Load the extract from disk.
pub fn load_csv(path: impl AsRef<Path>) -> Result<RecordStore, FeedError> {
    let file = File::open(path.as_ref())?;
    read_csv(file)
}
