use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Unique decedent case identifier, e.g. "ME2020-04211".
///
/// A case shows up once per morbidity it is tagged with, so row counts
/// overcount deaths; anything that counts deaths must count distinct ids.
pub type CaseId = String;

/// A demographic axis with an explicit "no restriction" sentinel.
///
/// Filter sets, grouping keys and labels all treat the sentinel the same way:
/// it disables the predicate, collapses the grouping dimension, and drops the
/// clause from the series label.
pub trait Dimension: Copy + Eq + std::hash::Hash {
    fn all() -> Self;

    fn is_all(&self) -> bool {
        *self == Self::all()
    }
}

fn normalized(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

// ---------- sex -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    Unknown,
    All,
}

impl Dimension for Sex {
    fn all() -> Self {
        Sex::All
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sex::Female => "Female",
            Sex::Male => "Male",
            Sex::Unknown => "Unknown",
            Sex::All => "All",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSexError;

impl fmt::Display for ParseSexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown sex")
    }
}

impl std::error::Error for ParseSexError {}

impl FromStr for Sex {
    type Err = ParseSexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "female" | "f" => Ok(Sex::Female),
            "male" | "m" => Ok(Sex::Male),
            "unknown" | "" => Ok(Sex::Unknown),
            "all" => Ok(Sex::All),
            _ => Err(ParseSexError),
        }
    }
}

// ---------- race ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Race {
    White,
    Black,
    Asian,
    AmericanIndian,
    Other,
    Unknown,
    All,
}

impl Dimension for Race {
    fn all() -> Self {
        Race::All
    }
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Race::White => "White",
            Race::Black => "Black",
            Race::Asian => "Asian",
            Race::AmericanIndian => "Am. Indian",
            Race::Other => "Other",
            Race::Unknown => "Unknown",
            Race::All => "All",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRaceError;

impl fmt::Display for ParseRaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown race")
    }
}

impl std::error::Error for ParseRaceError {}

impl FromStr for Race {
    type Err = ParseRaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "white" => Ok(Race::White),
            "black" => Ok(Race::Black),
            "asian" => Ok(Race::Asian),
            "am. indian" | "am indian" | "american indian" => Ok(Race::AmericanIndian),
            "other" => Ok(Race::Other),
            "unknown" | "" => Ok(Race::Unknown),
            "all" => Ok(Race::All),
            _ => Err(ParseRaceError),
        }
    }
}

// ---------- age buckets -----------------------------------------------------

/// Fixed, ordered age buckets used by the medical-examiner extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgeGroup {
    Under18,
    From19To29,
    From30To39,
    From40To49,
    From50To59,
    From60To69,
    From70To79,
    From80To89,
    From90To99,
    Over100,
    Unknown,
    All,
}

/// Concrete buckets in display order (sentinel and Unknown excluded).
pub const AGE_BUCKETS: [AgeGroup; 10] = [
    AgeGroup::Under18,
    AgeGroup::From19To29,
    AgeGroup::From30To39,
    AgeGroup::From40To49,
    AgeGroup::From50To59,
    AgeGroup::From60To69,
    AgeGroup::From70To79,
    AgeGroup::From80To89,
    AgeGroup::From90To99,
    AgeGroup::Over100,
];

impl AgeGroup {
    /// Bucket a raw age; a missing age is the Unknown bucket.
    pub fn from_age(age: Option<u32>) -> Self {
        match age {
            None => AgeGroup::Unknown,
            Some(a) => match a {
                0..=18 => AgeGroup::Under18,
                19..=29 => AgeGroup::From19To29,
                30..=39 => AgeGroup::From30To39,
                40..=49 => AgeGroup::From40To49,
                50..=59 => AgeGroup::From50To59,
                60..=69 => AgeGroup::From60To69,
                70..=79 => AgeGroup::From70To79,
                80..=89 => AgeGroup::From80To89,
                90..=99 => AgeGroup::From90To99,
                _ => AgeGroup::Over100,
            },
        }
    }
}

impl Dimension for AgeGroup {
    fn all() -> Self {
        AgeGroup::All
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgeGroup::Under18 => "< 18 Yrs",
            AgeGroup::From19To29 => "19-29 Yrs",
            AgeGroup::From30To39 => "30-39 Yrs",
            AgeGroup::From40To49 => "40-49 Yrs",
            AgeGroup::From50To59 => "50-59 Yrs",
            AgeGroup::From60To69 => "60-69 Yrs",
            AgeGroup::From70To79 => "70-79 Yrs",
            AgeGroup::From80To89 => "80-89 Yrs",
            AgeGroup::From90To99 => "90-99 Yrs",
            AgeGroup::Over100 => "100 Yrs <",
            AgeGroup::Unknown => "Unknown",
            AgeGroup::All => "All",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAgeGroupError;

impl fmt::Display for ParseAgeGroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown age group")
    }
}

impl std::error::Error for ParseAgeGroupError {}

impl FromStr for AgeGroup {
    type Err = ParseAgeGroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "< 18 yrs" | "<18" | "< 18" => Ok(AgeGroup::Under18),
            "19-29 yrs" | "19-29" => Ok(AgeGroup::From19To29),
            "30-39 yrs" | "30-39" => Ok(AgeGroup::From30To39),
            "40-49 yrs" | "40-49" => Ok(AgeGroup::From40To49),
            "50-59 yrs" | "50-59" => Ok(AgeGroup::From50To59),
            "60-69 yrs" | "60-69" => Ok(AgeGroup::From60To69),
            "70-79 yrs" | "70-79" => Ok(AgeGroup::From70To79),
            "80-89 yrs" | "80-89" => Ok(AgeGroup::From80To89),
            "90-99 yrs" | "90-99" => Ok(AgeGroup::From90To99),
            // the raw extract sometimes carries an O-for-zero typo
            "100 yrs <" | "10o yrs <" | "100+" => Ok(AgeGroup::Over100),
            "unknown" => Ok(AgeGroup::Unknown),
            "all" => Ok(AgeGroup::All),
            _ => Err(ParseAgeGroupError),
        }
    }
}

// ---------- morbidity -------------------------------------------------------

/// Controlled morbidity vocabulary.
///
/// `AllDeaths` is this axis' sentinel: selecting it means "no morbidity
/// restriction", and distinct-case counting collapses the co-morbidity
/// fan-out back to one row per case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Morbidity {
    AllDeaths,
    Covid19,
    Hypertension,
    Diabetes,
    Cardiovascular,
    Cancer,
    Pulmonary,
    Renal,
    Obesity,
    Neurologic,
    Immunocompromised,
    Other,
    Unknown,
}

impl Dimension for Morbidity {
    fn all() -> Self {
        Morbidity::AllDeaths
    }
}

impl fmt::Display for Morbidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Morbidity::AllDeaths => "All Deaths",
            Morbidity::Covid19 => "Covid-19",
            Morbidity::Hypertension => "Hypertension",
            Morbidity::Diabetes => "Diabetes",
            Morbidity::Cardiovascular => "Cardiovascular Disease",
            Morbidity::Cancer => "Cancer",
            Morbidity::Pulmonary => "Pulmonary Disease",
            Morbidity::Renal => "Renal Disease",
            Morbidity::Obesity => "Obesity",
            Morbidity::Neurologic => "Neurologic Disease",
            Morbidity::Immunocompromised => "Immunocompromised",
            Morbidity::Other => "Other",
            Morbidity::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMorbidityError;

impl fmt::Display for ParseMorbidityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown morbidity category")
    }
}

impl std::error::Error for ParseMorbidityError {}

impl FromStr for Morbidity {
    type Err = ParseMorbidityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "all deaths" => Ok(Morbidity::AllDeaths),
            "covid-19" | "covid" => Ok(Morbidity::Covid19),
            "hypertension" => Ok(Morbidity::Hypertension),
            "diabetes" => Ok(Morbidity::Diabetes),
            "cardiovascular" | "cardiovascular disease" => Ok(Morbidity::Cardiovascular),
            "cancer" => Ok(Morbidity::Cancer),
            "pulmonary" | "pulmonary disease" => Ok(Morbidity::Pulmonary),
            "renal" | "renal disease" => Ok(Morbidity::Renal),
            "obesity" => Ok(Morbidity::Obesity),
            "neurologic" | "neurological" | "neurologic disease" => Ok(Morbidity::Neurologic),
            "immunocompromised" => Ok(Morbidity::Immunocompromised),
            "other" => Ok(Morbidity::Other),
            "unknown" | "" => Ok(Morbidity::Unknown),
            _ => Err(ParseMorbidityError),
        }
    }
}

// ---------- records and the store -------------------------------------------

/// One decedent case row as delivered by the loader.
///
/// `date_of_death` is `None` when the source date failed coercion; such rows
/// are kept in the store but can never satisfy a date predicate.
/// `population` is the denominator of the demographic cell this row belongs
/// to, present only when the extract joined one in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub case_id: CaseId,
    pub date_of_death: Option<NaiveDate>,
    pub age: Option<u32>,
    pub age_group: AgeGroup,
    pub sex: Sex,
    pub race: Race,
    pub morbidity: Morbidity,
    pub population: Option<u64>,
}

/// Immutable in-memory table of death records. Built once by the loader,
/// shared read-only for the rest of the process life.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<Record>,
}

impl RecordStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest and latest dated rows, if any row carries a date.
    pub fn date_bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut bounds: Option<(NaiveDate, NaiveDate)> = None;
        for d in self.records.iter().filter_map(|r| r.date_of_death) {
            bounds = Some(match bounds {
                None => (d, d),
                Some((lo, hi)) => (lo.min(d), hi.max(d)),
            });
        }
        bounds
    }

    /// Distinct cases per concrete morbidity, most frequent first.
    /// Drives the ordering of the morbidity multi-select options.
    pub fn morbidity_counts(&self) -> Vec<(Morbidity, usize)> {
        let mut cases: HashMap<Morbidity, HashSet<&str>> = HashMap::new();
        for r in &self.records {
            if r.morbidity.is_all() {
                continue;
            }
            cases
                .entry(r.morbidity)
                .or_default()
                .insert(r.case_id.as_str());
        }
        let mut counts: Vec<(Morbidity, usize)> =
            cases.into_iter().map(|(m, ids)| (m, ids.len())).collect();
        // descending by count; tie-break on display name so the order is stable
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        counts
    }
}

// ---------- filter selection ------------------------------------------------

/// Inclusive calendar interval. An inverted interval is a valid, empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Trailing-window granularity offered by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendWindow {
    Daily,
    SevenDay,
    ThirtyDay,
}

impl TrendWindow {
    /// Number of trailing observations the window covers.
    pub fn observations(&self) -> usize {
        match self {
            TrendWindow::Daily => 1,
            TrendWindow::SevenDay => 7,
            TrendWindow::ThirtyDay => 30,
        }
    }
}

impl fmt::Display for TrendWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrendWindow::Daily => "Daily",
            TrendWindow::SevenDay => "7 Day",
            TrendWindow::ThirtyDay => "30 Day",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTrendWindowError;

impl fmt::Display for ParseTrendWindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown trend window")
    }
}

impl std::error::Error for ParseTrendWindowError {}

impl FromStr for TrendWindow {
    type Err = ParseTrendWindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "1" | "daily" => Ok(TrendWindow::Daily),
            "7" | "7 day" | "7d" => Ok(TrendWindow::SevenDay),
            "30" | "30 day" | "30d" => Ok(TrendWindow::ThirtyDay),
            _ => Err(ParseTrendWindowError),
        }
    }
}

/// The current widget state: a date interval plus one ordered multi-select
/// per demographic axis. Order matters downstream — series are emitted in
/// the order the values were selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSelection {
    pub dates: DateRange,
    pub age_groups: Vec<AgeGroup>,
    pub sexes: Vec<Sex>,
    pub races: Vec<Race>,
    pub morbidities: Vec<Morbidity>,
}

/// Collapse a multi-select to its effective value list: the sentinel swallows
/// everything else, and repeats keep only their first occurrence.
pub fn collapse_selection<D: Dimension>(values: &[D]) -> Vec<D> {
    if values.iter().any(D::is_all) {
        return vec![D::all()];
    }
    let mut seen = Vec::with_capacity(values.len());
    for &v in values {
        if !seen.contains(&v) {
            seen.push(v);
        }
    }
    seen
}

/// True when `value` passes the multi-select for its axis.
pub fn selection_allows<D: Dimension>(values: &[D], value: D) -> bool {
    values.iter().any(D::is_all) || values.contains(&value)
}

impl FilterSelection {
    /// A selection that restricts nothing: every axis at its sentinel.
    pub fn unrestricted(dates: DateRange) -> Self {
        Self {
            dates,
            age_groups: vec![AgeGroup::All],
            sexes: vec![Sex::All],
            races: vec![Race::All],
            morbidities: vec![Morbidity::AllDeaths],
        }
    }

    /// True when any axis selects nothing at all (which yields no data,
    /// not an error).
    pub fn selects_nothing(&self) -> bool {
        self.dates.is_empty()
            || self.age_groups.is_empty()
            || self.sexes.is_empty()
            || self.races.is_empty()
            || self.morbidities.is_empty()
    }
}
