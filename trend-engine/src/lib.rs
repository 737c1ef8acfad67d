use chrono::NaiveDate;
use mortality_core::{
    collapse_selection, selection_allows, AgeGroup, Dimension, FilterSelection, Morbidity, Race,
    Record, RecordStore, Sex, TrendWindow,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// One point of the demographic cross-product: the unit over which counts,
/// rates and smoothing are computed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DemographicKey {
    pub age_group: AgeGroup,
    pub sex: Sex,
    pub race: Race,
    pub morbidity: Morbidity,
}

/// One aggregated group: distinct cases for a (date, demographic) cell.
///
/// `population` is the cell's denominator carried through from the records;
/// `per_100k` is filled in by [`normalize`] and stays `None` for cells
/// without a usable denominator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub date: Option<NaiveDate>,
    pub key: DemographicKey,
    pub cases: u64,
    pub population: Option<u64>,
    pub per_100k: Option<f64>,
}

/// Which value column feeds the smoother and the emitted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Cases,
    Per100k,
}

/// A (date?, key, value) observation after the measure has been chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRow {
    pub date: Option<NaiveDate>,
    pub key: DemographicKey,
    pub value: f64,
}

/// One chart-ready series: a label plus equal-length x/y sequences.
/// `dates` is `None` for tabular (no time axis) output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub label: String,
    pub dates: Option<Vec<NaiveDate>>,
    pub values: Vec<f64>,
}

/// Everything one dashboard callback needs: the widget state plus mode flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRequest {
    pub selection: FilterSelection,
    pub window: TrendWindow,
    pub per_capita: bool,
    pub time_axis: bool,
}

// ---------- filter ----------------------------------------------------------

/// Narrow the store to the rows matching the date interval and every
/// dimension multi-select. A selection that selects nothing on any axis
/// (including an inverted date range) matches no rows.
///
/// Rows without a date never satisfy the date predicate and drop out here.
pub fn filter<'a>(store: &'a RecordStore, selection: &FilterSelection) -> Vec<&'a Record> {
    if selection.selects_nothing() {
        return Vec::new();
    }
    store
        .records()
        .iter()
        .filter(|r| {
            matches!(r.date_of_death, Some(d) if selection.dates.contains(d))
                && selection_allows(&selection.age_groups, r.age_group)
                && selection_allows(&selection.sexes, r.sex)
                && selection_allows(&selection.races, r.race)
                && selection_allows(&selection.morbidities, r.morbidity)
        })
        .collect()
}

// ---------- aggregate -------------------------------------------------------

/// A record's value on one axis, collapsed to the sentinel when the
/// selection does not restrict that axis.
fn collapse_dim<D: Dimension>(selected: &[D], value: D) -> D {
    if selected.iter().any(D::is_all) {
        D::all()
    } else {
        value
    }
}

struct CellAccum<'a> {
    case_ids: HashSet<&'a str>,
    population: Option<u64>,
    population_conflict: bool,
}

impl<'a> CellAccum<'a> {
    fn new() -> Self {
        Self {
            case_ids: HashSet::new(),
            population: None,
            population_conflict: false,
        }
    }

    fn absorb(&mut self, record: &'a Record) {
        self.case_ids.insert(record.case_id.as_str());
        match (self.population, record.population) {
            (None, Some(p)) if !self.population_conflict => self.population = Some(p),
            (Some(existing), Some(p)) if existing != p => {
                // collapsed dimensions merged cells with different
                // denominators; there is no single value to carry
                self.population = None;
                self.population_conflict = true;
            }
            _ => {}
        }
    }
}

/// Collapse the filtered rows into distinct-case counts per
/// (date?, age-group, sex, race, morbidity) tuple.
///
/// Output order is stable: date ascending, then demographic tuples in the
/// order the selection's cross-product lists them. Repeat calls with the
/// same input produce the same row order.
pub fn aggregate(
    subset: &[&Record],
    selection: &FilterSelection,
    with_time_axis: bool,
) -> Vec<GroupRow> {
    let ages = collapse_selection(&selection.age_groups);
    let sexes = collapse_selection(&selection.sexes);
    let races = collapse_selection(&selection.races);
    let morbidities = collapse_selection(&selection.morbidities);

    let mut key_order: HashMap<DemographicKey, usize> = HashMap::new();
    for &age_group in &ages {
        for &sex in &sexes {
            for &race in &races {
                for &morbidity in &morbidities {
                    let key = DemographicKey {
                        age_group,
                        sex,
                        race,
                        morbidity,
                    };
                    let next = key_order.len();
                    key_order.entry(key).or_insert(next);
                }
            }
        }
    }

    let mut cells: HashMap<(Option<NaiveDate>, DemographicKey), CellAccum<'_>> = HashMap::new();
    for record in subset {
        let date = if with_time_axis {
            match record.date_of_death {
                Some(d) => Some(d),
                // undated rows cannot be placed on a time axis
                None => continue,
            }
        } else {
            None
        };
        let key = DemographicKey {
            age_group: collapse_dim(&ages, record.age_group),
            sex: collapse_dim(&sexes, record.sex),
            race: collapse_dim(&races, record.race),
            morbidity: collapse_dim(&morbidities, record.morbidity),
        };
        cells
            .entry((date, key))
            .or_insert_with(CellAccum::new)
            .absorb(record);
    }

    let mut rows: Vec<GroupRow> = cells
        .into_iter()
        .map(|((date, key), accum)| GroupRow {
            date,
            key,
            cases: accum.case_ids.len() as u64,
            population: accum.population,
            per_100k: None,
        })
        .collect();
    rows.sort_by_key(|row| (row.date, key_order.get(&row.key).copied().unwrap_or(usize::MAX)));
    rows
}

// ---------- normalize -------------------------------------------------------

/// Fill in the per-100,000 rate wherever the cell has a positive denominator.
/// Cells without one keep `per_100k = None` and are later excluded from
/// per-capita output; they are never coerced to zero.
pub fn normalize(rows: &[GroupRow]) -> Vec<GroupRow> {
    rows.iter()
        .map(|row| {
            let per_100k = match row.population {
                Some(p) if p > 0 => Some(row.cases as f64 / p as f64 * 100_000.0),
                _ => None,
            };
            GroupRow {
                per_100k,
                ..row.clone()
            }
        })
        .collect()
}

/// Project the chosen measure out of the aggregated table. Cells whose
/// per-capita rate is undefined are dropped here, not zeroed.
pub fn measure_values(rows: &[GroupRow], measure: Measure) -> Vec<ValueRow> {
    rows.iter()
        .filter_map(|row| {
            let value = match measure {
                Measure::Cases => Some(row.cases as f64),
                Measure::Per100k => row.per_100k,
            }?;
            Some(ValueRow {
                date: row.date,
                key: row.key,
                value,
            })
        })
        .collect()
}

// ---------- smooth ----------------------------------------------------------

/// Replace each value with the trailing mean of the last `window`
/// observations of its own demographic tuple.
///
/// The leading edge uses whatever history exists (minimum one observation),
/// so the series is defined from its first date. Gaps in the date coverage
/// are left alone: the window slides over observations, not calendar days.
pub fn smooth(rows: Vec<ValueRow>, window: TrendWindow) -> Vec<ValueRow> {
    let span = window.observations();
    if span <= 1 {
        // daily mode is the raw count, not a one-wide mean of itself
        return rows;
    }
    let mut states: HashMap<DemographicKey, (VecDeque<f64>, f64)> = HashMap::new();
    rows.into_iter()
        .map(|mut row| {
            let (win, sum) = states.entry(row.key).or_default();
            win.push_back(row.value);
            *sum += row.value;
            if win.len() > span {
                if let Some(old) = win.pop_front() {
                    *sum -= old;
                }
            }
            row.value = *sum / win.len() as f64;
            row
        })
        .collect()
}

// ---------- label -----------------------------------------------------------

/// Compact display label for a demographic tuple. Axes at their sentinel
/// contribute no clause ("All Deaths" collapses like "All"); the fully
/// collapsed tuple is "Total Pop.".
pub fn label(key: &DemographicKey) -> String {
    let age = (!key.age_group.is_all()).then(|| key.age_group.to_string());
    let sex = (!key.sex.is_all()).then(|| key.sex.to_string());
    let race = (!key.race.is_all()).then(|| key.race.to_string());
    let morbidity = (!key.morbidity.is_all()).then(|| key.morbidity.to_string());

    let who = match (sex, race) {
        (Some(s), Some(r)) => Some(format!("{s}, {r}")),
        (Some(s), None) => Some(s),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    };
    let base = match (age, who) {
        (Some(a), Some(w)) => format!("Ages: {a} for {w} Pop."),
        (Some(a), None) => format!("{a} Pop."),
        (None, Some(w)) => format!("{w} Pop."),
        (None, None) => {
            if morbidity.is_none() {
                return "Total Pop.".to_string();
            }
            "Pop.".to_string()
        }
    };
    match morbidity {
        Some(m) => format!("{base} with {m}"),
        None => base,
    }
}

// ---------- emit ------------------------------------------------------------

/// Assemble the final ordered series list: one labeled series per selected
/// demographic combination that has data, iterated in selection order.
/// Combinations with no matching rows are omitted, not emitted empty.
pub fn emit(selection: &FilterSelection, rows: &[ValueRow], with_time_axis: bool) -> Vec<Series> {
    let mut by_key: HashMap<DemographicKey, (Vec<NaiveDate>, Vec<f64>)> = HashMap::new();
    for row in rows {
        let (dates, values) = by_key.entry(row.key).or_default();
        if let Some(d) = row.date {
            dates.push(d);
        }
        values.push(row.value);
    }

    let mut out = Vec::new();
    for age_group in collapse_selection(&selection.age_groups) {
        for sex in collapse_selection(&selection.sexes) {
            for race in collapse_selection(&selection.races) {
                for morbidity in collapse_selection(&selection.morbidities) {
                    let key = DemographicKey {
                        age_group,
                        sex,
                        race,
                        morbidity,
                    };
                    if let Some((dates, values)) = by_key.remove(&key) {
                        out.push(Series {
                            label: label(&key),
                            dates: with_time_axis.then_some(dates),
                            values,
                        });
                    }
                }
            }
        }
    }
    out
}

// ---------- pipeline --------------------------------------------------------

/// Run the whole pipeline for one request:
/// filter -> aggregate -> normalize -> smooth -> label -> emit.
///
/// Pure in the store and the request; an empty result at any stage flows
/// through to an empty series list.
pub fn trends(store: &RecordStore, request: &TrendRequest) -> Vec<Series> {
    let subset = filter(store, &request.selection);
    let mut rows = aggregate(&subset, &request.selection, request.time_axis);
    let measure = if request.per_capita {
        rows = normalize(&rows);
        Measure::Per100k
    } else {
        Measure::Cases
    };
    let mut values = measure_values(&rows, measure);
    if request.time_axis {
        values = smooth(values, request.window);
    }
    emit(&request.selection, &values, request.time_axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mortality_core::DateRange;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 4, day).unwrap()
    }

    fn mk_record(case: &str, day: u32, morbidity: Morbidity) -> Record {
        Record {
            case_id: case.to_string(),
            date_of_death: Some(d(day)),
            age: Some(67),
            age_group: AgeGroup::From60To69,
            sex: Sex::Male,
            race: Race::White,
            morbidity,
            population: Some(10_000),
        }
    }

    fn unrestricted(start_day: u32, end_day: u32) -> FilterSelection {
        FilterSelection::unrestricted(DateRange::new(d(start_day), d(end_day)))
    }

    fn daily_request(selection: FilterSelection) -> TrendRequest {
        TrendRequest {
            selection,
            window: TrendWindow::Daily,
            per_capita: false,
            time_axis: true,
        }
    }

    #[test]
    fn distinct_counting_across_comorbidity_fanout() {
        // one case tagged twice: counted once per morbidity group, but only
        // once under the all-deaths aggregate
        let store = RecordStore::new(vec![
            mk_record("c1", 1, Morbidity::Diabetes),
            mk_record("c1", 1, Morbidity::Cancer),
            mk_record("c2", 1, Morbidity::Cancer),
        ]);
        let mut selection = unrestricted(1, 1);
        selection.morbidities = vec![Morbidity::Diabetes, Morbidity::Cancer];
        let subset = filter(&store, &selection);
        let rows = aggregate(&subset, &selection, true);
        let per_morbidity: u64 = rows.iter().map(|r| r.cases).sum();
        assert_eq!(per_morbidity, 3); // 1 diabetes + 2 cancer

        let all_deaths = unrestricted(1, 1);
        let subset = filter(&store, &all_deaths);
        let rows = aggregate(&subset, &all_deaths, true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cases, 2);
        assert!(rows[0].cases <= per_morbidity);
    }

    #[test]
    fn daily_window_is_identity() {
        let rows: Vec<ValueRow> = (1..=5)
            .map(|day| ValueRow {
                date: Some(d(day)),
                key: DemographicKey {
                    age_group: AgeGroup::All,
                    sex: Sex::All,
                    race: Race::All,
                    morbidity: Morbidity::AllDeaths,
                },
                value: day as f64 * 3.0,
            })
            .collect();
        assert_eq!(smooth(rows.clone(), TrendWindow::Daily), rows);
    }

    #[test]
    fn partial_window_uses_available_history() {
        let key = DemographicKey {
            age_group: AgeGroup::All,
            sex: Sex::All,
            race: Race::All,
            morbidity: Morbidity::AllDeaths,
        };
        let rows: Vec<ValueRow> = [2.0, 4.0, 6.0, 8.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| ValueRow {
                date: Some(d(i as u32 + 1)),
                key,
                value: v,
            })
            .collect();
        let smoothed = smooth(rows, TrendWindow::SevenDay);
        // defined from the first date, averaging whatever history exists
        assert_eq!(smoothed[0].value, 2.0);
        assert_eq!(smoothed[1].value, 3.0);
        assert_eq!(smoothed[2].value, 4.0); // mean of days 1-3
        assert_eq!(smoothed[4].value, 6.0); // mean of days 1-5
    }

    #[test]
    fn full_window_slides_off_old_observations() {
        let key = DemographicKey {
            age_group: AgeGroup::All,
            sex: Sex::All,
            race: Race::All,
            morbidity: Morbidity::AllDeaths,
        };
        let rows: Vec<ValueRow> = (0..10)
            .map(|i| ValueRow {
                date: Some(d(i + 1)),
                key,
                value: i as f64,
            })
            .collect();
        let smoothed = smooth(rows, TrendWindow::SevenDay);
        // day 10 window covers observations 3..=9
        assert_eq!(smoothed[9].value, 6.0);
    }

    #[test]
    fn smoothing_never_mixes_demographic_tuples() {
        let male = DemographicKey {
            age_group: AgeGroup::All,
            sex: Sex::Male,
            race: Race::All,
            morbidity: Morbidity::AllDeaths,
        };
        let female = DemographicKey {
            sex: Sex::Female,
            ..male
        };
        // interleaved by date, as aggregate emits them
        let rows = vec![
            ValueRow { date: Some(d(1)), key: male, value: 10.0 },
            ValueRow { date: Some(d(1)), key: female, value: 100.0 },
            ValueRow { date: Some(d(2)), key: male, value: 20.0 },
            ValueRow { date: Some(d(2)), key: female, value: 200.0 },
        ];
        let smoothed = smooth(rows, TrendWindow::SevenDay);
        assert_eq!(smoothed[2].value, 15.0);
        assert_eq!(smoothed[3].value, 150.0);
    }

    #[test]
    fn per_capita_omits_cells_without_denominator() {
        let mut with_pop = mk_record("c1", 1, Morbidity::Cancer);
        with_pop.population = Some(50_000);
        let mut no_pop = mk_record("c2", 1, Morbidity::Cancer);
        no_pop.sex = Sex::Female;
        no_pop.population = None;
        let mut zero_pop = mk_record("c3", 1, Morbidity::Cancer);
        zero_pop.sex = Sex::Unknown;
        zero_pop.population = Some(0);
        let store = RecordStore::new(vec![with_pop, no_pop, zero_pop]);

        let mut selection = unrestricted(1, 1);
        selection.sexes = vec![Sex::Male, Sex::Female, Sex::Unknown];
        selection.morbidities = vec![Morbidity::Cancer];
        let request = TrendRequest {
            selection,
            window: TrendWindow::Daily,
            per_capita: true,
            time_axis: true,
        };
        let series = trends(&store, &request);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label, "Male Pop. with Cancer");
        assert_eq!(series[0].values, vec![1.0 / 50_000.0 * 100_000.0]);
    }

    #[test]
    fn per_capita_undefined_when_collapsed_cells_disagree() {
        let mut male = mk_record("c1", 1, Morbidity::Cancer);
        male.population = Some(40_000);
        let mut female = mk_record("c2", 1, Morbidity::Cancer);
        female.sex = Sex::Female;
        female.population = Some(60_000);
        let store = RecordStore::new(vec![male, female]);

        // sex collapsed to All merges two cells with different denominators
        let mut selection = unrestricted(1, 1);
        selection.morbidities = vec![Morbidity::Cancer];
        let request = TrendRequest {
            selection,
            window: TrendWindow::Daily,
            per_capita: true,
            time_axis: true,
        };
        assert!(trends(&store, &request).is_empty());
    }

    #[test]
    fn label_precedence_table() {
        let key = |age_group, sex, race, morbidity| DemographicKey {
            age_group,
            sex,
            race,
            morbidity,
        };
        let all = key(AgeGroup::All, Sex::All, Race::All, Morbidity::AllDeaths);
        assert_eq!(label(&all), "Total Pop.");
        assert_eq!(
            label(&key(AgeGroup::All, Sex::All, Race::Black, Morbidity::AllDeaths)),
            "Black Pop."
        );
        assert_eq!(
            label(&key(AgeGroup::From30To39, Sex::All, Race::All, Morbidity::AllDeaths)),
            "30-39 Yrs Pop."
        );
        assert_eq!(
            label(&key(AgeGroup::All, Sex::All, Race::All, Morbidity::Diabetes)),
            "Pop. with Diabetes"
        );
        assert_eq!(
            label(&key(AgeGroup::All, Sex::Female, Race::All, Morbidity::AllDeaths)),
            "Female Pop."
        );
        assert_eq!(
            label(&key(AgeGroup::All, Sex::Female, Race::Asian, Morbidity::AllDeaths)),
            "Female, Asian Pop."
        );
        assert_eq!(
            label(&key(
                AgeGroup::From70To79,
                Sex::Female,
                Race::Asian,
                Morbidity::AllDeaths
            )),
            "Ages: 70-79 Yrs for Female, Asian Pop."
        );
        assert_eq!(
            label(&key(
                AgeGroup::From30To39,
                Sex::Male,
                Race::Black,
                Morbidity::Diabetes
            )),
            "Ages: 30-39 Yrs for Male, Black Pop. with Diabetes"
        );
    }

    #[test]
    fn series_follow_selection_order_not_data_order() {
        let store = RecordStore::new(vec![
            mk_record("c1", 1, Morbidity::Cancer),
            mk_record("c2", 1, Morbidity::Diabetes),
        ]);
        let mut selection = unrestricted(1, 1);
        selection.morbidities = vec![Morbidity::Diabetes, Morbidity::Cancer];
        let series = trends(&store, &daily_request(selection));
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].label, "Pop. with Diabetes");
        assert_eq!(series[1].label, "Pop. with Cancer");
    }

    #[test]
    fn empty_combinations_are_omitted() {
        let store = RecordStore::new(vec![mk_record("c1", 1, Morbidity::Cancer)]);
        let mut selection = unrestricted(1, 1);
        selection.morbidities = vec![Morbidity::Cancer, Morbidity::Renal];
        let series = trends(&store, &daily_request(selection));
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label, "Pop. with Cancer");
    }

    #[test]
    fn inverted_range_and_empty_axes_yield_no_series() {
        let store = RecordStore::new(vec![mk_record("c1", 1, Morbidity::Cancer)]);
        let mut inverted = unrestricted(5, 1);
        let series = trends(&store, &daily_request(inverted.clone()));
        assert!(series.is_empty());

        inverted.dates = DateRange::new(d(1), d(5));
        inverted.morbidities = Vec::new(); // no morbidity picked selects nothing
        assert!(trends(&store, &daily_request(inverted)).is_empty());
    }

    #[test]
    fn undated_rows_never_reach_the_time_axis() {
        let mut undated = mk_record("c9", 1, Morbidity::Cancer);
        undated.date_of_death = None;
        let store = RecordStore::new(vec![mk_record("c1", 1, Morbidity::Cancer), undated]);
        let mut selection = unrestricted(1, 5);
        selection.morbidities = vec![Morbidity::Cancer];
        let series = trends(&store, &daily_request(selection));
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].values, vec![1.0]);
    }

    #[test]
    fn pipeline_is_deterministic() {
        let store = RecordStore::new(vec![
            mk_record("c1", 1, Morbidity::Cancer),
            mk_record("c2", 2, Morbidity::Diabetes),
            mk_record("c3", 2, Morbidity::Cancer),
            mk_record("c4", 3, Morbidity::Renal),
        ]);
        let mut selection = unrestricted(1, 3);
        selection.morbidities =
            vec![Morbidity::Cancer, Morbidity::Diabetes, Morbidity::Renal];
        let request = TrendRequest {
            selection,
            window: TrendWindow::SevenDay,
            per_capita: false,
            time_axis: true,
        };
        assert_eq!(trends(&store, &request), trends(&store, &request));
    }

    #[test]
    fn end_to_end_total_population_daily_counts() {
        // 10 cases over 3 dates, 2 age groups, 2 sexes, 1 race
        let mut records = Vec::new();
        for (i, day) in [(0, 1), (1, 1), (2, 1), (3, 2), (4, 2), (5, 2), (6, 2), (7, 3), (8, 3), (9, 3)]
        {
            let mut r = mk_record(&format!("c{i}"), day, Morbidity::Cancer);
            if i % 2 == 0 {
                r.sex = Sex::Female;
                r.age_group = AgeGroup::From70To79;
            }
            records.push(r);
        }
        // co-morbidity fan-out must not inflate the totals
        records.push(mk_record("c0", 1, Morbidity::Diabetes));
        let store = RecordStore::new(records);

        let series = trends(&store, &daily_request(unrestricted(1, 3)));
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label, "Total Pop.");
        assert_eq!(series[0].dates, Some(vec![d(1), d(2), d(3)]));
        assert_eq!(series[0].values, vec![3.0, 4.0, 3.0]);
    }

    #[test]
    fn tabular_mode_emits_single_totals_without_dates() {
        let store = RecordStore::new(vec![
            mk_record("c1", 1, Morbidity::Cancer),
            mk_record("c2", 2, Morbidity::Cancer),
            mk_record("c3", 3, Morbidity::Cancer),
        ]);
        let mut selection = unrestricted(1, 3);
        selection.morbidities = vec![Morbidity::Cancer];
        let request = TrendRequest {
            selection,
            window: TrendWindow::SevenDay,
            per_capita: false,
            time_axis: false,
        };
        let series = trends(&store, &request);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].dates, None);
        assert_eq!(series[0].values, vec![3.0]);
    }
}
