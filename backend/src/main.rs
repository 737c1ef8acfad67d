use std::env;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use mortality_core::{
    AgeGroup, DateRange, FilterSelection, Race, RecordStore, Sex, TrendWindow, AGE_BUCKETS,
};
use serde::Serialize;
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trend_engine::{trends, Series, TrendRequest};

// Deployment knobs, all optional.
const BIND_ADDR_ENV: &str = "TRENDS_BIND_ADDR";
const DATA_PATH_ENV: &str = "TRENDS_DATA_PATH";
const SITE_ROOT_ENV: &str = "TRENDS_SITE_ROOT";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DATA_PATH: &str = "assets/pds.csv";
const DEFAULT_SITE_ROOT: &str = "site";

#[derive(Clone)]
struct AppState {
    // Read-only once loaded; concurrent requests share it without locking.
    store: Arc<RecordStore>,
}

#[derive(Debug, serde::Deserialize)]
struct TrendParams {
    window: Option<String>,
    start: Option<String>,
    end: Option<String>,
    ages: Option<String>,
    sexes: Option<String>,
    races: Option<String>,
    morbidities: Option<String>,
    per_capita: Option<bool>,
    chart: Option<String>,
}

/// Split a comma-separated multi-select parameter into typed values.
/// An absent parameter falls back to `missing`; a present-but-empty one is
/// an explicit empty selection.
fn parse_multi<D: FromStr + Copy>(raw: Option<&str>, missing: &[D]) -> Result<Vec<D>, String>
where
    D::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(missing.to_vec());
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|part| part.parse::<D>().map_err(|e| format!("'{part}': {e}")))
        .collect()
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("'{raw}' is not a YYYY-MM-DD date"))
}

/// Turn raw query parameters into a pipeline request. Missing dates widen to
/// the store's own bounds; a missing morbidity parameter selects nothing,
/// matching the dashboard's explicit multi-select.
fn build_request(store: &RecordStore, params: &TrendParams) -> Result<TrendRequest, String> {
    let window = match params.window.as_deref() {
        Some(raw) => raw
            .parse::<TrendWindow>()
            .map_err(|e| format!("'{raw}': {e}"))?,
        None => TrendWindow::SevenDay,
    };

    let bounds = store.date_bounds();
    let start = match params.start.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => bounds.map(|(lo, _)| lo).unwrap_or(NaiveDate::MAX),
    };
    let end = match params.end.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => bounds.map(|(_, hi)| hi).unwrap_or(NaiveDate::MIN),
    };

    let selection = FilterSelection {
        dates: DateRange::new(start, end),
        age_groups: parse_multi(params.ages.as_deref(), &[AgeGroup::All])?,
        sexes: parse_multi(params.sexes.as_deref(), &[Sex::All])?,
        races: parse_multi(params.races.as_deref(), &[Race::All])?,
        morbidities: parse_multi(params.morbidities.as_deref(), &[])?,
    };

    let time_axis = match params.chart.as_deref() {
        None | Some("trend") => true,
        Some("table") => false,
        Some(other) => return Err(format!("'{other}' is not a chart kind (trend|table)")),
    };

    Ok(TrendRequest {
        selection,
        window,
        per_capita: params.per_capita.unwrap_or(false),
        time_axis,
    })
}

async fn trends_handler(
    State(state): State<AppState>,
    Query(params): Query<TrendParams>,
) -> Result<Json<Vec<Series>>, (StatusCode, String)> {
    let request = build_request(&state.store, &params).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    Ok(Json(trends(&state.store, &request)))
}

#[derive(Debug, Serialize)]
struct LabeledOption {
    label: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct MorbidityOption {
    label: String,
    value: String,
    cases: usize,
}

#[derive(Debug, Serialize)]
struct OptionsResponse {
    windows: Vec<LabeledOption>,
    age_groups: Vec<LabeledOption>,
    sexes: Vec<LabeledOption>,
    races: Vec<LabeledOption>,
    /// Concrete morbidities, most frequent first, the way the dashboard
    /// orders its multi-select.
    morbidities: Vec<MorbidityOption>,
    date_start: Option<NaiveDate>,
    date_end: Option<NaiveDate>,
}

fn labeled<T: ToString>(value: T) -> LabeledOption {
    let label = value.to_string();
    LabeledOption {
        value: label.clone(),
        label,
    }
}

async fn options_handler(State(state): State<AppState>) -> Json<OptionsResponse> {
    let bounds = state.store.date_bounds();
    let morbidities = state
        .store
        .morbidity_counts()
        .into_iter()
        .map(|(m, cases)| MorbidityOption {
            label: m.to_string(),
            value: m.to_string(),
            cases,
        })
        .collect();
    Json(OptionsResponse {
        windows: [
            TrendWindow::Daily,
            TrendWindow::SevenDay,
            TrendWindow::ThirtyDay,
        ]
        .into_iter()
        .map(labeled)
        .collect(),
        age_groups: AGE_BUCKETS.into_iter().map(labeled).collect(),
        sexes: [Sex::Female, Sex::Male, Sex::Unknown]
            .into_iter()
            .map(labeled)
            .collect(),
        races: [
            Race::White,
            Race::Black,
            Race::Asian,
            Race::AmericanIndian,
            Race::Other,
            Race::Unknown,
        ]
        .into_iter()
        .map(labeled)
        .collect(),
        morbidities,
        date_start: bounds.map(|(lo, _)| lo),
        date_end: bounds.map(|(_, hi)| hi),
    })
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn build_router(state: AppState, site_root: &str) -> Router {
    Router::new()
        .route("/api/trends", get(trends_handler))
        .route("/api/options", get(options_handler))
        .route("/healthz", get(healthz))
        .fallback_service(ServeDir::new(site_root))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_path = env::var(DATA_PATH_ENV).unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string());
    let store = record_feed::load_csv(&data_path)
        .unwrap_or_else(|e| panic!("load {data_path}: {e}"));
    info!(rows = store.len(), path = %data_path, "record store ready");

    let state = AppState {
        store: Arc::new(store),
    };
    let site_root = env::var(SITE_ROOT_ENV).unwrap_or_else(|_| DEFAULT_SITE_ROOT.to_string());
    let app = build_router(state, &site_root);

    let bind_addr = env::var(BIND_ADDR_ENV).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("bind {bind_addr}: {e}"));
    info!(addr = %bind_addr, "dashboard backend listening");
    axum::serve(listener, app).await.expect("server failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mortality_core::{Morbidity, Record};

    fn mk_store() -> RecordStore {
        RecordStore::new(vec![Record {
            case_id: "c1".to_string(),
            date_of_death: NaiveDate::from_ymd_opt(2020, 4, 1),
            age: Some(67),
            age_group: AgeGroup::From60To69,
            sex: Sex::Male,
            race: Race::White,
            morbidity: Morbidity::Cancer,
            population: Some(1000),
        }])
    }

    fn empty_params() -> TrendParams {
        TrendParams {
            window: None,
            start: None,
            end: None,
            ages: None,
            sexes: None,
            races: None,
            morbidities: None,
            per_capita: None,
            chart: None,
        }
    }

    #[test]
    fn defaults_widen_to_store_bounds_and_select_no_morbidity() {
        let request = build_request(&mk_store(), &empty_params()).unwrap();
        assert_eq!(request.window, TrendWindow::SevenDay);
        assert_eq!(
            request.selection.dates,
            DateRange::new(
                NaiveDate::from_ymd_opt(2020, 4, 1).unwrap(),
                NaiveDate::from_ymd_opt(2020, 4, 1).unwrap()
            )
        );
        assert_eq!(request.selection.age_groups, vec![AgeGroup::All]);
        assert!(request.selection.morbidities.is_empty());
        assert!(request.time_axis);
        assert!(!request.per_capita);
    }

    #[test]
    fn multi_select_parameters_parse_in_order() {
        let mut params = empty_params();
        params.window = Some("30".to_string());
        params.morbidities = Some("DIABETES,CANCER".to_string());
        params.sexes = Some("Female,Male".to_string());
        params.chart = Some("table".to_string());
        let request = build_request(&mk_store(), &params).unwrap();
        assert_eq!(request.window, TrendWindow::ThirtyDay);
        assert_eq!(
            request.selection.morbidities,
            vec![Morbidity::Diabetes, Morbidity::Cancer]
        );
        assert_eq!(request.selection.sexes, vec![Sex::Female, Sex::Male]);
        assert!(!request.time_axis);
    }

    #[test]
    fn bad_parameters_are_reported_not_defaulted() {
        let mut params = empty_params();
        params.start = Some("04/01/2020".to_string());
        assert!(build_request(&mk_store(), &params).is_err());

        let mut params = empty_params();
        params.morbidities = Some("GOUT".to_string());
        assert!(build_request(&mk_store(), &params).is_err());

        let mut params = empty_params();
        params.chart = Some("pie".to_string());
        assert!(build_request(&mk_store(), &params).is_err());
    }

    #[test]
    fn empty_store_defaults_to_an_empty_interval() {
        let store = RecordStore::new(Vec::new());
        let request = build_request(&store, &empty_params()).unwrap();
        assert!(request.selection.dates.is_empty());
    }
}
