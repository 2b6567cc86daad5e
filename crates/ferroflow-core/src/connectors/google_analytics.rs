//! Google Analytics Data API (GA4) aggregated reports.
//!
//! Every table is a `runReport` query. Tables come from the embedded report
//! catalog, or from any table name whose options carry `dimensions` and
//! `metrics`. Reports with a `date` dimension are `cdc` on `date`; the rest
//! are snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use time::Duration;
use tokio::sync::OnceCell;

use crate::config::HttpSettings;
use crate::connector::{Connector, ReadBatch, Record};
use crate::connectors::google_credentials;
use crate::error::{ConfigError, ConnectorError};
use crate::http_client::HttpClient;
use crate::offset::{CursorProtocol, CursorTracker, Offset, ResumeState};
use crate::options::{OptionMap, TableOptions};
use crate::pagination::paginate_index;
use crate::table::{Column, ColumnType, IngestionMode, TableDescriptor, TableMetadata};
use crate::transport::{ApiClient, Requirement};

pub const DEFAULT_BASE_URL: &str = "https://analyticsdata.googleapis.com/v1beta";
pub const LAST_DATE_KEY: &str = "last_date";

const CATALOG_JSON: &str = include_str!("google_analytics_reports.json");

const DATE_DIMENSION: &str = "date";
const DATE_DIMENSIONS: [&str; 2] = ["date", "firstSessionDate"];
const DEFAULT_LOOKBACK_DAYS: i64 = 3;
const DEFAULT_START_DATE: &str = "30daysAgo";
const DEFAULT_PAGE_SIZE: u64 = 10_000;
const MAX_PAGE_SIZE: u64 = 100_000;
const MAX_DIMENSIONS: usize = 9;
const MAX_METRICS: usize = 10;

/// One entry of the embedded report catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct ReportSpec {
    dimensions: Vec<String>,
    metrics: Vec<String>,
    #[serde(default)]
    primary_keys: Option<Vec<String>>,
    #[serde(default)]
    lookback_days: Option<i64>,
}

/// A report resolved from the catalog and the table options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Report {
    name: String,
    dimensions: Vec<String>,
    metrics: Vec<String>,
    primary_keys: Vec<String>,
    lookback_days: i64,
}

impl Report {
    fn mode(&self) -> IngestionMode {
        if self.has_date() {
            IngestionMode::Cdc
        } else {
            IngestionMode::Snapshot
        }
    }

    fn has_date(&self) -> bool {
        self.dimensions.iter().any(|dimension| dimension == DATE_DIMENSION)
    }

    fn protocol(&self) -> CursorProtocol {
        CursorProtocol::new(LAST_DATE_KEY, Duration::days(self.lookback_days))
    }

    /// Metrics are typed from `metric_types`; unknown ones fall back to strings.
    fn descriptor(&self, metric_types: &HashMap<String, String>) -> Result<TableDescriptor, ConnectorError> {
        let mut columns = vec![Column::required("property_id", ColumnType::String)];
        for dimension in &self.dimensions {
            let column_type = if DATE_DIMENSIONS.contains(&dimension.as_str()) {
                ColumnType::Date
            } else {
                ColumnType::String
            };
            columns.push(Column::new(dimension.as_str(), column_type));
        }
        for metric in &self.metrics {
            let column_type = metric_types
                .get(metric)
                .map_or(ColumnType::String, |kind| metric_column_type(kind));
            columns.push(Column::new(metric.as_str(), column_type));
        }

        let keys = self.primary_keys.iter().map(String::as_str).collect::<Vec<_>>();
        for column in columns.iter_mut().filter(|column| keys.contains(&column.name.as_str())) {
            column.nullable = false;
        }
        let cursor = self.has_date().then_some(DATE_DIMENSION);
        Ok(TableDescriptor::new(self.name.as_str(), columns, &keys, self.mode(), cursor)?)
    }

    fn validate(&self, metadata: &PropertyMetadata) -> Result<(), ConfigError> {
        if self.dimensions.len() > MAX_DIMENSIONS {
            return Err(ConfigError::invalid_option(
                "dimensions",
                self.dimensions.join(","),
                format!("at most {MAX_DIMENSIONS} dimensions per report"),
            ));
        }
        if self.metrics.len() > MAX_METRICS {
            return Err(ConfigError::invalid_option(
                "metrics",
                self.metrics.join(","),
                format!("at most {MAX_METRICS} metrics per report"),
            ));
        }
        let unknown_dimensions = unknown(&self.dimensions, &metadata.dimensions);
        if !unknown_dimensions.is_empty() {
            return Err(ConfigError::invalid_option(
                "dimensions",
                unknown_dimensions.join(","),
                "not available for this property",
            ));
        }
        let unknown_metrics = unknown(&self.metrics, &metadata.metrics);
        if !unknown_metrics.is_empty() {
            return Err(ConfigError::invalid_option(
                "metrics",
                unknown_metrics.join(","),
                "not available for this property",
            ));
        }
        Ok(())
    }
}

fn unknown(requested: &[String], available: &BTreeSet<String>) -> Vec<String> {
    requested
        .iter()
        .filter(|name| !available.contains(*name))
        .cloned()
        .collect()
}

fn metric_column_type(kind: &str) -> ColumnType {
    match kind {
        "TYPE_INTEGER" | "TYPE_MILLISECONDS" => ColumnType::Long,
        "TYPE_FLOAT" | "TYPE_CURRENCY" | "TYPE_SECONDS" | "TYPE_MINUTES" | "TYPE_HOURS"
        | "TYPE_FEET" | "TYPE_MILES" | "TYPE_METERS" | "TYPE_KILOMETERS" | "TYPE_STANDARD" => {
            ColumnType::Double
        }
        _ => ColumnType::String,
    }
}

/// Dimensions and metrics a property exposes, fetched once per connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PropertyMetadata {
    dimensions: BTreeSet<String>,
    metrics: BTreeSet<String>,
    metric_types: HashMap<String, String>,
}

impl PropertyMetadata {
    fn from_response(body: &Value) -> Self {
        let api_names = |key: &str| {
            body.get(key)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|entry| Some((entry.get("apiName")?.as_str()?, entry.get("type").and_then(Value::as_str))))
                .map(|(name, kind)| (name.to_owned(), kind.map(str::to_owned)))
                .collect::<Vec<_>>()
        };
        let dimensions = api_names("dimensions").into_iter().map(|(name, _)| name).collect();
        let metrics = api_names("metrics");
        Self {
            dimensions,
            metric_types: metrics
                .iter()
                .filter_map(|(name, kind)| Some((name.clone(), kind.clone()?)))
                .collect(),
            metrics: metrics.into_iter().map(|(name, _)| name).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleAnalyticsConfig {
    pub property_ids: Vec<String>,
    pub base_url: String,
    pub http: HttpSettings,
}

impl GoogleAnalyticsConfig {
    pub fn from_options(raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::connection(raw);
        let property_ids = options.list("property_ids")?;
        if property_ids.is_empty() {
            return Err(ConfigError::MissingConnectionOption {
                option: String::from("property_ids"),
            });
        }
        Ok(Self {
            property_ids,
            base_url: options.get("base_url").unwrap_or(DEFAULT_BASE_URL).to_owned(),
            http: HttpSettings::from_options(raw)?,
        })
    }
}

/// Per-read options layered over the report definition.
#[derive(Debug, Clone, PartialEq)]
struct ReadOptions {
    start_date: String,
    page_size: u64,
    dimension_filter: Option<Value>,
    metric_filter: Option<Value>,
}

impl ReadOptions {
    fn parse(table: &str, raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::new(table, raw);
        Ok(Self {
            start_date: options.get("start_date").unwrap_or(DEFAULT_START_DATE).to_owned(),
            page_size: options
                .parse_or("page_size", DEFAULT_PAGE_SIZE)?
                .clamp(1, MAX_PAGE_SIZE),
            dimension_filter: options.json("dimension_filter")?,
            metric_filter: options.json("metric_filter")?,
        })
    }
}

/// `runReport` body for `report` starting at `start_date`.
fn report_request(report: &Report, options: &ReadOptions, start_date: &str) -> Value {
    let mut body = json!({
        "dateRanges": [{ "startDate": start_date, "endDate": "today" }],
        "dimensions": report.dimensions.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>(),
        "metrics": report.metrics.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>(),
        "limit": options.page_size,
        "offset": 0,
    });
    if report.has_date() {
        body["orderBys"] = json!([{ "dimension": { "dimensionName": DATE_DIMENSION }, "desc": false }]);
    }
    if let Some(filter) = &options.dimension_filter {
        body["dimensionFilter"] = filter.clone();
    }
    if let Some(filter) = &options.metric_filter {
        body["metricFilter"] = filter.clone();
    }
    body
}

/// `YYYYMMDD` to `YYYY-MM-DD`.
fn report_date(raw: &str) -> Option<String> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}-{}-{}", &raw[0..4], &raw[4..6], &raw[6..8]))
}

fn metric_value(raw: &str, kind: &str) -> Value {
    match metric_column_type(kind) {
        ColumnType::Long => raw.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        ColumnType::Double => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        _ => Value::from(raw),
    }
}

fn header_names(response: &Value, key: &str) -> Vec<(String, String)> {
    response
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|header| {
            (
                header.get("name").and_then(Value::as_str).unwrap_or_default().to_owned(),
                header
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("TYPE_STRING")
                    .to_owned(),
            )
        })
        .collect()
}

fn cell<'a>(row: &'a Value, key: &str, index: usize) -> Option<&'a str> {
    row.get(key)?.as_array()?.get(index)?.get("value")?.as_str()
}

/// Rows of one `runReport` response as flat records.
fn report_rows(property_id: &str, response: &Value) -> Vec<Record> {
    let dimensions = header_names(response, "dimensionHeaders");
    let metrics = header_names(response, "metricHeaders");

    response
        .get("rows")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|row| {
            let mut record = Map::new();
            record.insert(String::from("property_id"), Value::from(property_id));
            for (index, (name, _)) in dimensions.iter().enumerate() {
                let raw = cell(row, "dimensionValues", index);
                let value = match raw {
                    Some(raw) if DATE_DIMENSIONS.contains(&name.as_str()) => {
                        report_date(raw).map_or_else(|| Value::from(raw), Value::from)
                    }
                    Some(raw) => Value::from(raw),
                    None => Value::Null,
                };
                record.insert(name.clone(), value);
            }
            for (index, (name, kind)) in metrics.iter().enumerate() {
                let value = match cell(row, "metricValues", index) {
                    None | Some("") => Value::Null,
                    Some(raw) => metric_value(raw, kind),
                };
                record.insert(name.clone(), value);
            }
            record
        })
        .collect()
}

pub struct GoogleAnalyticsConnector {
    api: ApiClient,
    property_ids: Vec<String>,
    catalog: OnceLock<BTreeMap<String, ReportSpec>>,
    metadata: OnceCell<PropertyMetadata>,
}

impl GoogleAnalyticsConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, options: &OptionMap) -> Result<Self, ConnectorError> {
        let config = GoogleAnalyticsConfig::from_options(options)?;
        let credentials = google_credentials(options, http_client.clone())?;
        let api = ApiClient::new(http_client, Arc::new(credentials), &config.base_url)
            .with_settings(&config.http);
        Ok(Self {
            api,
            property_ids: config.property_ids,
            catalog: OnceLock::new(),
            metadata: OnceCell::new(),
        })
    }

    fn reports(&self) -> &BTreeMap<String, ReportSpec> {
        self.catalog.get_or_init(|| {
            serde_json::from_str(CATALOG_JSON).unwrap_or_else(|error| {
                tracing::error!(%error, "embedded report catalog is invalid");
                BTreeMap::new()
            })
        })
    }

    /// Catalog report for `table`, unless the options define a custom one.
    fn resolve_report(&self, table: &str, raw: &OptionMap) -> Result<Report, ConfigError> {
        let options = TableOptions::new(table, raw);
        let custom = options.get("dimensions").is_some() || options.get("metrics").is_some();

        let (dimensions, metrics, catalog_keys, catalog_lookback) = match self.reports().get(table) {
            Some(report) if !custom => (
                report.dimensions.clone(),
                report.metrics.clone(),
                report.primary_keys.clone(),
                report.lookback_days,
            ),
            found => {
                if found.is_some() {
                    tracing::warn!(table, "custom dimensions/metrics shadow a catalog report");
                }
                if !custom {
                    let names = self.reports().keys().map(String::as_str).collect::<Vec<_>>();
                    return Err(ConfigError::unknown_table(table, &names));
                }
                (options.list("dimensions")?, options.list("metrics")?, None, None)
            }
        };
        if metrics.is_empty() {
            return Err(ConfigError::missing_options(table, &["metrics"]));
        }

        let mut primary_keys = options.list("primary_keys")?;
        if primary_keys.is_empty() {
            primary_keys = std::iter::once(String::from("property_id"))
                .chain(catalog_keys.unwrap_or_else(|| dimensions.clone()))
                .collect();
        }
        let lookback_days = options.parse_or("lookback_days", catalog_lookback.unwrap_or(DEFAULT_LOOKBACK_DAYS))?;
        if lookback_days < 0 {
            return Err(ConfigError::invalid_option(
                "lookback_days",
                lookback_days.to_string(),
                "must not be negative",
            ));
        }

        Ok(Report {
            name: table.to_owned(),
            dimensions,
            metrics,
            primary_keys,
            lookback_days,
        })
    }

    async fn metadata(&self) -> Result<&PropertyMetadata, ConnectorError> {
        self.metadata
            .get_or_try_init(|| async {
                let property = self.property_ids.first().map(String::as_str).unwrap_or_default();
                let body = self
                    .api
                    .get_json(&format!("/properties/{property}/metadata"), &[], Requirement::Required)
                    .await?
                    .unwrap_or(Value::Null);
                let metadata = PropertyMetadata::from_response(&body);
                tracing::debug!(
                    property,
                    dimensions = metadata.dimensions.len(),
                    metrics = metadata.metrics.len(),
                    "loaded property metadata"
                );
                Ok::<_, ConnectorError>(metadata)
            })
            .await
    }

    async fn run_report(
        &self,
        property_id: &str,
        request: &Value,
        page_size: u64,
    ) -> Result<Vec<Record>, ConnectorError> {
        let path = format!("/properties/{property_id}:runReport");
        let rows = paginate_index(0, page_size, u64::MAX, |offset| {
            let mut body = request.clone();
            body["offset"] = Value::from(offset);
            let path = path.as_str();
            async move {
                let response = self
                    .api
                    .post_json(path, &body, Requirement::Required)
                    .await?
                    .unwrap_or(Value::Null);
                Ok(report_rows(property_id, &response)
                    .into_iter()
                    .map(Value::Object)
                    .collect())
            }
        })
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .collect())
    }

    async fn read_report(
        &self,
        report: &Report,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let mode = report.mode();
        let start_date = match ResumeState::from_offset(offset, LAST_DATE_KEY).cursor() {
            Some(last_date) if mode == IngestionMode::Cdc => last_date.to_owned(),
            _ => options.start_date.clone(),
        };
        let request = report_request(report, options, &start_date);

        let mut tracker = CursorTracker::new();
        let mut records = Vec::new();
        for property_id in &self.property_ids {
            let rows = self.run_report(property_id, &request, options.page_size).await?;
            for row in &rows {
                tracker.observe_record(row, DATE_DIMENSION);
            }
            records.extend(rows);
        }

        let next = report.protocol().next_offset(mode, offset, &tracker);
        Ok(ReadBatch::new(records, next))
    }
}

#[async_trait]
impl Connector for GoogleAnalyticsConnector {
    fn name(&self) -> &'static str {
        "google_analytics"
    }

    fn list_tables(&self) -> Vec<String> {
        self.reports().keys().cloned().collect()
    }

    async fn get_table_schema(
        &self,
        table: &str,
        options: &OptionMap,
    ) -> Result<Vec<Column>, ConnectorError> {
        let report = self.resolve_report(table, options)?;
        let metadata = self.metadata().await.map_err(|error| error.in_table(table))?;
        report.validate(metadata)?;
        Ok(report.descriptor(&metadata.metric_types)?.columns)
    }

    async fn read_table_metadata(
        &self,
        table: &str,
        options: &OptionMap,
    ) -> Result<TableMetadata, ConnectorError> {
        let report = self.resolve_report(table, options)?;
        Ok(report.descriptor(&HashMap::new())?.metadata())
    }

    async fn read_table(
        &self,
        table: &str,
        offset: Option<&Offset>,
        options: &OptionMap,
    ) -> Result<ReadBatch, ConnectorError> {
        let report = self.resolve_report(table, options)?;
        let read_options = ReadOptions::parse(table, options)?;

        let batch = self
            .read_report(&report, offset, &read_options)
            .await
            .map_err(|error| error.in_table(table))?;

        tracing::info!(connector = "google_analytics", table, records = batch.len(), offset = %batch.offset, "read completed");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> GoogleAnalyticsConnector {
        let options: OptionMap = [
            ("property_ids", "123,456"),
            ("client_id", "id"),
            ("client_secret", "secret"),
            ("refresh_token", "refresh"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        let http: Arc<dyn HttpClient> = Arc::new(crate::http_client::ReqwestHttpClient::new());
        GoogleAnalyticsConnector::new(http, &options).expect("valid connector")
    }

    #[test]
    fn embedded_catalog_parses_and_respects_api_limits() {
        let reports: BTreeMap<String, ReportSpec> =
            serde_json::from_str(CATALOG_JSON).expect("valid catalog");

        assert!(reports.contains_key("traffic_by_country"));
        for (name, report) in &reports {
            assert!(!report.metrics.is_empty(), "{name} has no metrics");
            assert!(report.dimensions.len() <= MAX_DIMENSIONS, "{name}");
            assert!(report.metrics.len() <= MAX_METRICS, "{name}");
        }
    }

    #[test]
    fn date_dimension_selects_cdc_on_date() {
        let connector = connector();
        let dated = connector
            .resolve_report("traffic_by_country", &OptionMap::new())
            .expect("catalog report");
        let undated = connector
            .resolve_report("all_time_by_country", &OptionMap::new())
            .expect("catalog report");

        assert_eq!(dated.mode(), IngestionMode::Cdc);
        assert_eq!(dated.primary_keys, vec!["property_id", "date", "country"]);
        assert_eq!(undated.mode(), IngestionMode::Snapshot);
    }

    #[test]
    fn custom_reports_need_metrics_and_unknown_names_fail() {
        let connector = connector();
        let only_dimensions: OptionMap = [("dimensions".to_owned(), "[\"date\"]".to_owned())]
            .into_iter()
            .collect();

        assert!(matches!(
            connector.resolve_report("my_report", &only_dimensions),
            Err(ConfigError::MissingOptions { .. })
        ));
        assert!(matches!(
            connector.resolve_report("nope", &OptionMap::new()),
            Err(ConfigError::UnknownTable { .. })
        ));
    }

    #[test]
    fn rows_convert_dates_and_type_metrics() {
        let response = json!({
            "dimensionHeaders": [{ "name": "date" }, { "name": "country" }],
            "metricHeaders": [
                { "name": "sessions", "type": "TYPE_INTEGER" },
                { "name": "engagementRate", "type": "TYPE_FLOAT" }
            ],
            "rows": [{
                "dimensionValues": [{ "value": "20240105" }, { "value": "France" }],
                "metricValues": [{ "value": "12" }, { "value": "0.5" }]
            }]
        });

        let rows = report_rows("123", &response);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["date"], "2024-01-05");
        assert_eq!(rows[0]["sessions"], json!(12));
        assert_eq!(rows[0]["engagementRate"], json!(0.5));
        assert_eq!(rows[0]["property_id"], "123");
    }

    #[test]
    fn invalid_filter_json_is_a_config_error() {
        let options: OptionMap = [("dimension_filter".to_owned(), "{not json".to_owned())]
            .into_iter()
            .collect();

        assert!(matches!(
            ReadOptions::parse("traffic_by_country", &options),
            Err(ConfigError::InvalidJson { .. })
        ));
    }
}
