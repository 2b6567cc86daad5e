//! OSIsoft PI Web API connector.
//!
//! Inventory tables (servers, points, attributes) and point-in-time values
//! (current, end, at-time, summaries) are snapshots that report the
//! `{"offset":"done"}` sentinel. Time-series tables and event frames are
//! `append` over a `[start, end)` window and return `{"offset": end}`; the
//! next read starts where the previous one stopped.
//!
//! Per-tag reads are packed into `POST /piwebapi/batch` calls. When the batch
//! endpoint itself fails, the requests are replayed one by one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

use crate::auth::{CredentialProvider, OAuthTokenCredential, StaticCredential, TokenGrant};
use crate::batch::{execute_batched, BatchItem, JsonBatch};
use crate::config::HttpSettings;
use crate::connector::{Connector, ReadBatch, Record};
use crate::connectors::str_field;
use crate::dispatch::{TableCatalog, TableKind};
use crate::error::{ConfigError, ConnectorError};
use crate::http_client::{append_query, HttpAuth, HttpClient};
use crate::offset::{format_timestamp, parse_instant, window_offset, Offset, SnapshotOffset, WINDOW_KEY};
use crate::options::{OptionMap, TableOptions};
use crate::pagination::{paginate_index, paginate_window, WindowAdvance, WindowPaging, WindowStream, WINDOW_EPSILON};
use crate::pool;
use crate::table::{columns, Column, ColumnType, IngestionMode, TableDescriptor, TableMetadata};
use crate::transport::{expect_items, ApiClient, Requirement};

const BATCH_PATH: &str = "/piwebapi/batch";
/// Batch fallback replays requests sequentially.
const FALLBACK_WIDTH: usize = 1;

const DEFAULT_MAX_COUNT: u32 = 1_000;
const DEFAULT_MAX_TOTAL_COUNT: u64 = 100_000;
const DEFAULT_TAGS: usize = 50;
const DEFAULT_POINTS: usize = 10;
const DEFAULT_LOOKBACK_MINUTES: i64 = 60;
const DEFAULT_INTERVAL: &str = "1m";
const DEFAULT_MAX_PAGES: u32 = 100;
const DEFAULT_INTERVALS: u32 = 300;
const DEFAULT_EVENT_LOOKBACK_DAYS: i64 = 30;
const DEFAULT_SEARCH_MODE: &str = "Overlapped";
const DEFAULT_SUMMARY_TYPE: &str = "Total";

/// Summary options forwarded verbatim when set.
const SUMMARY_PASSTHROUGH: [&str; 7] = [
    "calculationBasis",
    "timeType",
    "summaryDuration",
    "sampleType",
    "sampleInterval",
    "timeZone",
    "filterExpression",
];
/// Streamset summaries need these; per-tag summaries leave them to the server.
const STREAMSET_SUMMARY_DEFAULTS: [(&str, &str); 2] =
    [("calculationBasis", "TimeWeighted"), ("summaryDuration", "1h")];

const SNAPSHOT: SnapshotOffset = SnapshotOffset::Sentinel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsipiTable {
    Dataservers,
    Points,
    PointAttributes,
    CurrentValue,
    ValueAtTime,
    RecordedAtTime,
    End,
    StreamsetEnd,
    Summary,
    Recorded,
    StreamsetRecorded,
    Interpolated,
    StreamsetInterpolated,
    Plot,
    StreamsetPlot,
    StreamsetSummary,
    AssetServers,
    AssetDatabases,
    EventFrames,
}

impl TableKind for OsipiTable {
    const ALL: &'static [Self] = &[
        Self::Dataservers,
        Self::Points,
        Self::PointAttributes,
        Self::CurrentValue,
        Self::ValueAtTime,
        Self::RecordedAtTime,
        Self::End,
        Self::StreamsetEnd,
        Self::Summary,
        Self::Recorded,
        Self::StreamsetRecorded,
        Self::Interpolated,
        Self::StreamsetInterpolated,
        Self::Plot,
        Self::StreamsetPlot,
        Self::StreamsetSummary,
        Self::AssetServers,
        Self::AssetDatabases,
        Self::EventFrames,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Dataservers => "dataservers",
            Self::Points => "points",
            Self::PointAttributes => "point_attributes",
            Self::CurrentValue => "current_value",
            Self::ValueAtTime => "value_at_time",
            Self::RecordedAtTime => "recorded_at_time",
            Self::End => "end",
            Self::StreamsetEnd => "streamset_end",
            Self::Summary => "summary",
            Self::Recorded => "recorded",
            Self::StreamsetRecorded => "streamset_recorded",
            Self::Interpolated => "interpolated",
            Self::StreamsetInterpolated => "streamset_interpolated",
            Self::Plot => "plot",
            Self::StreamsetPlot => "streamset_plot",
            Self::StreamsetSummary => "streamset_summary",
            Self::AssetServers => "asset_servers",
            Self::AssetDatabases => "asset_databases",
            Self::EventFrames => "event_frames",
        }
    }
}

impl OsipiTable {
    /// Reads whose end is capped by `window_seconds`.
    fn windowed(self) -> bool {
        matches!(self, Self::Recorded | Self::StreamsetRecorded | Self::EventFrames)
    }
}

/// Stream endpoint family read over a time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Series {
    Recorded,
    Interpolated,
    Plot,
}

impl Series {
    fn segment(self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::Interpolated => "interpolated",
            Self::Plot => "plot",
        }
    }
}

fn describe(table: OsipiTable) -> Result<TableDescriptor, crate::table::DescriptorError> {
    use ColumnType::{Boolean, Double, Json, String as Text, Timestamp};

    let values = vec![
        ("tag_webid", Text),
        ("timestamp", Timestamp),
        ("value", Double),
        ("good", Boolean),
        ("questionable", Boolean),
        ("substituted", Boolean),
        ("annotated", Boolean),
        ("units", Text),
        ("ingestion_timestamp", Timestamp),
    ];

    let (layout, keys, mode): (Vec<(&str, ColumnType)>, Vec<&str>, IngestionMode) = match table {
        OsipiTable::Dataservers => (
            vec![("webid", Text), ("name", Text)],
            vec!["webid"],
            IngestionMode::Snapshot,
        ),
        OsipiTable::Points => (
            vec![
                ("webid", Text),
                ("name", Text),
                ("descriptor", Text),
                ("engineering_units", Text),
                ("path", Text),
                ("dataserver_webid", Text),
            ],
            vec!["webid"],
            IngestionMode::Snapshot,
        ),
        OsipiTable::PointAttributes => (
            vec![
                ("point_webid", Text),
                ("name", Text),
                ("value", Text),
                ("type", Text),
                ("ingestion_timestamp", Timestamp),
            ],
            vec!["point_webid", "name"],
            IngestionMode::Snapshot,
        ),
        OsipiTable::CurrentValue
        | OsipiTable::ValueAtTime
        | OsipiTable::End
        | OsipiTable::StreamsetEnd => (values, vec!["tag_webid"], IngestionMode::Snapshot),
        OsipiTable::RecordedAtTime => {
            let mut layout = values;
            layout.insert(1, ("query_time", Timestamp));
            (layout, vec!["tag_webid"], IngestionMode::Snapshot)
        }
        OsipiTable::Summary => {
            let mut layout = values;
            layout.insert(1, ("summary_type", Text));
            (layout, vec!["tag_webid", "summary_type"], IngestionMode::Snapshot)
        }
        OsipiTable::StreamsetSummary => {
            let mut layout = values;
            layout.insert(1, ("summary_type", Text));
            (layout, vec!["tag_webid", "summary_type", "timestamp"], IngestionMode::Append)
        }
        OsipiTable::Recorded
        | OsipiTable::StreamsetRecorded
        | OsipiTable::Interpolated
        | OsipiTable::StreamsetInterpolated
        | OsipiTable::Plot
        | OsipiTable::StreamsetPlot => (values, vec!["tag_webid", "timestamp"], IngestionMode::Append),
        OsipiTable::AssetServers => (
            vec![("webid", Text), ("name", Text), ("path", Text)],
            vec!["webid"],
            IngestionMode::Snapshot,
        ),
        OsipiTable::AssetDatabases => (
            vec![
                ("webid", Text),
                ("name", Text),
                ("path", Text),
                ("assetserver_webid", Text),
            ],
            vec!["webid"],
            IngestionMode::Snapshot,
        ),
        OsipiTable::EventFrames => (
            vec![
                ("event_frame_webid", Text),
                ("name", Text),
                ("template_name", Text),
                ("start_time", Timestamp),
                ("end_time", Timestamp),
                ("primary_referenced_element_webid", Text),
                ("description", Text),
                ("category_names", Json),
                ("attributes", Json),
                ("ingestion_timestamp", Timestamp),
            ],
            vec!["event_frame_webid"],
            IngestionMode::Append,
        ),
    };

    TableDescriptor::new(table.name(), columns(&layout, &keys), &keys, mode, None)
}

/// How requests authenticate against the PI Web API host.
#[derive(Clone, PartialEq, Eq)]
pub enum PiAuth {
    AccessToken(String),
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
    Basic {
        username: String,
        password: String,
    },
    Anonymous,
}

impl std::fmt::Debug for PiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessToken(_) => f.write_str("AccessToken(***)"),
            Self::ClientCredentials { token_url, .. } => write!(f, "ClientCredentials({token_url})"),
            Self::Basic { username, .. } => write!(f, "Basic({username}:***)"),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsipiConfig {
    pub base_url: String,
    pub auth: PiAuth,
    pub http: HttpSettings,
}

impl OsipiConfig {
    pub fn from_options(raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::connection(raw);
        let base_url = options
            .get_any(&["pi_base_url", "pi_web_api_url"])
            .ok_or_else(|| ConfigError::MissingConnectionOption {
                option: String::from("pi_base_url"),
            })?
            .trim_end_matches('/')
            .to_owned();

        let auth = if let Some(token) = options.get_any(&["access_token", "bearer_token"]) {
            PiAuth::AccessToken(token.to_owned())
        } else if let (Some(token_url), Some(client_id), Some(client_secret)) = (
            options.get("token_url"),
            options.get("client_id"),
            options.get("client_secret"),
        ) {
            PiAuth::ClientCredentials {
                token_url: token_url.to_owned(),
                client_id: client_id.to_owned(),
                client_secret: client_secret.to_owned(),
                scope: options.get("scope").map(str::to_owned),
            }
        } else if let (Some(username), Some(password)) = (options.get("username"), options.get("password")) {
            PiAuth::Basic {
                username: username.to_owned(),
                password: password.to_owned(),
            }
        } else if options.flag("allow_anonymous", false)? {
            PiAuth::Anonymous
        } else {
            return Err(ConfigError::MissingConnectionOption {
                option: String::from(
                    "access_token, or token_url + client_id + client_secret, or username + password",
                ),
            });
        };

        Ok(Self {
            base_url,
            auth,
            http: HttpSettings::from_options(raw)?,
        })
    }

    fn credentials(&self, http_client: Arc<dyn HttpClient>) -> Arc<dyn CredentialProvider> {
        match &self.auth {
            PiAuth::AccessToken(token) => Arc::new(StaticCredential::bearer(token.clone())),
            PiAuth::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scope,
            } => Arc::new(OAuthTokenCredential::new(
                http_client,
                token_url.clone(),
                TokenGrant::ClientCredentials {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    scope: scope.clone(),
                },
            )),
            PiAuth::Basic { username, password } => Arc::new(StaticCredential::new(HttpAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            })),
            PiAuth::Anonymous => Arc::new(StaticCredential::anonymous()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ReadOptions {
    tag_webids: Vec<String>,
    default_tags: usize,
    point_webids: Vec<String>,
    default_points: usize,
    dataserver_webid: Option<String>,
    name_filter: Option<String>,
    max_count: u32,
    start_index: u64,
    max_total_count: u64,
    start_time: Option<OffsetDateTime>,
    end_time: Option<OffsetDateTime>,
    lookback: Duration,
    window: Option<Duration>,
    interval: String,
    time: Option<String>,
    selected_fields: Option<String>,
    tags_per_request: usize,
    max_pages: u32,
    intervals: u32,
    summary_types: Vec<String>,
    summary_options: Vec<(&'static str, String)>,
    search_mode: String,
}

impl ReadOptions {
    fn parse(table: OsipiTable, raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::new(table.name(), raw);
        let window_seconds: i64 = options.parse_or("window_seconds", 0)?;
        Ok(Self {
            tag_webids: options.list("tag_webids")?,
            default_tags: options.parse_or("default_tags", DEFAULT_TAGS)?,
            point_webids: options.list("point_webids")?,
            default_points: options.parse_or("default_points", DEFAULT_POINTS)?,
            dataserver_webid: options.get("dataserver_webid").map(str::to_owned),
            name_filter: options.get("nameFilter").map(str::to_owned),
            max_count: options.parse_or("maxCount", DEFAULT_MAX_COUNT)?.max(1),
            start_index: options.parse_or("startIndex", 0)?,
            max_total_count: options.parse_or("maxTotalCount", DEFAULT_MAX_TOTAL_COUNT)?,
            start_time: pi_time(&options, &["startTime", "start_time"])?,
            end_time: pi_time(&options, &["endTime", "end_time"])?,
            lookback: match table {
                OsipiTable::EventFrames => {
                    Duration::days(options.parse_or("lookback_days", DEFAULT_EVENT_LOOKBACK_DAYS)?)
                }
                _ => Duration::minutes(options.parse_or("lookback_minutes", DEFAULT_LOOKBACK_MINUTES)?),
            },
            window: (window_seconds > 0).then(|| Duration::seconds(window_seconds)),
            interval: options
                .get_any(&["interval", "sampleInterval"])
                .unwrap_or(DEFAULT_INTERVAL)
                .to_owned(),
            time: options.get("time").map(str::to_owned),
            selected_fields: options.get("selectedFields").map(str::to_owned),
            tags_per_request: options.parse_or("tags_per_request", 0)?,
            max_pages: options.parse_or("max_pages_per_batch", DEFAULT_MAX_PAGES)?.max(1),
            intervals: options.parse_or("intervals", DEFAULT_INTERVALS)?.max(1),
            summary_types: match options.list("summaryType")? {
                types if types.is_empty() => vec![String::from(DEFAULT_SUMMARY_TYPE)],
                types => types,
            },
            summary_options: SUMMARY_PASSTHROUGH
                .iter()
                .filter_map(|key| Some((*key, options.get(key)?.to_owned())))
                .collect(),
            search_mode: options.get("searchMode").unwrap_or(DEFAULT_SEARCH_MODE).to_owned(),
        })
    }

    fn series_query(&self, series: Series, range: TimeRange) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("startTime", format_timestamp(range.start)),
            ("endTime", format_timestamp(range.end)),
        ];
        match series {
            Series::Recorded => query.push(("maxCount", self.max_count.to_string())),
            Series::Interpolated => {
                query.push(("interval", self.interval.clone()));
                query.push(("maxCount", self.max_count.to_string()));
            }
            Series::Plot => query.push(("intervals", self.intervals.to_string())),
        }
        if let Some(fields) = &self.selected_fields {
            query.push(("selectedFields", fields.clone()));
        }
        query
    }

    /// Per-tag summaries send every `summaryType` and only the bounds that
    /// were configured; streamset summaries send one type over the read window.
    fn summary_query(&self, range: Option<TimeRange>) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        let (start, end) = match range {
            Some(range) => (Some(range.start), Some(range.end)),
            None => (self.start_time, self.end_time),
        };
        if let Some(start) = start {
            query.push(("startTime", format_timestamp(start)));
        }
        if let Some(end) = end {
            query.push(("endTime", format_timestamp(end)));
        }
        match range {
            None => query.extend(self.summary_types.iter().map(|kind| ("summaryType", kind.clone()))),
            Some(_) => {
                let kind = self.summary_types.first().map_or(DEFAULT_SUMMARY_TYPE, String::as_str);
                query.push(("summaryType", kind.to_owned()));
                for (key, default) in STREAMSET_SUMMARY_DEFAULTS {
                    if !self.summary_options.iter().any(|(set, _)| *set == key) {
                        query.push((key, default.to_owned()));
                    }
                }
                if let Some(fields) = &self.selected_fields {
                    query.push(("selectedFields", fields.clone()));
                }
            }
        }
        query.extend(self.summary_options.iter().cloned());
        query
    }

    fn paging(&self, advance: WindowAdvance, max_pages: u32) -> WindowPaging {
        WindowPaging {
            max_count: self.max_count as usize,
            advance,
            max_pages,
        }
    }

    /// Tag groups sent per streamset request; one group when unset.
    fn groups<'a>(&self, tags: &'a [String]) -> Vec<&'a [String]> {
        if self.tags_per_request == 0 {
            vec![tags]
        } else {
            tags.chunks(self.tags_per_request).collect()
        }
    }
}

/// PI time option: RFC 3339 or `YYYY-MM-DD`; `*` means now.
fn pi_time(options: &TableOptions<'_>, keys: &[&str]) -> Result<Option<OffsetDateTime>, ConfigError> {
    let Some(key) = keys.iter().copied().find(|key| options.get(key).is_some()) else {
        return Ok(None);
    };
    if options.get(key) == Some("*") {
        return Ok(None);
    }
    options.instant(key)
}

/// Window `[start, end)` of one time-series read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeRange {
    start: OffsetDateTime,
    end: OffsetDateTime,
}

impl TimeRange {
    /// Start from the offset, else `startTime`, else `end - lookback`; end
    /// from `endTime`, else now, capped at `start + window` when windowed.
    fn resolve(offset: Option<&Offset>, options: &ReadOptions, now: OffsetDateTime, windowed: bool) -> Self {
        let end = options.end_time.unwrap_or(now);
        let start = offset
            .and_then(|offset| offset.get(WINDOW_KEY))
            .and_then(parse_instant)
            .or(options.start_time)
            .unwrap_or(end - options.lookback);
        let end = match (windowed, options.window) {
            (true, Some(window)) => end.min(start + window),
            _ => end,
        };
        Self { start, end }
    }

    fn is_empty(self) -> bool {
        self.start >= self.end
    }
}

fn item_timestamp(item: &Value) -> Option<OffsetDateTime> {
    item.get("Timestamp").and_then(Value::as_str).and_then(parse_instant)
}

/// Numeric value of a PI value; digital states carry it under `Value`.
fn numeric_value(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Number(number)) => Value::Number(number.clone()),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Value::Bool(flag)) => Value::from(if *flag { 1.0 } else { 0.0 }),
        Some(Value::Object(state)) => numeric_value(state.get("Value")),
        _ => Value::Null,
    }
}

fn flag(item: &Value, field: &str, default: bool) -> Value {
    let parsed = match item.get(field) {
        Some(Value::Bool(flag)) => Some(*flag),
        Some(Value::String(text)) => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };
    Value::from(parsed.unwrap_or(default))
}

fn value_record(webid: &str, item: &Value, ingested: &str) -> Record {
    let timestamp = item
        .get("Timestamp")
        .and_then(Value::as_str)
        .map(|raw| parse_instant(raw).map(format_timestamp).unwrap_or_else(|| raw.to_owned()));

    let mut record = Map::new();
    record.insert(String::from("tag_webid"), Value::from(webid));
    record.insert(String::from("timestamp"), timestamp.map(Value::from).unwrap_or(Value::Null));
    record.insert(String::from("value"), numeric_value(item.get("Value")));
    record.insert(String::from("good"), flag(item, "Good", true));
    record.insert(String::from("questionable"), flag(item, "Questionable", false));
    record.insert(String::from("substituted"), flag(item, "Substituted", false));
    record.insert(String::from("annotated"), flag(item, "Annotated", false));
    record.insert(
        String::from("units"),
        Value::from(item.get("UnitsAbbreviation").and_then(Value::as_str).unwrap_or("")),
    );
    record.insert(String::from("ingestion_timestamp"), Value::from(ingested));
    record
}

/// Records of time-series items; items without a timestamp are dropped.
fn series_records(webid: &str, items: &[Value], ingested: &str) -> Vec<Record> {
    items
        .iter()
        .filter(|item| item.get("Timestamp").and_then(Value::as_str).is_some())
        .map(|item| value_record(webid, item, ingested))
        .collect()
}

/// A summary item nests its value under `Value` next to its `Type`.
fn summary_record(webid: &str, item: &Value, ingested: &str) -> Record {
    let mut record = value_record(webid, item.get("Value").unwrap_or(&Value::Null), ingested);
    record.insert(
        String::from("summary_type"),
        Value::from(item.get("Type").and_then(Value::as_str).unwrap_or("")),
    );
    record
}

fn event_frame_record(frame: &Value, ingested: &str) -> Option<Record> {
    let webid = frame.get("WebId")?.as_str()?;
    let text = |field: &str| Value::from(frame.get(field).and_then(Value::as_str).unwrap_or(""));
    let instant = |field: &str| {
        frame
            .get(field)
            .and_then(Value::as_str)
            .and_then(parse_instant)
            .map(|at| Value::from(format_timestamp(at)))
            .unwrap_or(Value::Null)
    };
    let attributes = match frame.get("Attributes") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::Null => String::new(),
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (name.clone(), Value::from(value))
            })
            .collect::<Map<_, _>>(),
        _ => Map::new(),
    };

    let mut record = Map::new();
    record.insert(String::from("event_frame_webid"), Value::from(webid));
    record.insert(String::from("name"), text("Name"));
    record.insert(String::from("template_name"), text("TemplateName"));
    record.insert(String::from("start_time"), instant("StartTime"));
    record.insert(String::from("end_time"), instant("EndTime"));
    record.insert(
        String::from("primary_referenced_element_webid"),
        frame.get("PrimaryReferencedElementWebId").cloned().unwrap_or(Value::Null),
    );
    record.insert(String::from("description"), text("Description"));
    record.insert(
        String::from("category_names"),
        frame.get("CategoryNames").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
    );
    record.insert(String::from("attributes"), Value::Object(attributes));
    record.insert(String::from("ingestion_timestamp"), Value::from(ingested));
    Some(record)
}

/// `webid`, `name` and `path` of an asset server or database.
fn asset_record(item: &Value) -> Option<Record> {
    let webid = item.get("WebId")?.as_str()?;
    let mut record = Map::new();
    record.insert(String::from("webid"), Value::from(webid));
    for (column, field) in [("name", "Name"), ("path", "Path")] {
        record.insert(
            String::from(column),
            Value::from(item.get(field).and_then(Value::as_str).unwrap_or("")),
        );
    }
    Some(record)
}

fn streams_records(streams: &[WindowStream], ingested: &str) -> Vec<Record> {
    streams
        .iter()
        .filter_map(|stream| Some(series_records(stream.id.as_deref()?, &stream.items, ingested)))
        .flatten()
        .collect()
}

pub struct OsipiConnector {
    api: ApiClient,
    batch: JsonBatch,
    catalog: TableCatalog<OsipiTable>,
}

impl OsipiConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, options: &OptionMap) -> Result<Self, ConnectorError> {
        let config = OsipiConfig::from_options(options)?;
        let credentials = config.credentials(http_client.clone());
        let api = ApiClient::new(http_client, credentials, &config.base_url).with_settings(&config.http);
        Ok(Self {
            api,
            batch: JsonBatch::new(BATCH_PATH),
            catalog: TableCatalog::build(describe)?,
        })
    }

    async fn read_dataservers(&self) -> Result<Vec<Record>, ConnectorError> {
        let path = "/piwebapi/dataservers";
        let url = self.api.url(path);
        let body = self
            .api
            .get_json(path, &[], Requirement::Required)
            .await?
            .unwrap_or(Value::Null);
        Ok(expect_items(&url, &body, "Items")?
            .iter()
            .filter_map(|server| {
                let webid = server.get("WebId")?.as_str()?;
                let mut record = Map::new();
                record.insert(String::from("webid"), Value::from(webid));
                record.insert(
                    String::from("name"),
                    server.get("Name").cloned().unwrap_or(Value::Null),
                );
                Some(record)
            })
            .collect())
    }

    async fn read_points(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let server = match &options.dataserver_webid {
            Some(webid) => webid.clone(),
            None => match self.read_dataservers().await?.first().and_then(|s| str_field(s, "webid")) {
                Some(webid) => webid.to_owned(),
                None => return Ok(Vec::new()),
            },
        };

        let path = format!("/piwebapi/dataservers/{server}/points");
        let url = self.api.url(&path);
        let page_size = u64::from(options.max_count);
        let items = paginate_index(options.start_index, page_size, options.max_total_count, |index| {
            let mut query = vec![
                ("maxCount", page_size.to_string()),
                ("startIndex", index.to_string()),
            ];
            if let Some(filter) = &options.name_filter {
                query.push(("nameFilter", filter.clone()));
            }
            let (path, url) = (path.as_str(), url.as_str());
            async move {
                let body = self
                    .api
                    .get_json(path, &query, Requirement::Required)
                    .await?
                    .unwrap_or(Value::Null);
                expect_items(url, &body, "Items")
            }
        })
        .await?;

        Ok(items
            .iter()
            .filter_map(|point| {
                let webid = point.get("WebId")?.as_str()?;
                let text = |field: &str| Value::from(point.get(field).and_then(Value::as_str).unwrap_or(""));
                let mut record = Map::new();
                record.insert(String::from("webid"), Value::from(webid));
                record.insert(String::from("name"), point.get("Name").cloned().unwrap_or(Value::Null));
                record.insert(String::from("descriptor"), text("Descriptor"));
                record.insert(String::from("engineering_units"), text("EngineeringUnits"));
                record.insert(String::from("path"), text("Path"));
                record.insert(String::from("dataserver_webid"), Value::from(server.as_str()));
                Some(record)
            })
            .collect())
    }

    /// `explicit` ids, else the first `limit` discovered points.
    async fn resolve_webids(
        &self,
        explicit: &[String],
        limit: usize,
        options: &ReadOptions,
    ) -> Result<Vec<String>, ConnectorError> {
        if !explicit.is_empty() {
            return Ok(explicit.to_vec());
        }
        let points = self.read_points(options).await?;
        tracing::debug!(discovered = points.len(), limit, "auto-discovering tags from points");
        Ok(points
            .iter()
            .filter_map(|point| str_field(point, "webid"))
            .take(limit)
            .map(str::to_owned)
            .collect())
    }

    async fn read_point_attributes(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let points = self
            .resolve_webids(&options.point_webids, options.default_points, options)
            .await?;
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let mut query = Vec::new();
        if let Some(fields) = &options.selected_fields {
            query.push(("selectedFields", fields.clone()));
        }

        let per_point = pool::fetch_all(points, pool::DEFAULT_WIDTH, |webid| {
            let (query, ingested) = (&query, ingested.as_str());
            async move {
                let path = format!("/piwebapi/points/{webid}/attributes");
                let url = self.api.url(&path);
                let Some(body) = self.api.get_json(&path, query, Requirement::Optional).await? else {
                    return Ok(None);
                };
                let attributes = expect_items(&url, &body, "Items")?
                    .iter()
                    .map(|attribute| {
                        let value = match attribute.get("Value") {
                            None | Some(Value::Null) => Value::Null,
                            Some(Value::String(text)) => Value::from(text.as_str()),
                            Some(other) => Value::from(other.to_string()),
                        };
                        let kind = attribute
                            .get("Type")
                            .or_else(|| attribute.get("ValueType"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let mut record = Map::new();
                        record.insert(String::from("point_webid"), Value::from(webid.as_str()));
                        record.insert(
                            String::from("name"),
                            attribute.get("Name").cloned().unwrap_or(Value::Null),
                        );
                        record.insert(String::from("value"), value);
                        record.insert(String::from("type"), Value::from(kind));
                        record.insert(String::from("ingestion_timestamp"), Value::from(ingested));
                        record
                    })
                    .collect::<Vec<_>>();
                Ok(Some(attributes))
            }
        })
        .await?;

        Ok(per_point.into_iter().flatten().collect())
    }

    /// Stream values at `time` (the snapshot value when unset), batched.
    async fn read_values_at(&self, options: &ReadOptions, time: Option<&str>) -> Result<Vec<Record>, ConnectorError> {
        let tags = self
            .resolve_webids(&options.tag_webids, options.default_tags, options)
            .await?;
        let items = tags
            .iter()
            .map(|webid| {
                let mut url = self.api.url(&format!("/piwebapi/streams/{webid}/value"));
                if let Some(time) = time {
                    url = append_query(&url, [("time", time)]);
                }
                BatchItem::new(webid.as_str(), url)
            })
            .collect::<Vec<_>>();

        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let outcomes = execute_batched(&self.api, &self.batch, &items, FALLBACK_WIDTH).await?;
        Ok(outcomes
            .iter()
            .map(|outcome| value_record(&outcome.key, &outcome.body, &ingested))
            .collect())
    }

    /// `GET /streams/{webid}/{segment}` for every tag; unavailable tags are
    /// left out.
    async fn fetch_per_tag(
        &self,
        tags: &[String],
        segment: &str,
        query: &[(&'static str, String)],
    ) -> Result<Vec<(String, Value)>, ConnectorError> {
        pool::fetch_all(tags.to_vec(), pool::DEFAULT_WIDTH, |webid: String| async move {
            let path = format!("/piwebapi/streams/{webid}/{segment}");
            let body = self.api.get_json(&path, query, Requirement::Optional).await?;
            Ok(body.map(|body| (webid, body)))
        })
        .await
    }

    async fn read_end(&self, tags: &[String], ingested: &str) -> Result<Vec<Record>, ConnectorError> {
        Ok(self
            .fetch_per_tag(tags, "end", &[])
            .await?
            .iter()
            .map(|(webid, value)| value_record(webid, value, ingested))
            .collect())
    }

    async fn read_streamset_end(&self, tags: &[String], options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let path = "/piwebapi/streamsets/end";
        let url = self.api.url(path);
        let mut records = Vec::new();
        for group in options.groups(tags) {
            let query = group
                .iter()
                .map(|webid| ("webId", webid.clone()))
                .collect::<Vec<_>>();
            let Some(body) = self.api.get_json(path, &query, Requirement::Optional).await? else {
                tracing::warn!(tags = group.len(), "streamset end unavailable, reading tags one by one");
                records.extend(self.read_end(group, &ingested).await?);
                continue;
            };
            records.extend(expect_items(&url, &body, "Items")?.iter().filter_map(|stream| {
                let webid = stream.get("WebId")?.as_str()?;
                Some(value_record(webid, stream.get("Value").unwrap_or(&Value::Null), &ingested))
            }));
        }
        Ok(records)
    }

    /// Recorded value at `time`, falling back to the interpolated value for
    /// tags without a `recordedattime` resource.
    async fn read_recorded_at_time(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let tags = self
            .resolve_webids(&options.tag_webids, options.default_tags, options)
            .await?;
        let time = options.time.as_deref().unwrap_or("*");
        let now = OffsetDateTime::now_utc();
        let ingested = format_timestamp(now);
        let query_time = match time {
            "*" => Value::from(ingested.as_str()),
            raw => parse_instant(raw).map(|at| Value::from(format_timestamp(at))).unwrap_or(Value::Null),
        };
        let query = [("time", time.to_owned())];

        let mut values = self.fetch_per_tag(&tags, "recordedattime", &query).await?;
        let missing = tags
            .iter()
            .filter(|webid| !values.iter().any(|(found, _)| found == *webid))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            values.extend(self.fetch_per_tag(&missing, "value", &query).await?);
        }

        Ok(values
            .iter()
            .map(|(webid, value)| {
                let mut record = value_record(webid, value, &ingested);
                record.insert(String::from("query_time"), query_time.clone());
                record
            })
            .collect())
    }

    async fn read_summary(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let tags = self
            .resolve_webids(&options.tag_webids, options.default_tags, options)
            .await?;
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let query = options.summary_query(None);
        let query = &query;
        let per_tag = pool::fetch_all(tags, pool::DEFAULT_WIDTH, |webid: String| {
            let ingested = ingested.as_str();
            async move {
                let path = format!("/piwebapi/streams/{webid}/summary");
                let url = self.api.url(&path);
                let body = self
                    .api
                    .get_json(&path, query, Requirement::Required)
                    .await?
                    .unwrap_or(Value::Null);
                let items = expect_items(&url, &body, "Items")?;
                Ok(Some(
                    items
                        .iter()
                        .map(|item| summary_record(&webid, item, ingested))
                        .collect::<Vec<_>>(),
                ))
            }
        })
        .await?;
        Ok(per_tag.into_iter().flatten().collect())
    }

    async fn read_asset_servers(&self) -> Result<Vec<Record>, ConnectorError> {
        let path = "/piwebapi/assetservers";
        let Some(body) = self.api.get_json(path, &[], Requirement::Optional).await? else {
            return Ok(Vec::new());
        };
        Ok(expect_items(&self.api.url(path), &body, "Items")?
            .iter()
            .filter_map(asset_record)
            .collect())
    }

    async fn read_asset_databases(&self) -> Result<Vec<Record>, ConnectorError> {
        let servers = self.read_asset_servers().await?;
        let server_ids = servers
            .iter()
            .filter_map(|server| str_field(server, "webid"))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let per_server = pool::fetch_all(server_ids, pool::DEFAULT_WIDTH, |server: String| async move {
            let path = format!("/piwebapi/assetservers/{server}/assetdatabases");
            let Some(body) = self.api.get_json(&path, &[], Requirement::Optional).await? else {
                return Ok(None);
            };
            let databases = expect_items(&self.api.url(&path), &body, "Items")?
                .iter()
                .filter_map(asset_record)
                .map(|mut database| {
                    database.insert(String::from("assetserver_webid"), Value::from(server.as_str()));
                    database
                })
                .collect::<Vec<_>>();
            Ok(Some(databases))
        })
        .await?;
        Ok(per_server.into_iter().flatten().collect())
    }

    /// Event frames overlapping `range` in every asset database.
    async fn read_event_frames(&self, range: TimeRange, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let databases = self.read_asset_databases().await?;
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let page_size = u64::from(options.max_count);
        let mut records = Vec::new();

        for database in databases.iter().filter_map(|database| str_field(database, "webid")) {
            let path = format!("/piwebapi/assetdatabases/{database}/eventframes");
            let url = self.api.url(&path);
            let frames = paginate_index(options.start_index, page_size, options.max_total_count, |index| {
                let query = vec![
                    ("startTime", format_timestamp(range.start)),
                    ("endTime", format_timestamp(range.end)),
                    ("searchMode", options.search_mode.clone()),
                    ("startIndex", index.to_string()),
                    ("maxCount", page_size.to_string()),
                ];
                let (path, url) = (path.as_str(), url.as_str());
                async move {
                    let body = self
                        .api
                        .get_json(path, &query, Requirement::Required)
                        .await?
                        .unwrap_or(Value::Null);
                    expect_items(url, &body, "Items")
                }
            })
            .await?;
            records.extend(frames.iter().filter_map(|frame| event_frame_record(frame, &ingested)));
        }
        Ok(records)
    }

    async fn fetch_stream(
        &self,
        webid: &str,
        series: Series,
        range: TimeRange,
        options: &ReadOptions,
    ) -> Result<Vec<WindowStream>, ConnectorError> {
        let path = format!("/piwebapi/streams/{webid}/{}", series.segment());
        let url = self.api.url(&path);
        let query = options.series_query(series, range);
        let body = self
            .api
            .get_json(&path, &query, Requirement::Required)
            .await?
            .unwrap_or(Value::Null);
        Ok(vec![WindowStream {
            id: Some(webid.to_owned()),
            items: expect_items(&url, &body, "Items")?,
        }])
    }

    /// One streamset page. `None` when the endpoint is unavailable.
    async fn fetch_streamset(
        &self,
        group: &[String],
        series: Series,
        range: TimeRange,
        options: &ReadOptions,
        requirement: Requirement,
    ) -> Result<Option<Vec<WindowStream>>, ConnectorError> {
        let query = options.series_query(series, range);
        self.get_streamset(series.segment(), group, query, requirement).await
    }

    /// `GET /streamsets/{segment}` for `group`, each stream's items kept as
    /// returned. `None` when the endpoint is unavailable.
    async fn get_streamset(
        &self,
        segment: &str,
        group: &[String],
        query: Vec<(&'static str, String)>,
        requirement: Requirement,
    ) -> Result<Option<Vec<WindowStream>>, ConnectorError> {
        let path = format!("/piwebapi/streamsets/{segment}");
        let url = self.api.url(&path);
        let mut params = group
            .iter()
            .map(|webid| ("webId", webid.clone()))
            .collect::<Vec<_>>();
        params.extend(query);

        let Some(body) = self.api.get_json(&path, &params, requirement).await? else {
            return Ok(None);
        };
        let streams = expect_items(&url, &body, "Items")?
            .iter()
            .map(|stream| {
                Ok(WindowStream {
                    id: stream.get("WebId").and_then(Value::as_str).map(str::to_owned),
                    items: expect_items(&url, stream, "Items")?,
                })
            })
            .collect::<Result<Vec<_>, ConnectorError>>()?;
        Ok(Some(streams))
    }

    /// First page of every tag through the batch endpoint; tags whose page
    /// was full keep paging on their own from the newest timestamp seen.
    async fn read_recorded(
        &self,
        tags: &[String],
        range: TimeRange,
        options: &ReadOptions,
    ) -> Result<(Vec<Record>, OffsetDateTime), ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let query = options.series_query(Series::Recorded, range);
        let items = tags
            .iter()
            .map(|webid| {
                let url = append_query(
                    &self.api.url(&format!("/piwebapi/streams/{webid}/recorded")),
                    query.iter().map(|(k, v)| (*k, v.as_str())),
                );
                BatchItem::new(webid.as_str(), url)
            })
            .collect::<Vec<_>>();
        let outcomes = execute_batched(&self.api, &self.batch, &items, FALLBACK_WIDTH).await?;

        let mut covered = range.end;
        let mut records = Vec::new();
        for outcome in &outcomes {
            let webid = outcome.key.as_str();
            let endpoint = self.api.url(&format!("/piwebapi/streams/{webid}/recorded"));
            let first = expect_items(&endpoint, &outcome.body, "Items")?;
            records.extend(series_records(webid, &first, &ingested));

            let newest = first.iter().filter_map(item_timestamp).max();
            let (true, Some(newest)) = (first.len() >= options.max_count as usize, newest) else {
                continue;
            };
            let paging = options.paging(WindowAdvance::Latest, options.max_pages.saturating_sub(1));
            let run = paginate_window(newest + WINDOW_EPSILON, range.end, paging, item_timestamp, |start, end| {
                self.fetch_stream(webid, Series::Recorded, TimeRange { start, end }, options)
            })
            .await?;
            records.extend(streams_records(&run.streams, &ingested));
            covered = covered.min(run.covered_until);
        }

        Ok((records, covered))
    }

    async fn read_streamset(
        &self,
        tags: &[String],
        series: Series,
        range: TimeRange,
        options: &ReadOptions,
    ) -> Result<(Vec<Record>, OffsetDateTime), ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let paging = options.paging(WindowAdvance::EarliestAcrossStreams, options.max_pages);
        let mut covered = range.end;
        let mut records = Vec::new();

        for group in options.groups(tags) {
            let run = paginate_window(range.start, range.end, paging, item_timestamp, |start, end| async move {
                self.fetch_streamset(group, series, TimeRange { start, end }, options, Requirement::Required)
                    .await
                    .map(Option::unwrap_or_default)
            })
            .await?;
            records.extend(streams_records(&run.streams, &ingested));
            covered = covered.min(run.covered_until);
        }

        Ok((records, covered))
    }

    /// Single-tag groups page the stream endpoint unless `streamset` is set.
    async fn read_interpolated(
        &self,
        tags: &[String],
        range: TimeRange,
        options: &ReadOptions,
        streamset: bool,
    ) -> Result<(Vec<Record>, OffsetDateTime), ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let mut covered = range.end;
        let mut records = Vec::new();

        for group in options.groups(tags) {
            if let ([webid], false) = (group, streamset) {
                let paging = options.paging(WindowAdvance::Latest, options.max_pages);
                let run = paginate_window(range.start, range.end, paging, item_timestamp, |start, end| {
                    self.fetch_stream(webid, Series::Interpolated, TimeRange { start, end }, options)
                })
                .await?;
                records.extend(streams_records(&run.streams, &ingested));
                covered = covered.min(run.covered_until);
                continue;
            }

            let unavailable = AtomicBool::new(false);
            let paging = options.paging(WindowAdvance::EarliestAcrossStreams, options.max_pages);
            let run = paginate_window(range.start, range.end, paging, item_timestamp, |start, end| {
                let unavailable = &unavailable;
                async move {
                    let page = self
                        .fetch_streamset(group, Series::Interpolated, TimeRange { start, end }, options, Requirement::Optional)
                        .await?;
                    if page.is_none() {
                        unavailable.store(true, Ordering::Relaxed);
                    }
                    Ok(page.unwrap_or_default())
                }
            })
            .await?;

            if unavailable.load(Ordering::Relaxed) {
                tracing::warn!(tags = group.len(), "streamset interpolation unavailable, using per-tag batch");
                records.extend(self.batch_interpolated(group, range, options, &ingested).await?);
            } else {
                records.extend(streams_records(&run.streams, &ingested));
                covered = covered.min(run.covered_until);
            }
        }

        Ok((records, covered))
    }

    async fn batch_interpolated(
        &self,
        group: &[String],
        range: TimeRange,
        options: &ReadOptions,
        ingested: &str,
    ) -> Result<Vec<Record>, ConnectorError> {
        let query = options.series_query(Series::Interpolated, range);
        let items = group
            .iter()
            .map(|webid| {
                let url = append_query(
                    &self.api.url(&format!("/piwebapi/streams/{webid}/interpolated")),
                    query.iter().map(|(k, v)| (*k, v.as_str())),
                );
                BatchItem::new(webid.as_str(), url)
            })
            .collect::<Vec<_>>();
        let outcomes = execute_batched(&self.api, &self.batch, &items, FALLBACK_WIDTH).await?;

        let mut records = Vec::new();
        for outcome in &outcomes {
            let endpoint = self.api.url(&format!("/piwebapi/streams/{}/interpolated", outcome.key));
            let values = expect_items(&endpoint, &outcome.body, "Items")?;
            records.extend(series_records(&outcome.key, &values, ingested));
        }
        Ok(records)
    }

    async fn read_plot(&self, tags: &[String], range: TimeRange, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let query = options.series_query(Series::Plot, range);
        let mut records = Vec::new();
        for (webid, body) in self.fetch_per_tag(tags, "plot", &query).await? {
            let endpoint = self.api.url(&format!("/piwebapi/streams/{webid}/plot"));
            records.extend(series_records(&webid, &expect_items(&endpoint, &body, "Items")?, &ingested));
        }
        Ok(records)
    }

    async fn read_streamset_plot(
        &self,
        tags: &[String],
        range: TimeRange,
        options: &ReadOptions,
    ) -> Result<Vec<Record>, ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let mut records = Vec::new();
        for group in options.groups(tags) {
            match self
                .fetch_streamset(group, Series::Plot, range, options, Requirement::Optional)
                .await?
            {
                Some(streams) => records.extend(streams_records(&streams, &ingested)),
                None => {
                    tracing::warn!(tags = group.len(), "streamset plot unavailable, reading tags one by one");
                    records.extend(self.read_plot(group, range, options).await?);
                }
            }
        }
        Ok(records)
    }

    /// Summary items without a timestamp are dropped.
    async fn read_streamset_summary(
        &self,
        tags: &[String],
        range: TimeRange,
        options: &ReadOptions,
    ) -> Result<Vec<Record>, ConnectorError> {
        let ingested = format_timestamp(OffsetDateTime::now_utc());
        let mut records = Vec::new();
        for group in options.groups(tags) {
            let query = options.summary_query(Some(range));
            let Some(streams) = self.get_streamset("summary", group, query, Requirement::Optional).await? else {
                tracing::warn!(tags = group.len(), "streamset summary unavailable");
                continue;
            };
            for stream in &streams {
                let Some(webid) = stream.id.as_deref() else { continue };
                records.extend(
                    stream
                        .items
                        .iter()
                        .filter(|item| item.get("Value").and_then(item_timestamp).is_some())
                        .map(|item| summary_record(webid, item, &ingested)),
                );
            }
        }
        Ok(records)
    }

    async fn read_series(
        &self,
        table: OsipiTable,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let range = TimeRange::resolve(offset, options, OffsetDateTime::now_utc(), table.windowed());
        if range.is_empty() {
            let unchanged = offset.cloned().unwrap_or_else(|| window_offset(range.end));
            return Ok(ReadBatch::empty(unchanged));
        }
        if table == OsipiTable::EventFrames {
            let records = self.read_event_frames(range, options).await?;
            return Ok(ReadBatch::new(records, window_offset(range.end)));
        }

        let tags = self
            .resolve_webids(&options.tag_webids, options.default_tags, options)
            .await?;
        if tags.is_empty() {
            return Ok(ReadBatch::empty(window_offset(range.end)));
        }

        let (records, covered) = match table {
            OsipiTable::StreamsetRecorded => {
                self.read_streamset(&tags, Series::Recorded, range, options).await?
            }
            OsipiTable::Interpolated => self.read_interpolated(&tags, range, options, false).await?,
            OsipiTable::StreamsetInterpolated => self.read_interpolated(&tags, range, options, true).await?,
            OsipiTable::Plot => (self.read_plot(&tags, range, options).await?, range.end),
            OsipiTable::StreamsetPlot => (self.read_streamset_plot(&tags, range, options).await?, range.end),
            OsipiTable::StreamsetSummary => {
                (self.read_streamset_summary(&tags, range, options).await?, range.end)
            }
            _ => self.read_recorded(&tags, range, options).await?,
        };

        if covered < range.end {
            tracing::debug!(table = table.name(), covered_until = %format_timestamp(covered), "page cap reached inside window");
        }
        Ok(ReadBatch::new(records, window_offset(covered)))
    }

    async fn read_snapshot(
        &self,
        table: OsipiTable,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        if SNAPSHOT.already_done(offset) {
            return Ok(ReadBatch::empty(Offset::done()));
        }
        let records = match table {
            OsipiTable::Dataservers => self.read_dataservers().await?,
            OsipiTable::Points => self.read_points(options).await?,
            OsipiTable::PointAttributes => self.read_point_attributes(options).await?,
            OsipiTable::CurrentValue => self.read_values_at(options, options.time.as_deref()).await?,
            OsipiTable::ValueAtTime => {
                self.read_values_at(options, Some(options.time.as_deref().unwrap_or("*"))).await?
            }
            OsipiTable::RecordedAtTime => self.read_recorded_at_time(options).await?,
            OsipiTable::End | OsipiTable::StreamsetEnd => {
                let tags = self
                    .resolve_webids(&options.tag_webids, options.default_tags, options)
                    .await?;
                match table {
                    OsipiTable::StreamsetEnd => self.read_streamset_end(&tags, options).await?,
                    _ => self.read_end(&tags, &format_timestamp(OffsetDateTime::now_utc())).await?,
                }
            }
            OsipiTable::Summary => self.read_summary(options).await?,
            OsipiTable::AssetServers => self.read_asset_servers().await?,
            OsipiTable::AssetDatabases => self.read_asset_databases().await?,
            _ => Vec::new(),
        };
        Ok(ReadBatch::new(records, SNAPSHOT.terminal()))
    }
}

#[async_trait]
impl Connector for OsipiConnector {
    fn name(&self) -> &'static str {
        "osipi"
    }

    fn list_tables(&self) -> Vec<String> {
        self.catalog.names()
    }

    async fn get_table_schema(
        &self,
        table: &str,
        _options: &OptionMap,
    ) -> Result<Vec<Column>, ConnectorError> {
        let (_, descriptor) = self.catalog.resolve(table)?;
        Ok(descriptor.columns.clone())
    }

    async fn read_table_metadata(
        &self,
        table: &str,
        _options: &OptionMap,
    ) -> Result<TableMetadata, ConnectorError> {
        let (_, descriptor) = self.catalog.resolve(table)?;
        Ok(descriptor.metadata())
    }

    async fn read_table(
        &self,
        table: &str,
        offset: Option<&Offset>,
        options: &OptionMap,
    ) -> Result<ReadBatch, ConnectorError> {
        let (kind, descriptor) = self.catalog.resolve(table)?;
        let read_options = ReadOptions::parse(kind, options)?;

        let batch = match descriptor.mode {
            IngestionMode::Snapshot => self.read_snapshot(kind, offset, &read_options).await,
            _ => self.read_series(kind, offset, &read_options).await,
        }
        .map_err(|error| error.in_table(table))?;

        tracing::info!(connector = "osipi", table, records = batch.len(), offset = %batch.offset, "read completed");
        Ok(batch)
    }
}
