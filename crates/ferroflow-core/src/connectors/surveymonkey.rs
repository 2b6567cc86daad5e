//! SurveyMonkey API v3 connector.
//!
//! Surveys, responses and collectors are `cdc` on `date_modified`, listed
//! ascending with a server-side `start_modified_at`. Per-survey tables read
//! one survey when `survey_id` is set, otherwise every survey of the account.
//! Everything else is a snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::auth::StaticCredential;
use crate::config::HttpSettings;
use crate::connector::{Connector, ReadBatch, Record};
use crate::connectors::{into_records, str_field};
use crate::dispatch::{TableCatalog, TableKind};
use crate::error::{ConfigError, ConnectorError};
use crate::http_client::{append_query, HttpClient};
use crate::offset::{format_timestamp, parse_instant, CursorProtocol, CursorTracker, Offset, ResumeState};
use crate::options::{OptionMap, TableOptions};
use crate::pagination::{self, PageShape};
use crate::pool;
use crate::retry::{ResetEncoding, ResetHeader};
use crate::table::{columns, Column, ColumnType, IngestionMode, TableDescriptor, TableMetadata};
use crate::transport::{ApiClient, Requirement};

pub const DEFAULT_BASE_URL: &str = "https://api.surveymonkey.com/v3";
/// Cursor column and offset key of the incremental tables.
pub const DATE_MODIFIED_KEY: &str = "date_modified";

const DEFAULT_PER_PAGE: u32 = 100;
const PER_PAGE_LIMIT: u32 = 1000;
const SURVEY_LIST_PER_PAGE: u32 = 1000;
const DEFAULT_MAX_PAGES: u32 = 50;
const DEFAULT_LOOKBACK_SECONDS: i64 = 300;
const UNCAPPED: u32 = u32::MAX;
const SURVEY_FIELDS: &str = "response_count,date_created,date_modified,language,question_count";

const DATA_PAGES: PageShape = PageShape::body_link("data", "links", "next");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveymonkeyTable {
    Surveys,
    SurveyResponses,
    Collectors,
    SurveyPages,
    SurveyQuestions,
    SurveyRollups,
    ContactLists,
    Contacts,
    Users,
    Groups,
    GroupMembers,
    Workgroups,
    Webhooks,
}

impl TableKind for SurveymonkeyTable {
    const ALL: &'static [Self] = &[
        Self::Surveys,
        Self::SurveyResponses,
        Self::Collectors,
        Self::SurveyPages,
        Self::SurveyQuestions,
        Self::SurveyRollups,
        Self::ContactLists,
        Self::Contacts,
        Self::Users,
        Self::Groups,
        Self::GroupMembers,
        Self::Workgroups,
        Self::Webhooks,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Surveys => "surveys",
            Self::SurveyResponses => "survey_responses",
            Self::Collectors => "collectors",
            Self::SurveyPages => "survey_pages",
            Self::SurveyQuestions => "survey_questions",
            Self::SurveyRollups => "survey_rollups",
            Self::ContactLists => "contact_lists",
            Self::Contacts => "contacts",
            Self::Users => "users",
            Self::Groups => "groups",
            Self::GroupMembers => "group_members",
            Self::Workgroups => "workgroups",
            Self::Webhooks => "webhooks",
        }
    }
}

impl SurveymonkeyTable {
    /// Path segment under `/surveys/{id}/` for per-survey listings.
    fn survey_segment(self) -> Option<&'static str> {
        match self {
            Self::SurveyResponses => Some("responses/bulk"),
            Self::Collectors => Some("collectors"),
            Self::SurveyRollups => Some("rollups"),
            _ => None,
        }
    }

    /// Account-level listings read in full.
    fn account_listing(self) -> Option<(&'static str, Requirement)> {
        match self {
            Self::ContactLists => Some(("/contact_lists", Requirement::Required)),
            Self::Contacts => Some(("/contacts", Requirement::Required)),
            // Plan-gated: unavailable on lower tiers.
            Self::Groups => Some(("/groups", Requirement::Optional)),
            Self::Workgroups => Some(("/workgroups", Requirement::Optional)),
            Self::Webhooks => Some(("/webhooks", Requirement::Optional)),
            _ => None,
        }
    }
}

fn describe(table: SurveymonkeyTable) -> Result<TableDescriptor, crate::table::DescriptorError> {
    use ColumnType::{Boolean, Json, Long, String as Text, Timestamp};

    let (layout, keys, mode, cursor): (Vec<(&str, ColumnType)>, Vec<&str>, IngestionMode, Option<&str>) =
        match table {
            SurveymonkeyTable::Surveys => (
                vec![
                    ("id", Text),
                    ("title", Text),
                    ("nickname", Text),
                    ("language", Text),
                    ("category", Text),
                    ("folder_id", Text),
                    ("question_count", Long),
                    ("page_count", Long),
                    ("response_count", Long),
                    ("date_created", Timestamp),
                    ("date_modified", Timestamp),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Cdc,
                Some(DATE_MODIFIED_KEY),
            ),
            SurveymonkeyTable::SurveyResponses => (
                vec![
                    ("id", Text),
                    ("survey_id", Text),
                    ("collector_id", Text),
                    ("recipient_id", Text),
                    ("response_status", Text),
                    ("total_time", Long),
                    ("ip_address", Text),
                    ("custom_variables", Json),
                    ("pages", Json),
                    ("date_created", Timestamp),
                    ("date_modified", Timestamp),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Cdc,
                Some(DATE_MODIFIED_KEY),
            ),
            SurveymonkeyTable::Collectors => (
                vec![
                    ("id", Text),
                    ("survey_id", Text),
                    ("name", Text),
                    ("type", Text),
                    ("status", Text),
                    ("response_count", Long),
                    ("url", Text),
                    ("date_created", Timestamp),
                    ("date_modified", Timestamp),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Cdc,
                Some(DATE_MODIFIED_KEY),
            ),
            SurveymonkeyTable::SurveyPages => (
                vec![
                    ("survey_id", Text),
                    ("id", Text),
                    ("title", Text),
                    ("description", Text),
                    ("position", Long),
                    ("question_count", Long),
                    ("href", Text),
                ],
                vec!["survey_id", "id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::SurveyQuestions => (
                vec![
                    ("survey_id", Text),
                    ("page_id", Text),
                    ("id", Text),
                    ("position", Long),
                    ("family", Text),
                    ("subtype", Text),
                    ("headings", Json),
                    ("answers", Json),
                    ("required", Json),
                    ("visible", Boolean),
                    ("href", Text),
                ],
                vec!["survey_id", "id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::SurveyRollups => (
                vec![
                    ("survey_id", Text),
                    ("id", Text),
                    ("family", Text),
                    ("subtype", Text),
                    ("summary", Json),
                    ("href", Text),
                ],
                vec!["survey_id", "id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::ContactLists => (
                vec![("id", Text), ("name", Text), ("href", Text)],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::Contacts => (
                vec![
                    ("id", Text),
                    ("email", Text),
                    ("first_name", Text),
                    ("last_name", Text),
                    ("custom_fields", Json),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::Users => (
                vec![
                    ("id", Text),
                    ("username", Text),
                    ("email", Text),
                    ("first_name", Text),
                    ("last_name", Text),
                    ("account_type", Text),
                    ("language", Text),
                    ("date_created", Timestamp),
                    ("date_last_login", Timestamp),
                    ("scopes", Json),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::Groups => (
                vec![
                    ("id", Text),
                    ("name", Text),
                    ("member_count", Long),
                    ("max_invites", Long),
                    ("date_created", Timestamp),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::GroupMembers => (
                vec![
                    ("group_id", Text),
                    ("id", Text),
                    ("username", Text),
                    ("email", Text),
                    ("type", Text),
                    ("status", Text),
                    ("date_created", Timestamp),
                    ("href", Text),
                ],
                vec!["group_id", "id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::Workgroups => (
                vec![
                    ("id", Text),
                    ("name", Text),
                    ("description", Text),
                    ("member_count", Long),
                    ("is_visible", Boolean),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            SurveymonkeyTable::Webhooks => (
                vec![
                    ("id", Text),
                    ("name", Text),
                    ("event_type", Text),
                    ("object_type", Text),
                    ("object_ids", Json),
                    ("subscription_url", Text),
                    ("href", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
        };

    TableDescriptor::new(table.name(), columns(&layout, &keys), &keys, mode, cursor)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveymonkeyConfig {
    pub access_token: String,
    pub base_url: String,
    pub http: HttpSettings,
}

impl SurveymonkeyConfig {
    pub fn from_options(raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::connection(raw);
        Ok(Self {
            access_token: options.required("access_token")?.to_owned(),
            base_url: options.get("base_url").unwrap_or(DEFAULT_BASE_URL).to_owned(),
            http: HttpSettings::from_options(raw)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ReadOptions {
    survey_id: Option<String>,
    group_id: Option<String>,
    per_page: u32,
    max_pages: u32,
    lookback: Duration,
    start_date: Option<OffsetDateTime>,
}

impl ReadOptions {
    fn parse(table: SurveymonkeyTable, raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::new(table.name(), raw);
        Ok(Self {
            survey_id: options.get("survey_id").map(str::to_owned),
            group_id: options.get("group_id").map(str::to_owned),
            per_page: options
                .parse_or("per_page", DEFAULT_PER_PAGE)?
                .clamp(1, PER_PAGE_LIMIT),
            max_pages: options
                .parse_or("max_pages_per_batch", DEFAULT_MAX_PAGES)?
                .max(1),
            lookback: Duration::seconds(
                options.parse_or("lookback_seconds", DEFAULT_LOOKBACK_SECONDS)?,
            ),
            start_date: options.instant("start_date")?,
        })
    }

    /// `start_modified_at` for the read: stored cursor, else `start_date`.
    fn modified_since(&self, offset: Option<&Offset>) -> Option<String> {
        let lower = match ResumeState::from_offset(offset, DATE_MODIFIED_KEY) {
            ResumeState::Resuming(cursor) => parse_instant(cursor),
            ResumeState::Initial => self.start_date,
        };
        lower.map(api_timestamp)
    }

    fn modified_query(&self, offset: Option<&Offset>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("per_page", self.per_page.to_string()),
            ("sort_by", String::from(DATE_MODIFIED_KEY)),
            ("sort_order", String::from("asc")),
        ];
        if let Some(since) = self.modified_since(offset) {
            query.push(("start_modified_at", since));
        }
        query
    }
}

/// The API takes naive UTC timestamps.
fn api_timestamp(instant: OffsetDateTime) -> String {
    let utc = instant.to_offset(UtcOffset::UTC);
    utc.format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| format_timestamp(utc))
}

pub struct SurveymonkeyConnector {
    api: ApiClient,
    catalog: TableCatalog<SurveymonkeyTable>,
}

impl SurveymonkeyConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, options: &OptionMap) -> Result<Self, ConnectorError> {
        let config = SurveymonkeyConfig::from_options(options)?;
        let credentials = StaticCredential::bearer(config.access_token.clone());
        let api = ApiClient::new(http_client, Arc::new(credentials), &config.base_url)
            .with_settings(&config.http)
            .with_reset_header(ResetHeader::new(
                "x-ratelimit-app-global-minute-reset",
                ResetEncoding::DeltaSeconds,
            ));
        Ok(Self {
            api,
            catalog: TableCatalog::build(describe)?,
        })
    }

    async fn list(
        &self,
        path: &str,
        query: &[(&str, String)],
        max_pages: u32,
        requirement: Requirement,
    ) -> Result<Vec<Record>, ConnectorError> {
        let url = append_query(&self.api.url(path), query.iter().map(|(k, v)| (*k, v.as_str())));
        let run = pagination::follow(&self.api, &url, DATA_PAGES, max_pages, requirement).await?;
        tracing::debug!(endpoint = %url, pages = run.pages, truncated = run.truncated(), "surveymonkey pages read");
        let records = into_records(&url, run.items)?;
        Ok(records.into_iter().map(clean_record).collect())
    }

    /// Ids of every survey in the account.
    async fn survey_ids(&self) -> Result<Vec<String>, ConnectorError> {
        let query = [("per_page", SURVEY_LIST_PER_PAGE.to_string())];
        let surveys = self.list("/surveys", &query, UNCAPPED, Requirement::Required).await?;
        Ok(ids_of(&surveys))
    }

    async fn target_surveys(&self, options: &ReadOptions) -> Result<Vec<String>, ConnectorError> {
        match &options.survey_id {
            Some(id) => Ok(vec![id.clone()]),
            None => self.survey_ids().await,
        }
    }

    async fn read_modified(
        &self,
        table: SurveymonkeyTable,
        descriptor: &TableDescriptor,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let mut query = options.modified_query(offset);
        let records = match (table.survey_segment(), &options.survey_id) {
            (None, _) => {
                query.push(("include", String::from(SURVEY_FIELDS)));
                self.list("/surveys", &query, options.max_pages, Requirement::Required).await?
            }
            // One ascending listing: a capped run leaves a resumable prefix.
            (Some(segment), Some(survey_id)) => {
                let path = format!("/surveys/{survey_id}/{segment}");
                let records = self.list(&path, &query, options.max_pages, Requirement::Required).await?;
                stamp_all(records, "survey_id", survey_id)
            }
            // Merged listings have no common order, so each is read in full.
            (Some(segment), None) => {
                let surveys = self.survey_ids().await?;
                self.fan_out_surveys(surveys, segment, &query).await?
            }
        };

        let mut tracker = CursorTracker::new();
        for record in &records {
            tracker.observe_record(record, DATE_MODIFIED_KEY);
        }
        let next = CursorProtocol::new(DATE_MODIFIED_KEY, options.lookback).next_offset(
            descriptor.mode,
            offset,
            &tracker,
        );
        Ok(ReadBatch::new(records, next))
    }

    /// Lists `/surveys/{id}/{segment}` for every survey. Surveys that are gone
    /// or not shared with the token are skipped.
    async fn fan_out_surveys(
        &self,
        surveys: Vec<String>,
        segment: &str,
        query: &[(&'static str, String)],
    ) -> Result<Vec<Record>, ConnectorError> {
        let nested = pool::fetch_all(surveys, pool::DEFAULT_WIDTH, |survey_id: String| async move {
            let path = format!("/surveys/{survey_id}/{segment}");
            let records = self.list(&path, query, UNCAPPED, Requirement::Optional).await?;
            Ok(Some(stamp_all(records, "survey_id", &survey_id)))
        })
        .await?;
        Ok(nested.into_iter().flatten().collect())
    }

    async fn read_snapshot(
        &self,
        table: SurveymonkeyTable,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let per_page = [("per_page", options.per_page.to_string())];
        let records = match table {
            SurveymonkeyTable::SurveyPages | SurveymonkeyTable::SurveyQuestions => {
                self.read_details(table, options).await?
            }
            SurveymonkeyTable::SurveyRollups => {
                let surveys = self.target_surveys(options).await?;
                self.fan_out_surveys(surveys, "rollups", &per_page).await?
            }
            SurveymonkeyTable::Users => self.read_me().await?.into_iter().collect(),
            SurveymonkeyTable::GroupMembers => self.read_group_members(options).await?,
            _ => match table.account_listing() {
                Some((path, requirement)) => self.list(path, &per_page, UNCAPPED, requirement).await?,
                None => Vec::new(),
            },
        };
        Ok(ReadBatch::new(records, Offset::empty()))
    }

    /// Pages or questions flattened out of `/surveys/{id}/details`.
    async fn read_details(
        &self,
        table: SurveymonkeyTable,
        options: &ReadOptions,
    ) -> Result<Vec<Record>, ConnectorError> {
        let surveys = self.target_surveys(options).await?;
        let nested = pool::fetch_all(surveys, pool::DEFAULT_WIDTH, |survey_id: String| async move {
            let path = format!("/surveys/{survey_id}/details");
            let Some(details) = self.api.get_json(&path, &[], Requirement::Optional).await? else {
                return Ok(None);
            };
            let pages = details
                .get("pages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let records = into_records(&self.api.url(&path), pages)?;
            Ok(Some(match table {
                SurveymonkeyTable::SurveyQuestions => questions_of(&survey_id, records),
                _ => pages_of(&survey_id, records),
            }))
        })
        .await?;
        Ok(nested.into_iter().flatten().collect())
    }

    async fn read_me(&self) -> Result<Option<Record>, ConnectorError> {
        let url = self.api.url("/users/me");
        match self.api.get_json("/users/me", &[], Requirement::Required).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(into_records(&url, vec![value])?.pop().map(clean_record)),
        }
    }

    async fn read_group_members(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let per_page = [("per_page", options.per_page.to_string())];
        let groups = match &options.group_id {
            Some(id) => vec![id.clone()],
            None => ids_of(&self.list("/groups", &per_page, UNCAPPED, Requirement::Optional).await?),
        };
        let per_page = &per_page;
        let nested = pool::fetch_all(groups, pool::DEFAULT_WIDTH, |group_id: String| async move {
            let path = format!("/groups/{group_id}/members");
            let records = self.list(&path, per_page, UNCAPPED, Requirement::Optional).await?;
            Ok(Some(stamp_all(records, "group_id", &group_id)))
        })
        .await?;
        Ok(nested.into_iter().flatten().collect())
    }
}

fn ids_of(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| str_field(record, "id"))
        .map(str::to_owned)
        .collect()
}

/// Sets `field` on records that do not carry it already.
fn stamp_all(records: Vec<Record>, field: &str, value: &str) -> Vec<Record> {
    records
        .into_iter()
        .map(|mut record| {
            if record.get(field).map_or(true, Value::is_null) {
                record.insert(field.to_owned(), Value::from(value));
            }
            record
        })
        .collect()
}

fn pages_of(survey_id: &str, pages: Vec<Record>) -> Vec<Record> {
    let pages = pages
        .into_iter()
        .map(|mut page| {
            page.remove("questions");
            clean_record(page)
        })
        .collect();
    stamp_all(pages, "survey_id", survey_id)
}

fn questions_of(survey_id: &str, pages: Vec<Record>) -> Vec<Record> {
    let mut questions = Vec::new();
    for page in pages {
        let page_id = page.get("id").cloned().unwrap_or(Value::Null);
        let Some(Value::Array(items)) = page.get("questions") else {
            continue;
        };
        for item in items {
            let Value::Object(question) = item else { continue };
            let mut question = clean_record(question.clone());
            question.insert(String::from("page_id"), page_id.clone());
            questions.push(question);
        }
    }
    stamp_all(questions, "survey_id", survey_id)
}

/// Empty objects become null, recursively.
fn clean_record(record: Record) -> Record {
    record
        .into_iter()
        .map(|(key, value)| (key, clean_value(value)))
        .collect()
}

fn clean_value(value: Value) -> Value {
    match value {
        Value::Object(map) if map.is_empty() => Value::Null,
        Value::Object(map) => Value::Object(clean_record(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_value).collect()),
        other => other,
    }
}

#[async_trait]
impl Connector for SurveymonkeyConnector {
    fn name(&self) -> &'static str {
        "surveymonkey"
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
            IngestionMode::Cdc => self.read_modified(kind, descriptor, offset, &read_options).await,
            _ => self.read_snapshot(kind, &read_options).await,
        }
        .map_err(|error| error.in_table(table))?;

        tracing::info!(connector = "surveymonkey", table, records = batch.len(), offset = %batch.offset, "read completed");
        Ok(batch)
    }
}
