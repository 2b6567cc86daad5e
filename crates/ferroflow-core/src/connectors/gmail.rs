//! Gmail API v1 connector.
//!
//! Messages and threads are `cdc_with_deletes` on `historyId`. The first read
//! lists ids and fetches details through multipart batch calls; later reads
//! walk the history feed from the stored id. An expired history id (404)
//! falls back to a full listing. Everything else is a snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::Duration;

use crate::batch::{execute_batched, BatchItem, MultipartBatch};
use crate::config::HttpSettings;
use crate::connector::{unsupported_deletes, Connector, ReadBatch, Record};
use crate::connectors::{google_credentials, into_records, str_field};
use crate::dispatch::{TableCatalog, TableKind};
use crate::error::{ConfigError, ConnectorError};
use crate::http_client::{append_query, HttpClient};
use crate::offset::{CursorProtocol, CursorTracker, Offset, ResumeState};
use crate::options::{OptionMap, TableOptions};
use crate::pagination::{self, PageShape};
use crate::pool;
use crate::table::{columns, Column, ColumnType, IngestionMode, TableDescriptor, TableMetadata};
use crate::transport::{ApiClient, Requirement};

pub const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_BATCH_URL: &str = "https://gmail.googleapis.com/batch/gmail/v1";
pub const DEFAULT_USER_ID: &str = "me";
/// Offset key of the message and thread tables.
pub const HISTORY_KEY: &str = "historyId";

const BATCH_SIZE: usize = 50;
const HISTORY_PAGE_SIZE: u32 = 500;
const DEFAULT_MAX_RESULTS: u32 = 100;
const MAX_RESULTS_LIMIT: u32 = 500;

const LIST_MESSAGES: PageShape = PageShape::token("messages", "nextPageToken", "pageToken");
const LIST_THREADS: PageShape = PageShape::token("threads", "nextPageToken", "pageToken");
const LIST_DRAFTS: PageShape = PageShape::token("drafts", "nextPageToken", "pageToken");
const LIST_HISTORY: PageShape = PageShape::token("history", "nextPageToken", "pageToken");

const SETTINGS_SECTIONS: [(&str, &str); 5] = [
    ("autoForwarding", "autoForwarding"),
    ("imap", "imap"),
    ("pop", "pop"),
    ("language", "language"),
    ("vacation", "vacation"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmailTable {
    Messages,
    Threads,
    Labels,
    Drafts,
    Profile,
    Settings,
    Filters,
    ForwardingAddresses,
    SendAs,
    Delegates,
}

impl TableKind for GmailTable {
    const ALL: &'static [Self] = &[
        Self::Messages,
        Self::Threads,
        Self::Labels,
        Self::Drafts,
        Self::Profile,
        Self::Settings,
        Self::Filters,
        Self::ForwardingAddresses,
        Self::SendAs,
        Self::Delegates,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Threads => "threads",
            Self::Labels => "labels",
            Self::Drafts => "drafts",
            Self::Profile => "profile",
            Self::Settings => "settings",
            Self::Filters => "filters",
            Self::ForwardingAddresses => "forwarding_addresses",
            Self::SendAs => "send_as",
            Self::Delegates => "delegates",
        }
    }
}

impl GmailTable {
    /// Collection segment under `/users/{id}/` for the change-tracked tables.
    fn collection(self) -> Option<&'static str> {
        match self {
            Self::Messages => Some("messages"),
            Self::Threads => Some("threads"),
            _ => None,
        }
    }
}

fn describe(table: GmailTable) -> Result<TableDescriptor, crate::table::DescriptorError> {
    use ColumnType::{Boolean, Json, Long, String as Text};

    let (layout, keys, mode, cursor): (Vec<(&str, ColumnType)>, Vec<&str>, IngestionMode, Option<&str>) =
        match table {
            GmailTable::Messages => (
                vec![
                    ("id", Text),
                    ("threadId", Text),
                    ("labelIds", Json),
                    ("snippet", Text),
                    ("historyId", Text),
                    ("internalDate", Text),
                    ("sizeEstimate", Long),
                    ("payload", Json),
                ],
                vec!["id"],
                IngestionMode::CdcWithDeletes,
                Some(HISTORY_KEY),
            ),
            GmailTable::Threads => (
                vec![
                    ("id", Text),
                    ("snippet", Text),
                    ("historyId", Text),
                    ("messages", Json),
                ],
                vec!["id"],
                IngestionMode::CdcWithDeletes,
                Some(HISTORY_KEY),
            ),
            GmailTable::Labels => (
                vec![
                    ("id", Text),
                    ("name", Text),
                    ("messageListVisibility", Text),
                    ("labelListVisibility", Text),
                    ("type", Text),
                    ("messagesTotal", Long),
                    ("messagesUnread", Long),
                    ("threadsTotal", Long),
                    ("threadsUnread", Long),
                    ("color", Json),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::Drafts => (
                vec![("id", Text), ("message", Json)],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::Profile => (
                vec![
                    ("emailAddress", Text),
                    ("messagesTotal", Long),
                    ("threadsTotal", Long),
                    ("historyId", Text),
                ],
                vec!["emailAddress"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::Settings => (
                vec![
                    ("emailAddress", Text),
                    ("autoForwarding", Json),
                    ("imap", Json),
                    ("pop", Json),
                    ("language", Json),
                    ("vacation", Json),
                ],
                vec!["emailAddress"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::Filters => (
                vec![("id", Text), ("criteria", Json), ("action", Json)],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::ForwardingAddresses => (
                vec![("forwardingEmail", Text), ("verificationStatus", Text)],
                vec!["forwardingEmail"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::SendAs => (
                vec![
                    ("sendAsEmail", Text),
                    ("displayName", Text),
                    ("replyToAddress", Text),
                    ("signature", Text),
                    ("isPrimary", Boolean),
                    ("isDefault", Boolean),
                    ("treatAsAlias", Boolean),
                    ("verificationStatus", Text),
                    ("smtpMsa", Json),
                ],
                vec!["sendAsEmail"],
                IngestionMode::Snapshot,
                None,
            ),
            GmailTable::Delegates => (
                vec![("delegateEmail", Text), ("verificationStatus", Text)],
                vec!["delegateEmail"],
                IngestionMode::Snapshot,
                None,
            ),
        };

    TableDescriptor::new(table.name(), columns(&layout, &keys), &keys, mode, cursor)
}

/// Connection options besides the OAuth credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailConfig {
    pub user_id: String,
    pub base_url: String,
    pub batch_url: String,
    pub http: HttpSettings,
}

impl GmailConfig {
    pub fn from_options(raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::connection(raw);
        Ok(Self {
            user_id: options.get("user_id").unwrap_or(DEFAULT_USER_ID).to_owned(),
            base_url: options.get("base_url").unwrap_or(DEFAULT_BASE_URL).to_owned(),
            batch_url: options.get("batch_url").unwrap_or(DEFAULT_BATCH_URL).to_owned(),
            http: HttpSettings::from_options(raw)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadOptions {
    max_results: u32,
    query: Option<String>,
    label_ids: Vec<String>,
    include_spam_trash: bool,
    format: String,
}

impl ReadOptions {
    fn parse(table: GmailTable, raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::new(table.name(), raw);
        Ok(Self {
            max_results: options
                .parse_or("maxResults", DEFAULT_MAX_RESULTS)?
                .clamp(1, MAX_RESULTS_LIMIT),
            query: options.get("q").map(str::to_owned),
            label_ids: options.list("labelIds")?,
            include_spam_trash: options.flag("includeSpamTrash", false)?,
            format: options.get("format").unwrap_or("full").to_owned(),
        })
    }

    fn list_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("maxResults", self.max_results.to_string())];
        if let Some(q) = &self.query {
            query.push(("q", q.clone()));
        }
        for label in &self.label_ids {
            query.push(("labelIds", label.clone()));
        }
        if self.include_spam_trash {
            query.push(("includeSpamTrash", String::from("true")));
        }
        query
    }
}

/// One walk of the history feed.
#[derive(Debug, Default)]
struct HistoryWalk {
    /// `historyId` of the last page, the newest point the walk reached.
    latest: Option<String>,
    entries: Vec<Value>,
}

pub struct GmailConnector {
    api: ApiClient,
    batch: MultipartBatch,
    user_id: String,
    catalog: TableCatalog<GmailTable>,
}

impl GmailConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, options: &OptionMap) -> Result<Self, ConnectorError> {
        let config = GmailConfig::from_options(options)?;
        let credentials = google_credentials(options, http_client.clone())?;
        let api = ApiClient::new(http_client, Arc::new(credentials), &config.base_url)
            .with_settings(&config.http);
        Ok(Self {
            api,
            batch: MultipartBatch::new(config.batch_url, BATCH_SIZE),
            user_id: config.user_id,
            catalog: TableCatalog::build(describe)?,
        })
    }

    fn user_path(&self, suffix: &str) -> String {
        format!("/users/{}/{suffix}", self.user_id)
    }

    async fn read_changes(
        &self,
        table: GmailTable,
        descriptor: &TableDescriptor,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let Some(collection) = table.collection() else {
            return Ok(ReadBatch::empty(Offset::empty()));
        };

        let (ids, latest) = match ResumeState::from_offset(offset, HISTORY_KEY) {
            ResumeState::Initial => (self.list_ids(table, options).await?, None),
            ResumeState::Resuming(start) => match self.walk_history(start, "messageAdded").await? {
                Some(walk) => (added_ids(table, &walk.entries), walk.latest),
                None => {
                    tracing::warn!(table = table.name(), start, "history id expired, falling back to full listing");
                    (self.list_ids(table, options).await?, None)
                }
            },
        };

        let records = self.fetch_details(collection, &ids, &options.format).await?;

        let mut tracker = CursorTracker::new();
        for record in &records {
            tracker.observe_record(record, HISTORY_KEY);
        }
        if !records.is_empty() {
            if let Some(latest) = &latest {
                tracker.observe(latest);
            }
        }

        let next = CursorProtocol::new(HISTORY_KEY, Duration::ZERO).next_offset(
            descriptor.mode,
            offset,
            &tracker,
        );
        Ok(ReadBatch::new(records, next))
    }

    async fn list_ids(
        &self,
        table: GmailTable,
        options: &ReadOptions,
    ) -> Result<Vec<String>, ConnectorError> {
        let (collection, shape) = match table {
            GmailTable::Threads => ("threads", LIST_THREADS),
            _ => ("messages", LIST_MESSAGES),
        };
        let query = options.list_query();
        let url = append_query(
            &self.api.url(&self.user_path(collection)),
            query.iter().map(|(k, v)| (*k, v.as_str())),
        );
        // Unbounded: a partial listing has no resumable position.
        let run = pagination::follow(&self.api, &url, shape, u32::MAX, Requirement::Required).await?;
        Ok(run
            .items
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .map(str::to_owned)
            .collect())
    }

    /// Walks `history` from `start`. `None` when the start id has expired.
    async fn walk_history(
        &self,
        start: &str,
        history_type: &str,
    ) -> Result<Option<HistoryWalk>, ConnectorError> {
        let first_url = append_query(
            &self.api.url(&self.user_path("history")),
            [
                ("startHistoryId", start),
                ("maxResults", &HISTORY_PAGE_SIZE.to_string()),
                ("historyTypes", history_type),
            ],
        );

        let mut walk = HistoryWalk::default();
        let mut next = Some(first_url.clone());
        let mut first = true;
        while let Some(url) = next.take() {
            let page = pagination::fetch_page(&self.api, &url, &first_url, LIST_HISTORY, Requirement::Optional).await?;
            let Some(page) = page else {
                if first {
                    return Ok(None);
                }
                break;
            };
            first = false;
            if let Some(latest) = page.body.get(HISTORY_KEY).and_then(history_id) {
                walk.latest = Some(latest);
            }
            walk.entries.extend(page.items);
            next = page.next;
        }
        Ok(Some(walk))
    }

    async fn fetch_details(
        &self,
        collection: &str,
        ids: &[String],
        format: &str,
    ) -> Result<Vec<Record>, ConnectorError> {
        let items = ids
            .iter()
            .map(|id| {
                let url = append_query(
                    &self.api.url(&self.user_path(&format!("{collection}/{id}"))),
                    [("format", format)],
                );
                BatchItem::new(id.as_str(), url)
            })
            .collect::<Vec<_>>();

        let outcomes = execute_batched(&self.api, &self.batch, &items, pool::DEFAULT_WIDTH).await?;
        let endpoint = self.api.url(&self.user_path(collection));
        into_records(&endpoint, outcomes.into_iter().map(|outcome| outcome.body).collect())
    }

    async fn read_deleted(
        &self,
        table: GmailTable,
        offset: Option<&Offset>,
    ) -> Result<ReadBatch, ConnectorError> {
        let Some(start) = ResumeState::from_offset(offset, HISTORY_KEY).cursor() else {
            return Ok(ReadBatch::empty(Offset::empty()));
        };
        let Some(walk) = self.walk_history(start, "messageDeleted").await? else {
            tracing::warn!(table = table.name(), start, "history id expired, no deletions reported");
            return Ok(ReadBatch::empty(Offset::single(HISTORY_KEY, start)));
        };

        let latest = walk.latest.clone().unwrap_or_else(|| start.to_owned());
        let records = deleted_records(table, &walk.entries, &latest);
        Ok(ReadBatch::new(records, Offset::single(HISTORY_KEY, latest)))
    }

    async fn read_snapshot(
        &self,
        table: GmailTable,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let records = match table {
            GmailTable::Labels => self.read_labels().await?,
            GmailTable::Drafts => self.read_drafts(options).await?,
            GmailTable::Profile => self.read_object("profile").await?.into_iter().collect(),
            GmailTable::Settings => vec![self.read_settings().await?],
            GmailTable::Filters => self.read_list("settings/filters", "filter", Requirement::Required).await?,
            GmailTable::ForwardingAddresses => {
                self.read_list("settings/forwardingAddresses", "forwardingAddresses", Requirement::Optional)
                    .await?
            }
            GmailTable::SendAs => self.read_list("settings/sendAs", "sendAs", Requirement::Required).await?,
            GmailTable::Delegates => {
                self.read_list("settings/delegates", "delegates", Requirement::Optional).await?
            }
            GmailTable::Messages | GmailTable::Threads => Vec::new(),
        };
        Ok(ReadBatch::new(records, Offset::empty()))
    }

    async fn read_object(&self, suffix: &str) -> Result<Option<Record>, ConnectorError> {
        let path = self.user_path(suffix);
        let url = self.api.url(&path);
        match self.api.get_json(&path, &[], Requirement::Optional).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(into_records(&url, vec![value])?.pop()),
        }
    }

    async fn read_list(
        &self,
        suffix: &str,
        key: &str,
        requirement: Requirement,
    ) -> Result<Vec<Record>, ConnectorError> {
        let path = self.user_path(suffix);
        let url = self.api.url(&path);
        let Some(body) = self.api.get_json(&path, &[], requirement).await? else {
            return Ok(Vec::new());
        };
        let items = crate::transport::expect_items(&url, &body, key)?;
        into_records(&url, items)
    }

    async fn read_labels(&self) -> Result<Vec<Record>, ConnectorError> {
        let summaries = self.read_list("labels", "labels", Requirement::Required).await?;
        pool::fetch_all(summaries, pool::DEFAULT_WIDTH, |summary| async move {
            let Some(id) = str_field(&summary, "id").map(str::to_owned) else {
                return Ok(Some(summary));
            };
            let detail = self.read_object(&format!("labels/{id}")).await?;
            Ok(Some(detail.unwrap_or(summary)))
        })
        .await
    }

    async fn read_drafts(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let url = append_query(
            &self.api.url(&self.user_path("drafts")),
            [("maxResults", options.max_results.to_string())],
        );
        let run = pagination::follow(&self.api, &url, LIST_DRAFTS, u32::MAX, Requirement::Required).await?;
        let ids = run
            .items
            .iter()
            .filter_map(|draft| draft.get("id").and_then(Value::as_str))
            .map(str::to_owned)
            .collect::<Vec<_>>();

        let format = options.format.as_str();
        pool::fetch_all(ids, pool::DEFAULT_WIDTH, |id| async move {
            let path = self.user_path(&format!("drafts/{id}"));
            let url = self.api.url(&path);
            let query = [("format", format.to_owned())];
            match self.api.get_json(&path, &query, Requirement::Optional).await? {
                Some(Value::Null) | None => Ok(None),
                Some(detail) => Ok(into_records(&url, vec![detail])?.pop()),
            }
        })
        .await
    }

    async fn read_settings(&self) -> Result<Record, ConnectorError> {
        let items = SETTINGS_SECTIONS
            .iter()
            .map(|(key, segment)| {
                BatchItem::new(*key, self.api.url(&self.user_path(&format!("settings/{segment}"))))
            })
            .collect::<Vec<_>>();
        let outcomes = execute_batched(&self.api, &self.batch, &items, pool::DEFAULT_WIDTH).await?;

        let email = self
            .read_object("profile")
            .await?
            .and_then(|profile| str_field(&profile, "emailAddress").map(str::to_owned))
            .unwrap_or_else(|| self.user_id.clone());

        let mut record = Map::new();
        record.insert(String::from("emailAddress"), Value::from(email));
        for (key, _) in SETTINGS_SECTIONS {
            let section = outcomes
                .iter()
                .find(|outcome| outcome.key == key)
                .map(|outcome| outcome.body.clone())
                .unwrap_or(Value::Null);
            record.insert(key.to_owned(), section);
        }
        Ok(record)
    }
}

/// History ids arrive as strings but are accepted as numbers too.
fn history_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Ids of added messages (or their threads), first occurrence order.
fn added_ids(table: GmailTable, entries: &[Value]) -> Vec<String> {
    let field = match table {
        GmailTable::Threads => "threadId",
        _ => "id",
    };
    let mut seen = BTreeSet::new();
    entries
        .iter()
        .filter_map(|entry| entry.get("messagesAdded").and_then(Value::as_array))
        .flatten()
        .filter_map(|added| added.get("message")?.get(field)?.as_str())
        .filter(|id| seen.insert((*id).to_owned()))
        .map(str::to_owned)
        .collect()
}

fn deleted_records(table: GmailTable, entries: &[Value], latest: &str) -> Vec<Record> {
    let mut seen = BTreeSet::new();
    let mut records = Vec::new();
    for entry in entries {
        let entry_id = entry
            .get("id")
            .and_then(history_id)
            .unwrap_or_else(|| latest.to_owned());
        let Some(deleted) = entry.get("messagesDeleted").and_then(Value::as_array) else {
            continue;
        };
        for message in deleted.iter().filter_map(|deleted| deleted.get("message")) {
            let id = message.get("id").and_then(Value::as_str);
            let thread_id = message.get("threadId").and_then(Value::as_str);
            let mut record = Map::new();
            match table {
                GmailTable::Threads => {
                    let Some(thread_id) = thread_id else { continue };
                    if !seen.insert(thread_id.to_owned()) {
                        continue;
                    }
                    record.insert(String::from("id"), Value::from(thread_id));
                }
                _ => {
                    let Some(id) = id else { continue };
                    if !seen.insert(id.to_owned()) {
                        continue;
                    }
                    record.insert(String::from("id"), Value::from(id));
                    record.insert(
                        String::from("threadId"),
                        thread_id.map(Value::from).unwrap_or(Value::Null),
                    );
                }
            }
            record.insert(String::from(HISTORY_KEY), Value::from(entry_id.as_str()));
            records.push(record);
        }
    }
    records
}

#[async_trait]
impl Connector for GmailConnector {
    fn name(&self) -> &'static str {
        "gmail"
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

        let batch = match kind {
            GmailTable::Messages | GmailTable::Threads => {
                self.read_changes(kind, descriptor, offset, &read_options).await
            }
            _ => self.read_snapshot(kind, &read_options).await,
        }
        .map_err(|error| error.in_table(table))?;

        tracing::info!(connector = "gmail", table, records = batch.len(), offset = %batch.offset, "read completed");
        Ok(batch)
    }

    async fn read_table_deletes(
        &self,
        table: &str,
        offset: Option<&Offset>,
        _options: &OptionMap,
    ) -> Result<ReadBatch, ConnectorError> {
        let (kind, descriptor) = self.catalog.resolve(table)?;
        let batch = match descriptor.mode {
            IngestionMode::CdcWithDeletes => self
                .read_deleted(kind, offset)
                .await
                .map_err(|error| error.in_table(table))?,
            // Snapshot tables have no deletions to report.
            IngestionMode::Snapshot => ReadBatch::empty(Offset::empty()),
            mode => return Err(unsupported_deletes(table, mode)),
        };

        tracing::info!(connector = "gmail", table, deleted = batch.len(), offset = %batch.offset, "deletes read");
        Ok(batch)
    }
}
