//! GitHub REST v3 connector.
//!
//! Mutable entities (issues, pull requests, comments) are read in `cdc` mode
//! on `updated_at`. Issues and comments are sorted ascending with a
//! server-side `since`, so a page cap always leaves a resumable prefix. The
//! pulls listing has no `since`; it is walked newest first down to the lower
//! bound, and a capped walk stores its next page in the offset. Commits and
//! reviews are `append`; everything else is a snapshot read in full.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

use crate::auth::StaticCredential;
use crate::config::HttpSettings;
use crate::connector::{Connector, ReadBatch, Record};
use crate::connectors::{instant_field, into_records, pick, str_field};
use crate::dispatch::{TableCatalog, TableKind};
use crate::error::{ConfigError, ConnectorError};
use crate::http_client::{append_query, HttpClient};
use crate::offset::{format_timestamp, parse_instant, CursorProtocol, CursorTracker, Offset, ResumeState};
use crate::options::{OptionMap, TableOptions};
use crate::pagination::{self, PageRun, PageShape};
use crate::pool;
use crate::retry::{ResetEncoding, ResetHeader};
use crate::table::{columns, Column, ColumnType, IngestionMode, TableDescriptor, TableMetadata};
use crate::transport::{ApiClient, Requirement};

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";
/// Offset key shared by every incremental GitHub table.
pub const CURSOR_KEY: &str = "cursor";
const UNTIL_KEY: &str = "until";
const HIGH_WATER_KEY: &str = "high_water";
const NEXT_PAGE_KEY: &str = "next_page";

const DEFAULT_PER_PAGE: u32 = 100;
const DEFAULT_MAX_PAGES: u32 = 50;
const DEFAULT_LOOKBACK_SECONDS: i64 = 300;
/// Page budget of listings that have no offset to resume from.
const UNCAPPED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GithubTable {
    Issues,
    PullRequests,
    Comments,
    Commits,
    Reviews,
    Repositories,
    Branches,
    Assignees,
    Collaborators,
    Organizations,
    Teams,
    Users,
}

impl TableKind for GithubTable {
    const ALL: &'static [Self] = &[
        Self::Issues,
        Self::Repositories,
        Self::PullRequests,
        Self::Comments,
        Self::Commits,
        Self::Assignees,
        Self::Branches,
        Self::Collaborators,
        Self::Organizations,
        Self::Teams,
        Self::Users,
        Self::Reviews,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Issues => "issues",
            Self::PullRequests => "pull_requests",
            Self::Comments => "comments",
            Self::Commits => "commits",
            Self::Reviews => "reviews",
            Self::Repositories => "repositories",
            Self::Branches => "branches",
            Self::Assignees => "assignees",
            Self::Collaborators => "collaborators",
            Self::Organizations => "organizations",
            Self::Teams => "teams",
            Self::Users => "users",
        }
    }
}

impl GithubTable {
    fn needs_repository(self) -> bool {
        matches!(
            self,
            Self::Issues
                | Self::PullRequests
                | Self::Comments
                | Self::Commits
                | Self::Reviews
                | Self::Branches
                | Self::Assignees
                | Self::Collaborators
        )
    }
}

fn describe(table: GithubTable) -> Result<TableDescriptor, crate::table::DescriptorError> {
    use ColumnType::{Boolean, Json, Long, String as Text, Timestamp};

    let repo_keys = ["repository_owner", "repository_name"];
    let (layout, keys, mode, cursor): (Vec<(&str, ColumnType)>, Vec<&str>, IngestionMode, Option<&str>) =
        match table {
            GithubTable::Issues => (
                vec![
                    ("id", Long),
                    ("node_id", Text),
                    ("number", Long),
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("title", Text),
                    ("body", Text),
                    ("state", Text),
                    ("state_reason", Text),
                    ("locked", Boolean),
                    ("comments", Long),
                    ("created_at", Timestamp),
                    ("updated_at", Timestamp),
                    ("closed_at", Timestamp),
                    ("author_association", Text),
                    ("url", Text),
                    ("html_url", Text),
                    ("user", Json),
                    ("assignee", Json),
                    ("assignees", Json),
                    ("labels", Json),
                    ("milestone", Json),
                    ("pull_request", Json),
                    ("reactions", Json),
                ],
                vec!["id"],
                IngestionMode::Cdc,
                Some("updated_at"),
            ),
            GithubTable::PullRequests => (
                vec![
                    ("id", Long),
                    ("node_id", Text),
                    ("number", Long),
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("state", Text),
                    ("title", Text),
                    ("body", Text),
                    ("draft", Boolean),
                    ("created_at", Timestamp),
                    ("updated_at", Timestamp),
                    ("closed_at", Timestamp),
                    ("merged_at", Timestamp),
                    ("merge_commit_sha", Text),
                    ("user", Json),
                    ("base", Json),
                    ("head", Json),
                    ("html_url", Text),
                    ("url", Text),
                ],
                vec!["id"],
                IngestionMode::Cdc,
                Some("updated_at"),
            ),
            GithubTable::Comments => (
                vec![
                    ("id", Long),
                    ("node_id", Text),
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("issue_url", Text),
                    ("html_url", Text),
                    ("body", Text),
                    ("user", Json),
                    ("created_at", Timestamp),
                    ("updated_at", Timestamp),
                    ("author_association", Text),
                ],
                vec!["id"],
                IngestionMode::Cdc,
                Some("updated_at"),
            ),
            GithubTable::Commits => (
                vec![
                    ("sha", Text),
                    ("node_id", Text),
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("commit_message", Text),
                    ("commit_author_name", Text),
                    ("commit_author_email", Text),
                    ("commit_author_date", Timestamp),
                    ("commit_committer_name", Text),
                    ("commit_committer_email", Text),
                    ("commit_committer_date", Timestamp),
                    ("html_url", Text),
                    ("url", Text),
                    ("author", Json),
                    ("committer", Json),
                ],
                vec!["sha"],
                IngestionMode::Append,
                None,
            ),
            GithubTable::Reviews => (
                vec![
                    ("id", Long),
                    ("node_id", Text),
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("pull_number", Long),
                    ("state", Text),
                    ("body", Text),
                    ("user", Json),
                    ("commit_id", Text),
                    ("submitted_at", Timestamp),
                    ("html_url", Text),
                ],
                vec!["id"],
                IngestionMode::Append,
                None,
            ),
            GithubTable::Repositories => (
                vec![
                    ("id", Long),
                    ("node_id", Text),
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("name", Text),
                    ("full_name", Text),
                    ("owner", Json),
                    ("private", Boolean),
                    ("description", Text),
                    ("fork", Boolean),
                    ("html_url", Text),
                    ("url", Text),
                    ("clone_url", Text),
                    ("homepage", Text),
                    ("language", Text),
                    ("forks_count", Long),
                    ("stargazers_count", Long),
                    ("watchers_count", Long),
                    ("open_issues_count", Long),
                    ("size", Long),
                    ("default_branch", Text),
                    ("topics", Json),
                    ("archived", Boolean),
                    ("disabled", Boolean),
                    ("visibility", Text),
                    ("pushed_at", Timestamp),
                    ("created_at", Timestamp),
                    ("updated_at", Timestamp),
                    ("permissions", Json),
                    ("license", Json),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            GithubTable::Branches => (
                vec![
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("name", Text),
                    ("commit", Json),
                    ("protected", Boolean),
                    ("protection_url", Text),
                ],
                vec![repo_keys[0], repo_keys[1], "name"],
                IngestionMode::Snapshot,
                None,
            ),
            GithubTable::Assignees | GithubTable::Collaborators => {
                let mut layout = vec![
                    ("repository_owner", Text),
                    ("repository_name", Text),
                    ("login", Text),
                    ("id", Long),
                    ("node_id", Text),
                    ("type", Text),
                    ("site_admin", Boolean),
                ];
                if table == GithubTable::Collaborators {
                    layout.push(("permissions", Json));
                }
                (
                    layout,
                    vec![repo_keys[0], repo_keys[1], "id"],
                    IngestionMode::Snapshot,
                    None,
                )
            }
            GithubTable::Organizations => (
                vec![
                    ("id", Long),
                    ("login", Text),
                    ("node_id", Text),
                    ("url", Text),
                    ("repos_url", Text),
                    ("events_url", Text),
                    ("hooks_url", Text),
                    ("issues_url", Text),
                    ("members_url", Text),
                    ("public_members_url", Text),
                    ("avatar_url", Text),
                    ("description", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            GithubTable::Teams => (
                vec![
                    ("id", Long),
                    ("node_id", Text),
                    ("organization_login", Text),
                    ("name", Text),
                    ("slug", Text),
                    ("description", Text),
                    ("privacy", Text),
                    ("permission", Text),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
            GithubTable::Users => (
                vec![
                    ("id", Long),
                    ("login", Text),
                    ("node_id", Text),
                    ("type", Text),
                    ("site_admin", Boolean),
                    ("name", Text),
                    ("company", Text),
                    ("blog", Text),
                    ("location", Text),
                    ("email", Text),
                    ("created_at", Timestamp),
                    ("updated_at", Timestamp),
                ],
                vec!["id"],
                IngestionMode::Snapshot,
                None,
            ),
        };

    TableDescriptor::new(table.name(), columns(&layout, &keys), &keys, mode, cursor)
}

/// Connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubConfig {
    pub token: Option<String>,
    pub base_url: String,
    pub http: HttpSettings,
}

impl GithubConfig {
    pub fn from_options(raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::connection(raw);
        Ok(Self {
            token: options.get("token").map(str::to_owned),
            base_url: options.get("base_url").unwrap_or(DEFAULT_BASE_URL).to_owned(),
            http: HttpSettings::from_options(raw)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Repository {
    owner: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Account {
    User(String),
    Org(String),
}

/// Table options after validation.
#[derive(Debug, Clone, PartialEq)]
struct ReadOptions {
    table: GithubTable,
    repository: Option<Repository>,
    account: Option<Account>,
    per_page: u32,
    max_pages: u32,
    lookback: Duration,
    start_date: Option<OffsetDateTime>,
    state: String,
    pull_number: Option<u64>,
}

impl ReadOptions {
    fn parse(table: GithubTable, raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::new(table.name(), raw);

        let repository = if table.needs_repository() {
            let values = options.require_all(&["owner", "repo"])?;
            Some(Repository {
                owner: values[0].to_owned(),
                name: values[1].to_owned(),
            })
        } else {
            None
        };

        let account = if table == GithubTable::Repositories {
            match (options.get("owner"), options.get("org")) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::ConflictingOptions {
                        table: table.name().to_owned(),
                        message: String::from("specify only one of 'owner' and 'org'"),
                    })
                }
                (Some(owner), None) => Some(Account::User(owner.to_owned())),
                (None, Some(org)) => Some(Account::Org(org.to_owned())),
                (None, None) => {
                    return Err(ConfigError::MissingOptions {
                        table: table.name().to_owned(),
                        options: String::from("'owner' (username) or 'org' (organization login)"),
                    })
                }
            }
        } else {
            None
        };

        Ok(Self {
            table,
            repository,
            account,
            per_page: options
                .parse_or("per_page", DEFAULT_PER_PAGE)?
                .clamp(1, 100),
            max_pages: options
                .parse_or("max_pages_per_batch", DEFAULT_MAX_PAGES)?
                .max(1),
            lookback: Duration::seconds(
                options.parse_or("lookback_seconds", DEFAULT_LOOKBACK_SECONDS)?,
            ),
            start_date: options.instant("start_date")?,
            state: options.get("state").unwrap_or("all").to_owned(),
            pull_number: options.parse("pull_number")?,
        })
    }

    fn repository(&self) -> Result<&Repository, ConfigError> {
        self.repository
            .as_ref()
            .ok_or_else(|| ConfigError::missing_options(self.table.name(), &["owner", "repo"]))
    }

    /// Lower bound for incremental tables: stored cursor, else `start_date`.
    fn lower_bound(&self, offset: Option<&Offset>) -> Option<String> {
        match ResumeState::from_offset(offset, CURSOR_KEY) {
            ResumeState::Resuming(cursor) => Some(cursor.to_owned()),
            ResumeState::Initial => self.start_date.map(format_timestamp),
        }
    }
}

pub struct GithubConnector {
    api: ApiClient,
    catalog: TableCatalog<GithubTable>,
}

impl GithubConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, options: &OptionMap) -> Result<Self, ConnectorError> {
        let config = GithubConfig::from_options(options)?;
        let credentials = match &config.token {
            Some(token) => StaticCredential::bearer(token.clone()),
            None => StaticCredential::anonymous(),
        };
        let api = ApiClient::new(http_client, Arc::new(credentials), &config.base_url)
            .with_settings(&config.http)
            .with_reset_header(ResetHeader::new(
                "x-ratelimit-reset",
                ResetEncoding::EpochSeconds,
            ))
            .with_header("accept", "application/vnd.github+json");
        Ok(Self {
            api,
            catalog: TableCatalog::build(describe)?,
        })
    }

    fn listing_url(&self, path: &str, query: &[(&str, String)]) -> String {
        append_query(&self.api.url(path), query.iter().map(|(k, v)| (*k, v.as_str())))
    }

    async fn list(
        &self,
        path: &str,
        query: &[(&str, String)],
        max_pages: u32,
        requirement: Requirement,
    ) -> Result<(PageRun, Vec<Record>), ConnectorError> {
        let url = self.listing_url(path, query);
        let mut run = pagination::follow(
            &self.api,
            &url,
            PageShape::LINK_HEADER_ARRAY,
            max_pages,
            requirement,
        )
        .await?;
        let records = into_records(&url, std::mem::take(&mut run.items))?;
        Ok((run, records))
    }

    async fn read_updated(
        &self,
        table: GithubTable,
        descriptor: &TableDescriptor,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let repo = options.repository()?;
        let path = match table {
            GithubTable::Issues => format!("/repos/{}/{}/issues", repo.owner, repo.name),
            _ => format!("/repos/{}/{}/issues/comments", repo.owner, repo.name),
        };

        let mut query = vec![("per_page", options.per_page.to_string())];
        if table == GithubTable::Issues {
            query.push(("state", options.state.clone()));
        }
        query.push(("sort", String::from("updated")));
        query.push(("direction", String::from("asc")));
        if let Some(since) = options.lower_bound(offset) {
            query.push(("since", since));
        }

        let (run, mut records) = self.list(&path, &query, options.max_pages, Requirement::Required).await?;
        let mut tracker = CursorTracker::new();
        for record in &mut records {
            stamp_repository(record, repo);
            tracker.observe_record(record, "updated_at");
        }

        let protocol = CursorProtocol::new(CURSOR_KEY, options.lookback);
        let next = protocol.next_offset(descriptor.mode, offset, &tracker);
        tracing::debug!(table = table.name(), pages = run.pages, truncated = run.truncated(), "github pages read");
        Ok(ReadBatch::new(records, next))
    }

    fn pulls_url(&self, repo: &Repository, options: &ReadOptions) -> String {
        let path = format!("/repos/{}/{}/pulls", repo.owner, repo.name);
        let query = [
            ("state", options.state.clone()),
            ("sort", String::from("updated")),
            ("direction", String::from("desc")),
            ("per_page", options.per_page.to_string()),
        ];
        self.listing_url(&path, &query)
    }

    /// Walks a newest-first listing from `start_url` until a record updated
    /// before `lower` shows up, the listing ends, or `max_pages` pages were
    /// read. Records older than `lower` are dropped.
    async fn walk_newest_first(
        &self,
        start_url: &str,
        lower: Option<OffsetDateTime>,
        max_pages: u32,
    ) -> Result<NewestFirst, ConnectorError> {
        let mut walk = NewestFirst::default();
        let mut next = Some(start_url.to_owned());
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages >= max_pages {
                walk.next_page = Some(url);
                break;
            }
            let page = pagination::fetch_page(
                &self.api,
                &url,
                start_url,
                PageShape::LINK_HEADER_ARRAY,
                Requirement::Required,
            )
            .await?;
            let Some(page) = page else {
                break;
            };
            pages += 1;

            let mut reached_lower = false;
            for record in into_records(&url, page.items)? {
                let older = match (lower, instant_field(&record, "updated_at")) {
                    (Some(lower), Some(updated)) => updated < lower,
                    _ => false,
                };
                if older {
                    reached_lower = true;
                } else {
                    walk.records.push(record);
                }
            }
            if reached_lower {
                break;
            }
            next = page.next;
        }

        tracing::debug!(endpoint = %start_url, pages, capped = walk.next_page.is_some(), "newest-first walk done");
        Ok(walk)
    }

    async fn read_pull_requests(
        &self,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let repo = options.repository()?;
        let resume = PullResume::from_offset(offset);
        let lower = resume
            .cursor
            .as_deref()
            .and_then(parse_instant)
            .or(options.start_date);
        let start_url = match &resume.next_page {
            Some(url) => url.clone(),
            None => self.pulls_url(repo, options),
        };

        let walk = self.walk_newest_first(&start_url, lower, options.max_pages).await?;

        let mut tracker = CursorTracker::new();
        if let Some(high_water) = &resume.high_water {
            tracker.observe(high_water);
        }
        let mut records = walk.records;
        for record in &mut records {
            stamp_repository(record, repo);
            tracker.observe_record(record, "updated_at");
        }

        // A capped walk keeps its lower bound and resumes on the next page;
        // the cursor only moves once the walk reached the bound.
        let next = match walk.next_page {
            Some(next_page) => resume.continued(next_page, tracker.max_raw()),
            None => CursorProtocol::new(CURSOR_KEY, options.lookback)
                .advance(&tracker)
                .unwrap_or_else(|| resume.settled()),
        };
        Ok(ReadBatch::new(records, next))
    }

    async fn read_commits(
        &self,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let repo = options.repository()?;
        let resume = CommitResume::from_offset(offset);
        let since = resume
            .cursor
            .as_deref()
            .and_then(parse_instant)
            .map(|cursor| cursor + Duration::seconds(1))
            .or(options.start_date);

        let mut query = vec![("per_page", options.per_page.to_string())];
        if let Some(since) = since {
            query.push(("since", format_timestamp(since)));
        }
        if let Some(until) = &resume.until {
            query.push(("until", until.clone()));
        }

        let path = format!("/repos/{}/{}/commits", repo.owner, repo.name);
        let (run, raw) = self.list(&path, &query, options.max_pages, Requirement::Required).await?;

        let mut tracker = CursorTracker::new();
        let mut oldest: Option<(OffsetDateTime, String)> = None;
        let records = raw
            .iter()
            .map(|commit| {
                let record = flatten_commit(commit, repo);
                tracker.observe_record(&record, "commit_author_date");
                if let Some(date) = str_field(&record, "commit_author_date") {
                    if let Some(instant) = parse_instant(date) {
                        if oldest.as_ref().map_or(true, |(current, _)| instant < *current) {
                            oldest = Some((instant, date.to_owned()));
                        }
                    }
                }
                record
            })
            .collect::<Vec<_>>();

        if let Some(high_water) = &resume.high_water {
            tracker.observe(high_water);
        }

        // Commits arrive newest first, so a capped run resumes below the
        // oldest commit seen while remembering the newest.
        let next = match (run.truncated(), oldest) {
            (true, Some((_, oldest))) => {
                let mut next = Offset::empty()
                    .with(UNTIL_KEY, oldest)
                    .with(HIGH_WATER_KEY, tracker.max_raw().unwrap_or_default());
                if let Some(cursor) = &resume.cursor {
                    next = next.with(CURSOR_KEY, cursor.clone());
                }
                next
            }
            _ => match tracker.max_raw() {
                Some(max) if !records.is_empty() || resume.high_water.is_some() => {
                    Offset::single(CURSOR_KEY, max)
                }
                _ => CursorProtocol::new(CURSOR_KEY, Duration::ZERO).next_offset(
                    IngestionMode::Append,
                    offset,
                    &tracker,
                ),
            },
        };

        Ok(ReadBatch::new(records, next))
    }

    async fn read_reviews(
        &self,
        offset: Option<&Offset>,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let repo = options.repository()?;
        let lower = options.lower_bound(offset).as_deref().and_then(parse_instant);

        // A new review touches its pull request, so only pulls updated since
        // the cursor can carry one. Discovery and listing read every page:
        // the append cursor must not pass reviews that were never listed.
        let pull_numbers = match options.pull_number {
            Some(number) => vec![number],
            None => self
                .walk_newest_first(&self.pulls_url(repo, options), lower, UNCAPPED)
                .await?
                .records
                .iter()
                .filter_map(|pull| pull.get("number").and_then(Value::as_u64))
                .collect(),
        };

        let per_pull = pool::fetch_all(pull_numbers, pool::DEFAULT_WIDTH, |number| async move {
            let path = format!("/repos/{}/{}/pulls/{number}/reviews", repo.owner, repo.name);
            let query = [("per_page", options.per_page.to_string())];
            let (_, reviews) = self.list(&path, &query, UNCAPPED, Requirement::Required).await?;
            Ok(Some((number, reviews)))
        })
        .await?;

        let mut tracker = CursorTracker::new();
        let mut records = Vec::new();
        for (number, reviews) in per_pull {
            for mut review in reviews {
                let submitted = instant_field(&review, "submitted_at");
                if let (Some(lower), Some(submitted)) = (lower, submitted) {
                    if submitted <= lower {
                        continue;
                    }
                }
                stamp_repository(&mut review, repo);
                review.insert(String::from("pull_number"), Value::from(number));
                tracker.observe_record(&review, "submitted_at");
                records.push(review);
            }
        }

        let next = CursorProtocol::new(CURSOR_KEY, Duration::ZERO).next_offset(
            IngestionMode::Append,
            offset,
            &tracker,
        );
        Ok(ReadBatch::new(records, next))
    }

    async fn read_snapshot(
        &self,
        table: GithubTable,
        options: &ReadOptions,
    ) -> Result<ReadBatch, ConnectorError> {
        let per_page = [("per_page", options.per_page.to_string())];
        let records = match table {
            GithubTable::Repositories => {
                let path = match &options.account {
                    Some(Account::Org(org)) => format!("/orgs/{org}/repos"),
                    Some(Account::User(owner)) => format!("/users/{owner}/repos"),
                    None => return Err(ConfigError::missing_options(table.name(), &["owner", "org"]).into()),
                };
                let (_, raw) = self.list(&path, &per_page, UNCAPPED, Requirement::Required).await?;
                raw.into_iter()
                    .map(|mut record| {
                        let owner = record
                            .get("owner")
                            .and_then(|owner| owner.get("login"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let name = record.get("name").cloned().unwrap_or(Value::Null);
                        record.insert(String::from("repository_owner"), owner);
                        record.insert(String::from("repository_name"), name);
                        record
                    })
                    .collect()
            }
            GithubTable::Branches | GithubTable::Assignees | GithubTable::Collaborators => {
                let repo = options.repository()?;
                let (suffix, fields, requirement): (&str, &[&str], Requirement) = match table {
                    GithubTable::Branches => (
                        "branches",
                        &["name", "commit", "protected", "protection_url"],
                        Requirement::Required,
                    ),
                    GithubTable::Assignees => (
                        "assignees",
                        &["login", "id", "node_id", "type", "site_admin"],
                        Requirement::Required,
                    ),
                    _ => (
                        "collaborators",
                        &["login", "id", "node_id", "type", "site_admin", "permissions"],
                        Requirement::Optional,
                    ),
                };
                let path = format!("/repos/{}/{}/{suffix}", repo.owner, repo.name);
                let (_, raw) = self.list(&path, &per_page, UNCAPPED, requirement).await?;
                raw.iter()
                    .map(|item| {
                        let mut record = pick(item, fields);
                        stamp_repository(&mut record, repo);
                        record
                    })
                    .collect()
            }
            GithubTable::Organizations => {
                let (_, raw) = self.list("/user/orgs", &per_page, UNCAPPED, Requirement::Required).await?;
                raw.iter()
                    .map(|org| {
                        pick(
                            org,
                            &[
                                "id",
                                "login",
                                "node_id",
                                "url",
                                "repos_url",
                                "events_url",
                                "hooks_url",
                                "issues_url",
                                "members_url",
                                "public_members_url",
                                "avatar_url",
                                "description",
                            ],
                        )
                    })
                    .collect()
            }
            GithubTable::Teams => self.read_teams(options).await?,
            GithubTable::Users => {
                let url = self.api.url("/user");
                let user = self
                    .api
                    .get_json("/user", &[], Requirement::Required)
                    .await?
                    .unwrap_or(Value::Null);
                into_records(&url, vec![user])?
            }
            GithubTable::Issues
            | GithubTable::PullRequests
            | GithubTable::Comments
            | GithubTable::Commits
            | GithubTable::Reviews => Vec::new(),
        };

        Ok(ReadBatch::new(records, Offset::empty()))
    }

    async fn read_teams(&self, options: &ReadOptions) -> Result<Vec<Record>, ConnectorError> {
        let per_page = [("per_page", options.per_page.to_string())];
        let (_, summaries) = self.list("/user/teams", &per_page, UNCAPPED, Requirement::Required).await?;
        let teams = summaries
            .iter()
            .filter_map(|team| {
                let org = team.get("organization")?.get("login")?.as_str()?;
                let slug = str_field(team, "slug")?;
                Some((org.to_owned(), slug.to_owned()))
            })
            .collect::<Vec<_>>();

        pool::fetch_all(teams, pool::DEFAULT_WIDTH, |(org, slug)| async move {
            let path = format!("/orgs/{org}/teams/{slug}");
            let url = self.api.url(&path);
            let detail = self
                .api
                .get_json(&path, &[], Requirement::Required)
                .await?
                .unwrap_or(Value::Null);
            let mut record = into_records(&url, vec![detail])?
                .pop()
                .unwrap_or_default();
            record.insert(String::from("organization_login"), Value::from(org));
            Ok(Some(record))
        })
        .await
    }
}

/// Offset of the commits table, including the continuation of a capped run.
#[derive(Debug, Default)]
struct CommitResume {
    cursor: Option<String>,
    until: Option<String>,
    high_water: Option<String>,
}

impl CommitResume {
    fn from_offset(offset: Option<&Offset>) -> Self {
        let get = |key| offset.and_then(|offset| offset.get(key)).map(str::to_owned);
        Self {
            cursor: get(CURSOR_KEY),
            until: get(UNTIL_KEY),
            high_water: get(HIGH_WATER_KEY),
        }
    }
}

/// Records of one newest-first walk, plus the unread page when the cap
/// stopped it early.
#[derive(Debug, Default)]
struct NewestFirst {
    records: Vec<Record>,
    next_page: Option<String>,
}

/// Offset of the pull requests table: the settled cursor, plus the next page
/// and the newest value seen while a capped walk is in progress.
#[derive(Debug, Default)]
struct PullResume {
    cursor: Option<String>,
    next_page: Option<String>,
    high_water: Option<String>,
}

impl PullResume {
    fn from_offset(offset: Option<&Offset>) -> Self {
        let get = |key| offset.and_then(|offset| offset.get(key)).map(str::to_owned);
        Self {
            cursor: get(CURSOR_KEY),
            next_page: get(NEXT_PAGE_KEY),
            high_water: get(HIGH_WATER_KEY),
        }
    }

    fn continued(&self, next_page: String, high_water: Option<&str>) -> Offset {
        let mut offset = Offset::single(NEXT_PAGE_KEY, next_page);
        if let Some(high_water) = high_water {
            offset = offset.with(HIGH_WATER_KEY, high_water);
        }
        if let Some(cursor) = &self.cursor {
            offset = offset.with(CURSOR_KEY, cursor.clone());
        }
        offset
    }

    /// The settled cursor alone, once nothing newer was seen.
    fn settled(&self) -> Offset {
        self.cursor
            .as_ref()
            .map(|cursor| Offset::single(CURSOR_KEY, cursor.clone()))
            .unwrap_or_default()
    }
}

fn stamp_repository(record: &mut Record, repo: &Repository) {
    record.insert(String::from("repository_owner"), Value::from(repo.owner.as_str()));
    record.insert(String::from("repository_name"), Value::from(repo.name.as_str()));
}

fn flatten_commit(commit: &Record, repo: &Repository) -> Record {
    let info = commit.get("commit");
    let person = |role: &str, field: &str| {
        info.and_then(|info| info.get(role))
            .and_then(|person| person.get(field))
            .cloned()
            .unwrap_or(Value::Null)
    };

    let mut record = Map::new();
    for field in ["sha", "node_id"] {
        record.insert(field.to_owned(), commit.get(field).cloned().unwrap_or(Value::Null));
    }
    stamp_repository(&mut record, repo);
    record.insert(
        String::from("commit_message"),
        info.and_then(|info| info.get("message")).cloned().unwrap_or(Value::Null),
    );
    for role in ["author", "committer"] {
        for field in ["name", "email", "date"] {
            record.insert(format!("commit_{role}_{field}"), person(role, field));
        }
    }
    for field in ["html_url", "url", "author", "committer"] {
        record.insert(field.to_owned(), commit.get(field).cloned().unwrap_or(Value::Null));
    }
    record
}

#[async_trait]
impl Connector for GithubConnector {
    fn name(&self) -> &'static str {
        "github"
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
            GithubTable::Issues | GithubTable::Comments => {
                self.read_updated(kind, descriptor, offset, &read_options).await
            }
            GithubTable::PullRequests => self.read_pull_requests(offset, &read_options).await,
            GithubTable::Commits => self.read_commits(offset, &read_options).await,
            GithubTable::Reviews => self.read_reviews(offset, &read_options).await,
            GithubTable::Repositories
            | GithubTable::Branches
            | GithubTable::Assignees
            | GithubTable::Collaborators
            | GithubTable::Organizations
            | GithubTable::Teams
            | GithubTable::Users => self.read_snapshot(kind, &read_options).await,
        }
        .map_err(|error| error.in_table(table))?;

        tracing::info!(connector = "github", table, records = batch.len(), offset = %batch.offset, "read completed");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> OptionMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn catalog_is_valid_and_lists_every_table() {
        let catalog = TableCatalog::build(describe).expect("valid catalog");

        assert_eq!(catalog.names().len(), GithubTable::ALL.len());
        assert_eq!(catalog.names()[0], "issues");
    }

    #[test]
    fn per_page_is_clamped_and_lookback_defaults() {
        let raw = options(&[("owner", "acme"), ("repo", "widgets"), ("per_page", "500")]);

        let parsed = ReadOptions::parse(GithubTable::Issues, &raw).expect("valid");

        assert_eq!(parsed.per_page, 100);
        assert_eq!(parsed.max_pages, DEFAULT_MAX_PAGES);
        assert_eq!(parsed.lookback, Duration::seconds(300));
        assert_eq!(parsed.state, "all");
    }

    #[test]
    fn repositories_needs_exactly_one_account() {
        let both = options(&[("owner", "acme"), ("org", "acme-org")]);
        let neither = OptionMap::new();

        assert!(matches!(
            ReadOptions::parse(GithubTable::Repositories, &both),
            Err(ConfigError::ConflictingOptions { .. })
        ));
        assert!(matches!(
            ReadOptions::parse(GithubTable::Repositories, &neither),
            Err(ConfigError::MissingOptions { .. })
        ));
    }

    #[test]
    fn offset_cursor_wins_over_start_date() {
        let raw = options(&[
            ("owner", "acme"),
            ("repo", "widgets"),
            ("start_date", "2023-01-01"),
        ]);
        let parsed = ReadOptions::parse(GithubTable::Issues, &raw).expect("valid");
        let offset = Offset::single(CURSOR_KEY, "2024-02-02T00:00:00Z");

        assert_eq!(
            parsed.lower_bound(None).as_deref(),
            Some("2023-01-01T00:00:00Z")
        );
        assert_eq!(
            parsed.lower_bound(Some(&offset)).as_deref(),
            Some("2024-02-02T00:00:00Z")
        );
    }

    #[test]
    fn commits_are_flattened_with_repository() {
        let commit: Record = serde_json::from_value(serde_json::json!({
            "sha": "abc",
            "commit": {
                "message": "fix",
                "author": {"name": "Ada", "email": "ada@example.com", "date": "2024-01-01T00:00:00Z"}
            }
        }))
        .expect("object");
        let repo = Repository {
            owner: String::from("acme"),
            name: String::from("widgets"),
        };

        let record = flatten_commit(&commit, &repo);

        assert_eq!(record["sha"], "abc");
        assert_eq!(record["commit_author_date"], "2024-01-01T00:00:00Z");
        assert_eq!(record["commit_committer_name"], Value::Null);
        assert_eq!(record["repository_name"], "widgets");
    }
}
