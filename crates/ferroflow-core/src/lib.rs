//! # Ferroflow Core
//!
//! Source connectors that expose third-party REST APIs as tables an
//! incremental ingestion pipeline can read batch by batch.
//!
//! ## Overview
//!
//! Every connector implements the same facade:
//!
//! - **Table discovery**: [`Connector::list_tables`]
//! - **Schema and sync metadata**: primary keys, cursor field, ingestion mode
//! - **Bounded reads** returning records plus an opaque resumption [`Offset`]
//! - **Deletion feeds** for `cdc_with_deletes` tables
//!
//! The pipeline persists the returned offset and passes it back on the next
//! read. A read that returns its input offset unchanged is exhausted.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connector`] | The connector facade and read batches |
//! | [`connectors`] | GitHub, Gmail, PI Web API and GA4 connectors |
//! | [`source`] | Connector selection by name |
//! | [`offset`] | Offsets, cursor tracking and next-offset rules |
//! | [`table`] | Ingestion modes, columns and table descriptors |
//! | [`dispatch`] | Table name resolution |
//! | [`pagination`] | Link-header, token, time-window and index paging |
//! | [`batch`] | JSON and multipart batch endpoints with fallback |
//! | [`pool`] | Bounded parallel sub-fetches |
//! | [`transport`] | Authenticated requests with retries |
//! | [`retry`] | Backoff and rate-limit reset handling |
//! | [`throttle`] | Client-side request rate limiting |
//! | [`auth`] | Static and OAuth credentials |
//! | [`http_client`] | HTTP client abstraction |
//! | [`config`] | HTTP settings from connection options |
//! | [`options`] | Typed access to string options |
//! | [`error`] | Configuration and connector errors |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ferroflow_core::{connect, OptionMap, ReqwestHttpClient, SourceKind};
//!
//! let mut options = OptionMap::new();
//! options.insert("token".into(), std::env::var("GITHUB_TOKEN")?);
//! options.insert("owner".into(), "rust-lang".into());
//! options.insert("repo".into(), "rust".into());
//!
//! let connector = connect(SourceKind::Github, &options, Arc::new(ReqwestHttpClient::new()))?;
//! let mut offset = None;
//! loop {
//!     let batch = connector.read_table("issues", offset.as_ref(), &options).await?;
//!     let exhausted = batch.is_exhausted(offset.as_ref());
//!     offset = Some(batch.offset);
//!     if exhausted {
//!         break;
//!     }
//! }
//! ```
//!
//! ## Error Handling
//!
//! Only [`ConnectorError::Transient`] failures are worth retrying; they have
//! already exhausted the connector's own retry budget. Configuration errors
//! surface before any network call.

pub mod auth;
pub mod batch;
pub mod config;
pub mod connector;
pub mod connectors;
pub mod dispatch;
pub mod error;
pub mod http_client;
pub mod offset;
pub mod options;
pub mod pagination;
pub mod pool;
pub mod retry;
pub mod source;
pub mod table;
pub mod throttle;
pub mod transport;

pub use auth::{CredentialProvider, OAuthTokenCredential, StaticCredential, TokenGrant};
pub use config::HttpSettings;
pub use connector::{Connector, ReadBatch, Record};
pub use error::{ConfigError, ConnectorError, ErrorContext};
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
};
pub use offset::{CursorProtocol, CursorTracker, Offset, ResumeState, SnapshotOffset};
pub use options::OptionMap;
pub use retry::RetryConfig;
pub use source::{connect, SourceKind};
pub use table::{Column, ColumnType, IngestionMode, TableDescriptor, TableMetadata};
