//! Connector implementations.
//!
//! | Connector | Upstream | Pagination | Deletes |
//! |-----------|----------|------------|---------|
//! | [`github`] | GitHub REST v3 | `Link` header | no |
//! | [`gmail`] | Gmail API v1 | `nextPageToken`, multipart batch | history feed |
//! | [`osipi`] | PI Web API | time windows, `startIndex`, JSON batch | no |
//! | [`google_analytics`] | GA4 Data API | `offset`/`limit` | no |
//! | [`surveymonkey`] | SurveyMonkey API v3 | `links.next` | no |

pub mod github;
pub mod gmail;
pub mod google_analytics;
pub mod osipi;
pub mod surveymonkey;

pub use github::GithubConnector;
pub use gmail::GmailConnector;
pub use google_analytics::GoogleAnalyticsConnector;
pub use osipi::OsipiConnector;
pub use surveymonkey::SurveymonkeyConnector;

use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;

use crate::auth::{OAuthTokenCredential, TokenGrant};
use crate::connector::{into_record, Record};
use crate::error::{json_shape, ConfigError, ConnectorError, ErrorContext};
use crate::http_client::HttpClient;
use crate::offset::parse_instant;
use crate::options::{OptionMap, TableOptions};

/// Converts JSON items to records, rejecting anything that is not an object.
pub(crate) fn into_records(endpoint: &str, items: Vec<Value>) -> Result<Vec<Record>, ConnectorError> {
    items
        .into_iter()
        .map(|item| {
            let shape = json_shape(&item);
            into_record(item).ok_or_else(|| {
                ConnectorError::protocol(ErrorContext::endpoint(endpoint), "object", shape)
            })
        })
        .collect()
}

pub(crate) fn str_field<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

pub(crate) fn instant_field(record: &Record, field: &str) -> Option<OffsetDateTime> {
    str_field(record, field).and_then(parse_instant)
}

/// Copies `fields` from `source`, using null for absent ones.
pub(crate) fn pick(source: &Record, fields: &[&str]) -> Record {
    fields
        .iter()
        .map(|field| {
            (
                (*field).to_owned(),
                source.get(*field).cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

/// Token endpoint shared by the Google APIs.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh-token credential built from `client_id`, `client_secret`,
/// `refresh_token` and an optional `token_url` connection option.
pub(crate) fn google_credentials(
    raw: &OptionMap,
    http_client: Arc<dyn HttpClient>,
) -> Result<OAuthTokenCredential, ConfigError> {
    let options = TableOptions::connection(raw);
    let values = options.require_all(&["client_id", "client_secret", "refresh_token"])?;
    let grant = TokenGrant::RefreshToken {
        client_id: values[0].to_owned(),
        client_secret: values[1].to_owned(),
        refresh_token: values[2].to_owned(),
    };
    let token_url = options.get("token_url").unwrap_or(GOOGLE_TOKEN_URL);
    Ok(OAuthTokenCredential::new(http_client, token_url, grant))
}
