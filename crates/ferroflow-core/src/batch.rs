//! Multi-request batch execution.
//!
//! Two wire formats are supported: a JSON batch document (one POST whose
//! body maps request ids to `{Method, Resource}` entries) and
//! `multipart/mixed` (one `application/http` part per request). When the
//! batch call itself fails, every request is re-issued individually.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{json_shape, ConnectorError, ErrorContext};
use crate::http_client::HttpRequest;
use crate::pool;
use crate::transport::{decode_json, ApiClient, Requirement};

/// One GET packed into a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    /// Caller-chosen key returned with the matching result.
    pub key: String,
    /// Absolute URL, query included.
    pub url: String,
}

impl BatchItem {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
        }
    }
}

/// Per-request status and decoded body inside a batch response.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub key: String,
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Largest number of requests sent in one batch call.
    fn max_items(&self) -> usize;

    async fn execute(
        &self,
        client: &ApiClient,
        items: &[BatchItem],
    ) -> Result<Vec<BatchOutcome>, ConnectorError>;
}

/// Runs `items` through `transport` in chunks of `max_items`.
///
/// Entries answered with a non-2xx status are skipped. A chunk whose batch
/// call fails is retried as individual GETs, `fallback_width` at a time;
/// 403/404 answers are skipped there too, other failures propagate.
pub async fn execute_batched(
    client: &ApiClient,
    transport: &dyn BatchTransport,
    items: &[BatchItem],
    fallback_width: usize,
) -> Result<Vec<BatchOutcome>, ConnectorError> {
    let mut results = Vec::with_capacity(items.len());

    for chunk in items.chunks(transport.max_items().max(1)) {
        match transport.execute(client, chunk).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    if (200..300).contains(&outcome.status) {
                        results.push(outcome);
                    } else {
                        tracing::debug!(key = %outcome.key, status = outcome.status, "skipping failed batch entry");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(
                    requests = chunk.len(),
                    error = %error,
                    "batch call failed, falling back to individual requests"
                );
                results.extend(fetch_individually(client, chunk, fallback_width).await?);
            }
        }
    }

    Ok(results)
}

async fn fetch_individually(
    client: &ApiClient,
    items: &[BatchItem],
    width: usize,
) -> Result<Vec<BatchOutcome>, ConnectorError> {
    pool::fetch_all(items.to_vec(), width, |item: BatchItem| async move {
        let Some(response) = client
            .send(HttpRequest::get(&item.url), Requirement::Optional)
            .await?
        else {
            return Ok(None);
        };
        let body = decode_json(&item.url, &response)?;
        Ok(Some(BatchOutcome {
            key: item.key,
            status: response.status,
            body,
        }))
    })
    .await
}

/// JSON batch endpoint: `{"1": {"Method": "GET", "Resource": url}, ...}`
/// answered by `{"1": {"Status": 200, "Content": {...}}, ...}`.
#[derive(Debug, Clone)]
pub struct JsonBatch {
    path: String,
    max_items: usize,
}

impl JsonBatch {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_items: 500,
        }
    }
}

#[async_trait]
impl BatchTransport for JsonBatch {
    fn max_items(&self) -> usize {
        self.max_items
    }

    async fn execute(
        &self,
        client: &ApiClient,
        items: &[BatchItem],
    ) -> Result<Vec<BatchOutcome>, ConnectorError> {
        let payload = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut entry = Map::new();
                entry.insert(String::from("Method"), Value::from("GET"));
                entry.insert(String::from("Resource"), Value::from(item.url.as_str()));
                ((index + 1).to_string(), Value::Object(entry))
            })
            .collect::<Map<_, _>>();

        let endpoint = client.url(&self.path);
        let response = client
            .post_json(&self.path, &Value::Object(payload), Requirement::Required)
            .await?
            .unwrap_or(Value::Null);
        let Value::Object(entries) = response else {
            return Err(ConnectorError::protocol(
                ErrorContext::endpoint(endpoint),
                "object keyed by request id",
                json_shape(&response),
            ));
        };

        Ok(items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                let entry = entries.get(&(index + 1).to_string())?;
                let status = entry
                    .get("Status")
                    .and_then(Value::as_u64)
                    .and_then(|status| u16::try_from(status).ok())
                    .unwrap_or(0);
                Some(BatchOutcome {
                    key: item.key.clone(),
                    status,
                    body: entry.get("Content").cloned().unwrap_or(Value::Null),
                })
            })
            .collect())
    }
}

/// `multipart/mixed` batch endpoint with one `application/http` part per
/// request, correlated through `Content-ID`.
#[derive(Debug, Clone)]
pub struct MultipartBatch {
    url: String,
    max_items: usize,
}

impl MultipartBatch {
    pub fn new(url: impl Into<String>, max_items: usize) -> Self {
        Self {
            url: url.into(),
            max_items,
        }
    }
}

#[async_trait]
impl BatchTransport for MultipartBatch {
    fn max_items(&self) -> usize {
        self.max_items
    }

    async fn execute(
        &self,
        client: &ApiClient,
        items: &[BatchItem],
    ) -> Result<Vec<BatchOutcome>, ConnectorError> {
        let boundary = format!("batch_{}", uuid::Uuid::new_v4().simple());
        let request = HttpRequest::post(client.url(&self.url))
            .with_header(
                "content-type",
                format!("multipart/mixed; boundary={boundary}"),
            )
            .with_body(multipart_body(&boundary, items));

        let endpoint = request.url.clone();
        let response = client
            .send(request, Requirement::Required)
            .await?
            .ok_or_else(|| ConnectorError::fatal(ErrorContext::endpoint(&endpoint), "empty batch response"))?;

        let response_boundary = response
            .header("content-type")
            .and_then(boundary_of)
            .ok_or_else(|| {
                ConnectorError::protocol(
                    ErrorContext::endpoint(&endpoint).with_status(response.status),
                    "multipart/mixed content type with boundary",
                    response.header("content-type").unwrap_or("none").to_owned(),
                )
            })?;

        let parts = parse_multipart(&response.body, &response_boundary);
        let keys = items
            .iter()
            .enumerate()
            .map(|(index, item)| (format!("item{index}"), item.key.as_str()))
            .collect::<BTreeMap<_, _>>();

        parts
            .into_iter()
            .enumerate()
            .filter_map(|(position, part)| {
                let key = part
                    .content_id
                    .as_deref()
                    .and_then(|id| keys.get(id).copied())
                    .or_else(|| items.get(position).map(|item| item.key.as_str()))?;
                Some((key.to_owned(), part))
            })
            .map(|(key, part)| {
                let body = if part.body.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&part.body).map_err(|source| ConnectorError::Decode {
                        context: ErrorContext::endpoint(&endpoint)
                            .with_status(part.status)
                            .with_body(&part.body),
                        source,
                    })?
                };
                Ok(BatchOutcome {
                    key,
                    status: part.status,
                    body,
                })
            })
            .collect()
    }
}

fn multipart_body(boundary: &str, items: &[BatchItem]) -> String {
    let mut body = String::new();
    for (index, item) in items.iter().enumerate() {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Type: application/http\r\nContent-ID: <item{index}>\r\n\r\nGET {}\r\n\r\n",
            item.url
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body
}

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.eq_ignore_ascii_case("boundary")
            .then(|| value.trim_matches('"').to_owned())
    })
}

#[derive(Debug, Clone, PartialEq)]
struct MultipartPart {
    content_id: Option<String>,
    status: u16,
    body: String,
}

fn parse_multipart(body: &str, boundary: &str) -> Vec<MultipartPart> {
    let normalized = body.replace("\r\n", "\n");
    let delimiter = format!("--{boundary}");

    normalized
        .split(delimiter.as_str())
        .filter_map(|raw| {
            let raw = raw.trim_start_matches('\n');
            if raw.is_empty() || raw.starts_with("--") {
                return None;
            }
            let (part_headers, http) = raw.split_once("\n\n")?;
            let content_id = part_headers.lines().find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim().eq_ignore_ascii_case("content-id").then(|| {
                    let id = value.trim().trim_start_matches('<').trim_end_matches('>');
                    id.strip_prefix("response-").unwrap_or(id).to_owned()
                })
            });
            let (head, payload) = http.split_once("\n\n").unwrap_or((http, ""));
            let status = head
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|code| code.parse().ok())?;
            Some(MultipartPart {
                content_id,
                status,
                body: payload.trim().to_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_read_from_content_type() {
        assert_eq!(
            boundary_of("multipart/mixed; boundary=batch_abc"),
            Some(String::from("batch_abc"))
        );
        assert_eq!(
            boundary_of(r#"multipart/mixed; boundary="quoted""#),
            Some(String::from("quoted"))
        );
        assert_eq!(boundary_of("application/json"), None);
    }

    #[test]
    fn request_body_has_one_part_per_item() {
        let items = vec![
            BatchItem::new("a", "https://api.test/m/a?format=full"),
            BatchItem::new("b", "https://api.test/m/b?format=full"),
        ];

        let body = multipart_body("xyz", &items);

        assert_eq!(body.matches("--xyz\r\n").count(), 2);
        assert!(body.contains("Content-ID: <item1>"));
        assert!(body.contains("GET https://api.test/m/a?format=full"));
        assert!(body.ends_with("--xyz--\r\n"));
    }

    #[test]
    fn response_parts_carry_id_status_and_body() {
        let body = "--resp\r\nContent-Type: application/http\r\nContent-ID: <response-item1>\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\n\r\n{\"error\":{}}\r\n--resp\r\nContent-Type: application/http\r\nContent-ID: <response-item0>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"id\":\"a\"}\r\n--resp--";

        let parts = parse_multipart(body, "resp");

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content_id.as_deref(), Some("item1"));
        assert_eq!(parts[0].status, 404);
        assert_eq!(parts[1].status, 200);
        assert_eq!(parts[1].body, r#"{"id":"a"}"#);
    }
}
