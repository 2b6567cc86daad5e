//! Shared fixtures for connector integration tests.
//!
//! [`ScriptedHttpClient`] answers requests from per-endpoint response queues
//! and records every request it receives.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ferroflow_core::http_client::{HttpFuture, HttpMethod};
use ferroflow_core::{HttpClient, HttpError, HttpRequest, HttpResponse, OptionMap};

pub const GITHUB: &str = "https://api.test";

struct Route {
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    responses: VecDeque<Result<HttpResponse, HttpError>>,
}

impl Route {
    fn matches(&self, method: HttpMethod, path: &str, query: &[(String, String)]) -> bool {
        self.method == method && self.path == path && self.query.iter().all(|pair| query.contains(pair))
    }
}

/// Fake upstream. The most specific matching route wins; a route's last
/// queued response repeats once the queue is drained. Unmatched requests
/// get a 404.
#[derive(Default)]
pub struct ScriptedHttpClient {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_get(&self, url: &str, response: HttpResponse) -> &Self {
        self.script(HttpMethod::Get, url, &[], Ok(response))
    }

    /// Routes GETs to `url` whose query contains every pair of `query`.
    pub fn on_get_with(&self, url: &str, query: &[(&str, &str)], response: HttpResponse) -> &Self {
        self.script(HttpMethod::Get, url, query, Ok(response))
    }

    pub fn on_post(&self, url: &str, response: HttpResponse) -> &Self {
        self.script(HttpMethod::Post, url, &[], Ok(response))
    }

    pub fn fail_get(&self, url: &str, error: HttpError) -> &Self {
        self.script(HttpMethod::Get, url, &[], Err(error))
    }

    fn script(
        &self,
        method: HttpMethod,
        url: &str,
        query: &[(&str, &str)],
        response: Result<HttpResponse, HttpError>,
    ) -> &Self {
        let query = query
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<Vec<_>>();
        let mut routes = self.routes.lock().expect("routes lock");
        match routes
            .iter_mut()
            .find(|route| route.method == method && route.path == url && route.query == query)
        {
            Some(route) => route.responses.push_back(response),
            None => routes.push(Route {
                method,
                path: url.to_owned(),
                query,
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    /// Requests whose URL, without its query, equals `url`.
    pub fn calls_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| split_url(&request.url).0 == url)
            .collect()
    }

    fn respond(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let (path, query) = split_url(&request.url);
        let mut routes = self.routes.lock().expect("routes lock");
        let route = routes
            .iter_mut()
            .filter(|route| route.matches(request.method, &path, &query))
            .max_by_key(|route| route.query.len());
        match route {
            Some(route) if route.responses.len() > 1 => route
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, "{}"))),
            Some(route) => route
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, "{}"))),
            None => Ok(HttpResponse::new(404, r#"{"message":"Not Found"}"#)),
        }
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        let response = self.respond(&request);
        self.requests.lock().expect("requests lock").push(request);
        Box::pin(async move { response })
    }
}

/// Splits `url` into its path and decoded query pairs.
pub fn split_url(url: &str) -> (String, Vec<(String, String)>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let pairs = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |raw: &str| {
                urlencoding::decode(raw)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| raw.to_owned())
            };
            (decode(key), decode(value))
        })
        .collect();
    (path.to_owned(), pairs)
}

pub fn query_value(request: &HttpRequest, key: &str) -> Option<String> {
    split_url(&request.url)
        .1
        .into_iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value)
}

pub fn options(pairs: &[(&str, &str)]) -> OptionMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// Connection options that keep retries instant.
pub fn fast_retry(pairs: &[(&str, &str)]) -> OptionMap {
    let mut map = options(&[("backoff_base_ms", "0"), ("max_server_delay_secs", "0")]);
    map.extend(options(pairs));
    map
}

pub fn json(body: serde_json::Value) -> HttpResponse {
    HttpResponse::ok_json(body.to_string())
}
