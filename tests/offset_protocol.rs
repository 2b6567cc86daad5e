//! Behavior tests for the incremental read and resumption protocol.
//!
//! These tests drive real connectors against a scripted upstream and check
//! the offsets they hand back across consecutive reads.

mod support;

use ferroflow_core::connectors::GithubConnector;
use ferroflow_core::offset::WINDOW_KEY;
use ferroflow_core::{Connector, CursorProtocol, CursorTracker, IngestionMode, Offset};
use serde_json::json;
use support::{json, options, query_value, ScriptedHttpClient, GITHUB};
use time::Duration;

const T1: &str = "2024-03-01T10:00:00Z";
const T2: &str = "2024-03-01T11:00:00Z";
const T3: &str = "2024-03-01T12:00:00Z";
const T3_MINUS_LOOKBACK: &str = "2024-03-01T11:55:00Z";

const ISSUES: &str = "https://api.test/repos/acme/widgets/issues";
const COMMITS: &str = "https://api.test/repos/acme/widgets/commits";
const PULLS: &str = "https://api.test/repos/acme/widgets/pulls";
const REPOS: &str = "https://api.test/users/acme/repos";

fn repo_options(extra: &[(&str, &str)]) -> ferroflow_core::OptionMap {
    let mut map = options(&[("base_url", GITHUB), ("owner", "acme"), ("repo", "widgets")]);
    map.extend(options(extra));
    map
}

fn issue(id: u64, updated_at: &str) -> serde_json::Value {
    json!({ "id": id, "number": id, "title": format!("issue {id}"), "updated_at": updated_at })
}

fn three_issues() -> serde_json::Value {
    json!([issue(1, T1), issue(2, T2), issue(3, T3)])
}

fn ids(batch: &ferroflow_core::ReadBatch) -> Vec<u64> {
    batch
        .records
        .iter()
        .filter_map(|record| record.get("id").and_then(serde_json::Value::as_u64))
        .collect()
}

// =============================================================================
// CDC: lookback and exhaustion
// =============================================================================

#[tokio::test]
async fn first_issues_read_returns_all_records_and_cursor_minus_lookback() {
    // Given: three issues updated at T1 < T2 < T3 and the default 300s lookback
    let client = ScriptedHttpClient::new();
    client.on_get(ISSUES, json(three_issues()));
    let opts = repo_options(&[]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: the table is read without an offset
    let batch = connector.read_table("issues", None, &opts).await.expect("read succeeds");

    // Then: every issue is returned and the cursor trails the newest by 300s
    assert_eq!(ids(&batch), vec![1, 2, 3]);
    assert_eq!(batch.offset, Offset::single("cursor", T3_MINUS_LOOKBACK));

    let request = &client.calls_to(ISSUES)[0];
    assert_eq!(query_value(request, "sort").as_deref(), Some("updated"));
    assert_eq!(query_value(request, "direction").as_deref(), Some("asc"));
    assert_eq!(query_value(request, "since"), None);
}

#[tokio::test]
async fn resumed_issues_read_without_new_data_returns_input_offset() {
    // Given: the upstream has nothing updated since the stored cursor
    let client = ScriptedHttpClient::new();
    client
        .on_get(ISSUES, json(three_issues()))
        .on_get_with(ISSUES, &[("since", T3_MINUS_LOOKBACK)], json(json!([])));
    let opts = repo_options(&[]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");
    let stored = Offset::single("cursor", T3_MINUS_LOOKBACK);

    // When: the table is read from that cursor
    let batch = connector
        .read_table("issues", Some(&stored), &opts)
        .await
        .expect("read succeeds");

    // Then: no records and the very same offset signal exhaustion
    assert!(batch.is_empty());
    assert_eq!(batch.offset, stored);
    assert!(batch.is_exhausted(Some(&stored)));
    assert_eq!(
        query_value(&client.calls_to(ISSUES)[0], "since").as_deref(),
        Some(T3_MINUS_LOOKBACK)
    );
}

#[tokio::test]
async fn repeated_reads_reach_a_stable_offset() {
    // Given: a fixed data set
    let client = ScriptedHttpClient::new();
    client
        .on_get(ISSUES, json(three_issues()))
        .on_get_with(ISSUES, &[("since", T3_MINUS_LOOKBACK)], json(json!([])));
    let opts = repo_options(&[]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: each read is fed the previous offset
    let mut offset: Option<Offset> = None;
    let mut reads = 0;
    let last = loop {
        reads += 1;
        let batch = connector
            .read_table("issues", offset.as_ref(), &opts)
            .await
            .expect("read succeeds");
        if batch.is_exhausted(offset.as_ref()) || reads == 5 {
            break batch;
        }
        offset = Some(batch.offset);
    };

    // Then: the loop ends on an empty batch that echoes its input
    assert_eq!(reads, 2);
    assert!(last.is_empty());
    assert_eq!(Some(&last.offset), offset.as_ref());
}

#[tokio::test]
async fn lookback_option_moves_cursor_further_back() {
    // Given: a 600s lookback
    let client = ScriptedHttpClient::new();
    client.on_get(ISSUES, json(three_issues()));
    let opts = repo_options(&[("lookback_seconds", "600")]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When
    let batch = connector.read_table("issues", None, &opts).await.expect("read succeeds");

    // Then: cursor <= T3 - 600s
    let cursor = batch.offset.get("cursor").expect("cursor present");
    assert_eq!(cursor, "2024-03-01T11:50:00Z");
}

#[test]
fn unparsable_cursor_is_kept_verbatim_despite_lookback() {
    // Given: sequence-like cursor values
    let mut tracker = CursorTracker::new();
    for raw in ["981", "1004", "999"] {
        tracker.record();
        tracker.observe(raw);
    }

    // When
    let next = CursorProtocol::new("historyId", Duration::seconds(300)).next_offset(
        IngestionMode::Cdc,
        None,
        &tracker,
    );

    // Then: the maximum is compared numerically and not shifted
    assert_eq!(next, Offset::single("historyId", "1004"));
}

// =============================================================================
// Snapshot: stateless reads
// =============================================================================

#[tokio::test]
async fn snapshot_reads_ignore_the_input_offset() {
    // Given: two repositories owned by a user
    let client = ScriptedHttpClient::new();
    client.on_get(
        "https://api.test/users/acme/repos",
        json(json!([
            { "id": 10, "name": "widgets", "owner": { "login": "acme" } },
            { "id": 11, "name": "gears", "owner": { "login": "acme" } }
        ])),
    );
    let opts = options(&[("base_url", GITHUB), ("owner", "acme")]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: the table is read with different stored offsets
    let inputs = [None, Some(Offset::empty()), Some(Offset::single("cursor", T1))];
    let mut batches = Vec::new();
    for input in &inputs {
        batches.push(
            connector
                .read_table("repositories", input.as_ref(), &opts)
                .await
                .expect("read succeeds"),
        );
    }

    // Then: identical content and an empty offset every time
    for batch in &batches {
        assert_eq!(batch.records, batches[0].records);
        assert_eq!(batch.offset, Offset::empty());
    }
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[0].records[0]["repository_owner"], "acme");
}

#[tokio::test]
async fn empty_snapshot_still_reports_empty_offset() {
    // Given: a user without repositories
    let client = ScriptedHttpClient::new();
    client.on_get("https://api.test/users/acme/repos", json(json!([])));
    let opts = options(&[("base_url", GITHUB), ("owner", "acme")]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When
    let batch = connector
        .read_table("repositories", None, &opts)
        .await
        .expect("read succeeds");

    // Then
    assert!(batch.is_empty());
    assert_eq!(batch.offset, Offset::empty());
}

// =============================================================================
// Append: exact cursor, no overlap
// =============================================================================

fn commit(sha: &str, date: &str) -> serde_json::Value {
    json!({
        "sha": sha,
        "commit": {
            "message": format!("commit {sha}"),
            "author": { "name": "dev", "email": "dev@acme.test", "date": date },
            "committer": { "name": "dev", "email": "dev@acme.test", "date": date }
        }
    })
}

#[tokio::test]
async fn append_cursor_is_the_exact_maximum_and_excludes_seen_rows() {
    // Given: commits listed newest first, and nothing newer afterwards
    let client = ScriptedHttpClient::new();
    client
        .on_get(
            COMMITS,
            json(json!([commit("c3", T3), commit("c2", T2), commit("c1", T1)])),
        )
        .on_get_with(COMMITS, &[("since", "2024-03-01T12:00:01Z")], json(json!([])));
    let opts = repo_options(&[]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: the table is read twice
    let first = connector.read_table("commits", None, &opts).await.expect("first read");
    let second = connector
        .read_table("commits", Some(&first.offset), &opts)
        .await
        .expect("second read");

    // Then: the cursor is T3 itself and the next read starts after it
    assert_eq!(first.len(), 3);
    assert_eq!(first.offset, Offset::single("cursor", T3));
    assert!(second.is_empty());
    assert_eq!(second.offset, first.offset);
    assert_eq!(
        query_value(&client.calls_to(COMMITS)[1], "since").as_deref(),
        Some("2024-03-01T12:00:01Z")
    );
}

// =============================================================================
// Pagination under a page cap
// =============================================================================

#[tokio::test]
async fn page_cap_leaves_a_resumable_cursor_without_gaps() {
    // Given: three pages of two issues each and a cap of two pages per read
    let client = ScriptedHttpClient::new();
    let page2 = format!("{ISSUES}?page=2");
    let page3 = format!("{ISSUES}?page=3");
    client
        .on_get(
            ISSUES,
            json(json!([issue(1, "2024-03-01T01:00:00Z"), issue(2, "2024-03-01T02:00:00Z")]))
                .with_header("link", format!(r#"<{page2}>; rel="next""#)),
        )
        .on_get_with(
            ISSUES,
            &[("page", "2")],
            json(json!([issue(3, "2024-03-01T03:00:00Z"), issue(4, "2024-03-01T04:00:00Z")]))
                .with_header("link", format!(r#"<{page3}>; rel="next""#)),
        )
        .on_get_with(
            ISSUES,
            &[("page", "3")],
            json(json!([issue(5, "2024-03-01T05:00:00Z"), issue(6, "2024-03-01T06:00:00Z")])),
        )
        .on_get_with(
            ISSUES,
            &[("since", "2024-03-01T04:00:00Z")],
            json(json!([
                issue(4, "2024-03-01T04:00:00Z"),
                issue(5, "2024-03-01T05:00:00Z"),
                issue(6, "2024-03-01T06:00:00Z")
            ])),
        );
    let opts = repo_options(&[
        ("per_page", "2"),
        ("max_pages_per_batch", "2"),
        ("lookback_seconds", "0"),
    ]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: the table is read twice
    let first = connector.read_table("issues", None, &opts).await.expect("first read");
    let calls_after_first = client.calls_to(ISSUES).len();
    let second = connector
        .read_table("issues", Some(&first.offset), &opts)
        .await
        .expect("second read");

    // Then: exactly two pages were fetched, then the rest without gaps
    assert_eq!(calls_after_first, 2);
    assert_eq!(ids(&first), vec![1, 2, 3, 4]);
    assert_eq!(first.offset, Offset::single("cursor", "2024-03-01T04:00:00Z"));

    let mut union = ids(&first);
    union.extend(ids(&second));
    union.sort_unstable();
    union.dedup();
    assert_eq!(union, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(second.offset, Offset::single("cursor", "2024-03-01T06:00:00Z"));
}

fn at_hour(hour: u32) -> String {
    format!("2024-03-01T{hour:02}:00:00Z")
}

fn pull(number: u64) -> serde_json::Value {
    json!({ "id": number, "number": number, "state": "open", "updated_at": at_hour(number as u32) })
}

fn linked(body: serde_json::Value, next: &str) -> ferroflow_core::HttpResponse {
    json(body).with_header("link", format!(r#"<{next}>; rel="next""#))
}

#[tokio::test]
async fn capped_pull_request_walk_resumes_on_the_next_page() {
    // Given: six pulls listed newest first, two per page, two pages per read
    let client = ScriptedHttpClient::new();
    client
        .on_get(PULLS, linked(json!([pull(6), pull(5)]), &format!("{PULLS}?page=2")))
        .on_get_with(
            PULLS,
            &[("page", "2")],
            linked(json!([pull(4), pull(3)]), &format!("{PULLS}?page=3")),
        )
        .on_get_with(PULLS, &[("page", "3")], json(json!([pull(2), pull(1)])));
    let opts = repo_options(&[
        ("per_page", "2"),
        ("max_pages_per_batch", "2"),
        ("lookback_seconds", "0"),
    ]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: each read is fed the previous offset until it stabilizes
    let mut offset: Option<Offset> = None;
    let mut delivered = Vec::new();
    let mut offsets = Vec::new();
    for _ in 0..5 {
        let batch = connector
            .read_table("pull_requests", offset.as_ref(), &opts)
            .await
            .expect("read succeeds");
        delivered.push(ids(&batch));
        offsets.push(batch.offset.clone());
        if batch.is_exhausted(offset.as_ref()) {
            break;
        }
        offset = Some(batch.offset);
    }

    // Then: the capped walk continues where it stopped and nothing is lost
    assert_eq!(delivered[0], vec![6, 5, 4, 3]);
    assert_eq!(offsets[0].get("next_page"), Some(format!("{PULLS}?page=3").as_str()));
    assert_eq!(offsets[0].get("high_water"), Some(at_hour(6).as_str()));
    assert_eq!(offsets[0].get("cursor"), None);

    assert_eq!(delivered[1], vec![2, 1]);
    assert_eq!(offsets[1], Offset::single("cursor", at_hour(6)));

    // The settled pass stops below the cursor without reading older pages.
    assert_eq!(delivered[2], vec![6]);
    assert_eq!(offsets[2], offsets[1]);
    assert_eq!(delivered.len(), 3);

    let mut union = delivered.concat();
    union.sort_unstable();
    union.dedup();
    assert_eq!(union, vec![1, 2, 3, 4, 5, 6]);

    let first = &client.calls_to(PULLS)[0];
    assert_eq!(query_value(first, "direction").as_deref(), Some("desc"));
    assert_eq!(query_value(first, "sort").as_deref(), Some("updated"));
    assert_eq!(client.calls_to(PULLS).len(), 4);
}

#[tokio::test]
async fn capped_commit_run_resumes_below_the_oldest_commit_seen() {
    // Given: four commits newest first over two pages, one page per read
    let client = ScriptedHttpClient::new();
    let t4 = at_hour(4);
    client
        .on_get(
            COMMITS,
            linked(
                json!([commit("c4", &t4), commit("c3", &at_hour(3))]),
                &format!("{COMMITS}?page=2"),
            ),
        )
        .on_get_with(
            COMMITS,
            &[("until", at_hour(3).as_str())],
            json(json!([
                commit("c3", &at_hour(3)),
                commit("c2", &at_hour(2)),
                commit("c1", &at_hour(1))
            ])),
        )
        .on_get_with(COMMITS, &[("since", "2024-03-01T04:00:01Z")], json(json!([])));
    let opts = repo_options(&[("per_page", "2"), ("max_pages_per_batch", "1")]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: the table is read three times
    let first = connector.read_table("commits", None, &opts).await.expect("first read");
    let second = connector
        .read_table("commits", Some(&first.offset), &opts)
        .await
        .expect("second read");
    let third = connector
        .read_table("commits", Some(&second.offset), &opts)
        .await
        .expect("third read");

    // Then: the capped run records where to continue and the newest commit
    assert_eq!(
        first.offset,
        [("until", at_hour(3)), ("high_water", t4.clone())].into_iter().collect::<Offset>()
    );
    assert_eq!(second.offset, Offset::single("cursor", t4));
    assert!(third.is_empty());
    assert!(third.is_exhausted(Some(&second.offset)));

    let mut shas = first
        .records
        .iter()
        .chain(&second.records)
        .filter_map(|record| record["sha"].as_str().map(str::to_owned))
        .collect::<Vec<_>>();
    shas.sort_unstable();
    shas.dedup();
    assert_eq!(shas, vec!["c1", "c2", "c3", "c4"]);
    assert_eq!(
        query_value(&client.calls_to(COMMITS)[1], "until").as_deref(),
        Some("2024-03-01T03:00:00Z")
    );
}

fn review(id: u64, submitted_at: &str) -> serde_json::Value {
    json!({ "id": id, "state": "APPROVED", "submitted_at": submitted_at })
}

#[tokio::test]
async fn reviews_reach_every_pull_and_skip_those_at_the_cursor() {
    // Given: two pulls over two pages, and a page cap of one
    let client = ScriptedHttpClient::new();
    let reviews_of = |number: u64| format!("{PULLS}/{number}/reviews");
    client
        .on_get(
            PULLS,
            linked(
                json!([{ "id": 2, "number": 2, "updated_at": at_hour(5) }]),
                &format!("{PULLS}?page=2"),
            ),
        )
        .on_get_with(
            PULLS,
            &[("page", "2")],
            json(json!([{ "id": 1, "number": 1, "updated_at": at_hour(3) }])),
        )
        .on_get(
            &reviews_of(2),
            linked(json!([review(21, &at_hour(4))]), &format!("{}?page=2", reviews_of(2))),
        )
        .on_get_with(&reviews_of(2), &[("page", "2")], json(json!([review(22, &at_hour(5))])))
        .on_get(&reviews_of(1), json(json!([review(11, &at_hour(2))])));
    let opts = repo_options(&[("max_pages_per_batch", "1")]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When: the table is read twice
    let first = connector.read_table("reviews", None, &opts).await.expect("first read");
    let second = connector
        .read_table("reviews", Some(&first.offset), &opts)
        .await
        .expect("second read");

    // Then: the cap does not hide pulls or review pages
    let mut first_ids = ids(&first);
    first_ids.sort_unstable();
    assert_eq!(first_ids, vec![11, 21, 22]);
    assert_eq!(first.offset, Offset::single("cursor", at_hour(5)));

    // Reviews submitted at or before the cursor are not delivered again,
    // and pulls last updated before it are not listed.
    assert!(second.is_empty());
    assert_eq!(second.offset, first.offset);
    assert_eq!(client.calls_to(&reviews_of(1)).len(), 1);
    assert_eq!(client.calls_to(&reviews_of(2)).len(), 4);
}

#[tokio::test]
async fn snapshot_reads_every_page_despite_the_page_cap() {
    // Given: two pages of repositories and a cap of one page per read
    let client = ScriptedHttpClient::new();
    client
        .on_get(
            REPOS,
            linked(
                json!([{ "id": 1, "name": "widgets", "owner": { "login": "acme" } }]),
                &format!("{REPOS}?page=2"),
            ),
        )
        .on_get_with(
            REPOS,
            &[("page", "2")],
            json(json!([{ "id": 2, "name": "gears", "owner": { "login": "acme" } }])),
        );
    let opts = options(&[("base_url", GITHUB), ("owner", "acme"), ("max_pages_per_batch", "1")]);
    let connector = GithubConnector::new(client.clone(), &opts).expect("valid connector");

    // When
    let batch = connector
        .read_table("repositories", None, &opts)
        .await
        .expect("read succeeds");

    // Then: the whole listing arrives, since a snapshot has nowhere to resume
    assert_eq!(ids(&batch), vec![1, 2]);
    assert_eq!(batch.offset, Offset::empty());
}

#[test]
fn window_offset_uses_the_offset_key() {
    let offset = ferroflow_core::offset::window_offset(
        ferroflow_core::offset::parse_instant(T2).expect("valid instant"),
    );

    assert_eq!(offset.get(WINDOW_KEY), Some(T2));
}
