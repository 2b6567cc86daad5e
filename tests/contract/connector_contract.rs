use std::collections::BTreeSet;
use std::sync::Arc;

use ferroflow_core::{connect, Connector, ConnectorError, IngestionMode, OptionMap, SourceKind};
use serde_json::{json, Value};

#[path = "../support/mod.rs"]
mod support;

use support::{fast_retry, json, ScriptedHttpClient};

const GA_REPORTS: &str =
    include_str!("../../crates/ferroflow-core/src/connectors/google_analytics_reports.json");

struct ConnectorCase {
    kind: SourceKind,
    connector: Arc<dyn Connector>,
    options: OptionMap,
}

/// Property metadata that knows every dimension and metric the report
/// catalog names.
fn analytics_metadata() -> Value {
    let reports: Value = serde_json::from_str(GA_REPORTS).expect("catalog json");
    let mut dimensions = BTreeSet::new();
    let mut metrics = BTreeSet::new();
    for report in reports.as_object().expect("catalog object").values() {
        for (key, names) in [("dimensions", &mut dimensions), ("metrics", &mut metrics)] {
            names.extend(
                report[key]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_owned),
            );
        }
    }
    json!({
        "dimensions": dimensions.iter().map(|name| json!({ "apiName": name })).collect::<Vec<_>>(),
        "metrics": metrics
            .iter()
            .map(|name| json!({ "apiName": name, "type": "TYPE_INTEGER" }))
            .collect::<Vec<_>>(),
    })
}

fn connector_cases() -> Vec<ConnectorCase> {
    let client = ScriptedHttpClient::new();
    client
        .on_post(
            "https://auth.test/token",
            json(json!({ "access_token": "access", "expires_in": 3600 })),
        )
        .on_get(
            "https://ga.test/v1beta/properties/123/metadata",
            json(analytics_metadata()),
        );

    let google = [
        ("client_id", "client"),
        ("client_secret", "secret"),
        ("refresh_token", "refresh"),
        ("token_url", "https://auth.test/token"),
    ];
    let per_kind = |kind: SourceKind| -> OptionMap {
        let mut options = match kind {
            SourceKind::Github => fast_retry(&[
                ("base_url", "https://api.test"),
                ("owner", "acme"),
                ("repo", "widgets"),
            ]),
            SourceKind::Gmail => fast_retry(&[("base_url", "https://gmail.test/gmail/v1")]),
            SourceKind::Osipi => fast_retry(&[
                ("pi_base_url", "https://pi.test"),
                ("access_token", "pi-token"),
            ]),
            SourceKind::GoogleAnalytics => fast_retry(&[
                ("base_url", "https://ga.test/v1beta"),
                ("property_ids", "123"),
            ]),
            SourceKind::Surveymonkey => fast_retry(&[
                ("base_url", "https://sm.test/v3"),
                ("access_token", "sm-token"),
            ]),
        };
        if matches!(kind, SourceKind::Gmail | SourceKind::GoogleAnalytics) {
            options.extend(support::options(&google));
        }
        options
    };

    SourceKind::ALL
        .into_iter()
        .map(|kind| {
            let options = per_kind(kind);
            let connector = connect(kind, &options, client.clone())
                .unwrap_or_else(|error| panic!("connector '{kind}' failed to build: {error}"));
            ConnectorCase {
                kind,
                connector,
                options,
            }
        })
        .collect()
}

#[tokio::test]
async fn every_connector_lists_unique_tables() {
    for case in connector_cases() {
        let tables = case.connector.list_tables();
        assert!(!tables.is_empty(), "connector '{}': no tables", case.kind);

        let unique = tables.iter().collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), tables.len(), "connector '{}': duplicate table", case.kind);
        assert_eq!(case.connector.name(), case.kind.as_str(), "connector '{}': name", case.kind);
    }
}

#[tokio::test]
async fn cursor_field_is_reported_exactly_for_cdc_tables() {
    for case in connector_cases() {
        for table in case.connector.list_tables() {
            let metadata = case
                .connector
                .read_table_metadata(&table, &case.options)
                .await
                .unwrap_or_else(|error| panic!("'{}.{table}' metadata failed: {error}", case.kind));

            let cdc = matches!(
                metadata.ingestion_type,
                IngestionMode::Cdc | IngestionMode::CdcWithDeletes
            );
            assert_eq!(
                metadata.cursor_field.is_some(),
                cdc,
                "'{}.{table}': cursor field vs {}",
                case.kind,
                metadata.ingestion_type
            );
            assert!(
                !metadata.primary_keys.is_empty(),
                "'{}.{table}': primary keys",
                case.kind
            );
        }
    }
}

#[tokio::test]
async fn keys_and_cursor_are_schema_columns() {
    for case in connector_cases() {
        for table in case.connector.list_tables() {
            let schema = case
                .connector
                .get_table_schema(&table, &case.options)
                .await
                .unwrap_or_else(|error| panic!("'{}.{table}' schema failed: {error}", case.kind));
            let metadata = case
                .connector
                .read_table_metadata(&table, &case.options)
                .await
                .unwrap_or_else(|error| panic!("'{}.{table}' metadata failed: {error}", case.kind));

            let names = schema.iter().map(|column| column.name.as_str()).collect::<BTreeSet<_>>();
            assert_eq!(names.len(), schema.len(), "'{}.{table}': duplicate column", case.kind);
            for key in &metadata.primary_keys {
                assert!(
                    names.contains(key.as_str()),
                    "'{}.{table}': key '{key}' missing from schema",
                    case.kind
                );
                let column = schema.iter().find(|column| &column.name == key);
                assert!(
                    column.is_some_and(|column| !column.nullable),
                    "'{}.{table}': key '{key}' must be non-nullable",
                    case.kind
                );
            }
            if let Some(cursor) = &metadata.cursor_field {
                assert!(
                    names.contains(cursor.as_str()),
                    "'{}.{table}': cursor '{cursor}' missing from schema",
                    case.kind
                );
            }
        }
    }
}

#[tokio::test]
async fn deletes_follow_the_ingestion_mode() {
    for case in connector_cases() {
        for table in case.connector.list_tables() {
            let metadata = case
                .connector
                .read_table_metadata(&table, &case.options)
                .await
                .unwrap_or_else(|error| panic!("'{}.{table}' metadata failed: {error}", case.kind));
            let result = case
                .connector
                .read_table_deletes(&table, None, &case.options)
                .await;

            match metadata.ingestion_type {
                IngestionMode::CdcWithDeletes | IngestionMode::Snapshot => {
                    if let Ok(batch) = &result {
                        assert!(batch.is_empty(), "'{}.{table}': deletes without offset", case.kind);
                    }
                    assert!(
                        !matches!(result, Err(ConnectorError::Unsupported { .. })),
                        "'{}.{table}': deletes must not be unsupported for {}",
                        case.kind,
                        metadata.ingestion_type
                    );
                }
                mode => assert!(
                    matches!(result, Err(ConnectorError::Unsupported { .. })),
                    "'{}.{table}': deletes must be unsupported for {mode}",
                    case.kind
                ),
            }
        }
    }
}

#[tokio::test]
async fn unknown_table_is_a_configuration_error() {
    for case in connector_cases() {
        let error = case
            .connector
            .read_table("no_such_table", None, &case.options)
            .await
            .expect_err("unknown table");
        assert!(
            matches!(error, ConnectorError::Config(_)),
            "connector '{}': expected config error, got {error}",
            case.kind
        );
    }
}
