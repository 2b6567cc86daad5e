//! The connector facade invoked by the ingestion orchestrator.
//!
//! | Operation | Network | Result |
//! |-----------|---------|--------|
//! | [`Connector::list_tables`] | never | table names |
//! | [`Connector::get_table_schema`] | at most once per connector, cached | columns |
//! | [`Connector::read_table_metadata`] | never | primary keys, cursor field, ingestion type |
//! | [`Connector::read_table`] | yes | records plus the next offset |
//! | [`Connector::read_table_deletes`] | yes, `cdc_with_deletes` only | deleted keys plus the next offset |

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ConnectorError;
use crate::offset::Offset;
use crate::options::OptionMap;
use crate::table::{Column, IngestionMode, TableMetadata};

/// A self-describing record, not yet coerced to the declared column types.
pub type Record = Map<String, Value>;

/// Records of one read plus the offset to replay on the next read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadBatch {
    pub records: Vec<Record>,
    pub offset: Offset,
}

impl ReadBatch {
    pub fn new(records: Vec<Record>, offset: Offset) -> Self {
        Self { records, offset }
    }

    /// No records, the given offset.
    pub fn empty(offset: Offset) -> Self {
        Self::new(Vec::new(), offset)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when the read made no progress past `input`.
    pub fn is_exhausted(&self, input: Option<&Offset>) -> bool {
        input.is_some_and(|input| *input == self.offset)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector identifier, e.g. `github`.
    fn name(&self) -> &'static str;

    fn list_tables(&self) -> Vec<String>;

    async fn get_table_schema(
        &self,
        table: &str,
        options: &OptionMap,
    ) -> Result<Vec<Column>, ConnectorError>;

    async fn read_table_metadata(
        &self,
        table: &str,
        options: &OptionMap,
    ) -> Result<TableMetadata, ConnectorError>;

    /// Reads one bounded batch. `offset` is `None` on the first run and the
    /// previously returned offset afterwards. "No data" is an empty batch,
    /// never an error.
    async fn read_table(
        &self,
        table: &str,
        offset: Option<&Offset>,
        options: &OptionMap,
    ) -> Result<ReadBatch, ConnectorError>;

    /// Reads deletions for `cdc_with_deletes` tables. Connectors without a
    /// deletion feed return nothing for snapshot tables and fail otherwise.
    async fn read_table_deletes(
        &self,
        table: &str,
        _offset: Option<&Offset>,
        options: &OptionMap,
    ) -> Result<ReadBatch, ConnectorError> {
        let metadata = self.read_table_metadata(table, options).await?;
        match metadata.ingestion_type {
            IngestionMode::Snapshot => Ok(ReadBatch::empty(Offset::empty())),
            mode => Err(unsupported_deletes(table, mode)),
        }
    }
}

pub fn unsupported_deletes(table: &str, mode: IngestionMode) -> ConnectorError {
    ConnectorError::Unsupported {
        operation: "read_table_deletes",
        table: table.to_owned(),
        mode: mode.to_string(),
    }
}

/// Wraps a JSON value as a record; non-objects are rejected by callers
/// through [`crate::transport::expect_array`] before reaching here.
pub(crate) fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
