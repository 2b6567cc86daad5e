use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Sync semantics of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionMode {
    Snapshot,
    Append,
    Cdc,
    CdcWithDeletes,
}

impl IngestionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Append => "append",
            Self::Cdc => "cdc",
            Self::CdcWithDeletes => "cdc_with_deletes",
        }
    }

    /// Whether metadata reports a cursor field for this mode.
    pub const fn reports_cursor(self) -> bool {
        matches!(self, Self::Cdc | Self::CdcWithDeletes)
    }

    pub const fn applies_lookback(self) -> bool {
        matches!(self, Self::Cdc | Self::CdcWithDeletes)
    }

    pub const fn supports_deletes(self) -> bool {
        matches!(self, Self::CdcWithDeletes)
    }
}

impl Display for IngestionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic column type; coercion against it happens downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Long,
    Double,
    Boolean,
    Timestamp,
    Date,
    /// Nested JSON kept as-is.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            nullable: false,
            ..Self::new(name, column_type)
        }
    }
}

/// Builds a column list from `(name, type)` pairs; every column is nullable
/// unless it is part of the primary key.
pub fn columns(layout: &[(&str, ColumnType)], primary_keys: &[&str]) -> Vec<Column> {
    layout
        .iter()
        .map(|(name, column_type)| {
            if primary_keys.contains(name) {
                Column::required(*name, *column_type)
            } else {
                Column::new(*name, *column_type)
            }
        })
        .collect()
}

/// Static description of one logical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_keys: Vec<String>,
    pub mode: IngestionMode,
    pub cursor_field: Option<String>,
}

/// Violations of the descriptor invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("table '{table}' must declare at least one primary key")]
    NoPrimaryKey { table: String },
    #[error("table '{table}' primary key '{column}' is not a declared column")]
    UnknownKeyColumn { table: String, column: String },
    #[error("table '{table}' in {mode} mode must declare a cursor field")]
    MissingCursor { table: String, mode: IngestionMode },
    #[error("table '{table}' in {mode} mode must not declare a cursor field")]
    UnexpectedCursor { table: String, mode: IngestionMode },
    #[error("table '{table}' cursor field '{column}' is not a declared column")]
    UnknownCursorColumn { table: String, column: String },
}

impl TableDescriptor {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_keys: &[&str],
        mode: IngestionMode,
        cursor_field: Option<&str>,
    ) -> Result<Self, DescriptorError> {
        let descriptor = Self {
            name: name.into(),
            columns,
            primary_keys: primary_keys.iter().map(|key| (*key).to_owned()).collect(),
            mode,
            cursor_field: cursor_field.map(str::to_owned),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        let table = || self.name.clone();
        if self.primary_keys.is_empty() {
            return Err(DescriptorError::NoPrimaryKey { table: table() });
        }
        if let Some(column) = self.primary_keys.iter().find(|key| !self.has_column(key)) {
            return Err(DescriptorError::UnknownKeyColumn {
                table: table(),
                column: column.clone(),
            });
        }
        match (&self.cursor_field, self.mode.reports_cursor()) {
            (None, true) => Err(DescriptorError::MissingCursor {
                table: table(),
                mode: self.mode,
            }),
            (Some(_), false) => Err(DescriptorError::UnexpectedCursor {
                table: table(),
                mode: self.mode,
            }),
            (Some(cursor), true) if !self.has_column(cursor) => {
                Err(DescriptorError::UnknownCursorColumn {
                    table: table(),
                    column: cursor.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn metadata(&self) -> TableMetadata {
        TableMetadata {
            primary_keys: self.primary_keys.clone(),
            cursor_field: self.cursor_field.clone(),
            ingestion_type: self.mode,
        }
    }
}

/// Sync metadata reported to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub primary_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_field: Option<String>,
    pub ingestion_type: IngestionMode,
}
