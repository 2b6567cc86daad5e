//! Enum-keyed table dispatch.
//!
//! Each connector declares its tables as a closed enum implementing
//! [`TableKind`]; readers are selected with an exhaustive `match`, and the
//! descriptors are built once at construction into a [`TableCatalog`].

use crate::error::ConfigError;
use crate::table::{DescriptorError, TableDescriptor};

pub trait TableKind: Copy + Eq + Sized + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|kind| kind.name()).collect()
    }

    /// Fails with the offending name and the valid set.
    fn parse(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ConfigError::unknown_table(name, &Self::names()))
    }
}

/// Immutable descriptors for every table of one connector.
#[derive(Debug, Clone)]
pub struct TableCatalog<K> {
    entries: Vec<(K, TableDescriptor)>,
}

impl<K: TableKind> TableCatalog<K> {
    pub fn build(
        describe: impl Fn(K) -> Result<TableDescriptor, DescriptorError>,
    ) -> Result<Self, DescriptorError> {
        let entries = K::ALL
            .iter()
            .map(|kind| describe(*kind).map(|descriptor| (*kind, descriptor)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(_, descriptor)| descriptor.name.clone())
            .collect()
    }

    pub fn resolve(&self, name: &str) -> Result<(K, &TableDescriptor), ConfigError> {
        let kind = K::parse(name)?;
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map(|(kind, descriptor)| (*kind, descriptor))
            .ok_or_else(|| ConfigError::unknown_table(name, &K::names()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{columns, ColumnType, IngestionMode};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fruit {
        Apples,
        Pears,
    }

    impl TableKind for Fruit {
        const ALL: &'static [Self] = &[Self::Apples, Self::Pears];

        fn name(self) -> &'static str {
            match self {
                Self::Apples => "apples",
                Self::Pears => "pears",
            }
        }
    }

    fn catalog() -> TableCatalog<Fruit> {
        TableCatalog::build(|kind: Fruit| {
            TableDescriptor::new(
                kind.name(),
                columns(&[("id", ColumnType::Long)], &["id"]),
                &["id"],
                IngestionMode::Snapshot,
                None,
            )
        })
        .expect("valid catalog")
    }

    #[test]
    fn resolves_known_table() {
        let catalog = catalog();

        let (kind, descriptor) = catalog.resolve("pears").expect("known");

        assert_eq!(kind, Fruit::Pears);
        assert_eq!(descriptor.name, "pears");
    }

    #[test]
    fn unknown_table_names_value_and_valid_set() {
        let error = catalog().resolve("plums").expect_err("unknown");

        assert_eq!(
            error.to_string(),
            "unknown table 'plums', expected one of apples, pears"
        );
    }
}
