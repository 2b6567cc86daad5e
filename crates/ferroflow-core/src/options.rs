//! Parsing helpers that turn string option maps into typed option structs.
//!
//! Connectors call these once, up front, so every malformed or missing
//! option is reported before any network I/O happens.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use time::OffsetDateTime;

use crate::error::ConfigError;
use crate::offset::parse_instant;

/// Raw option map as supplied by the orchestrator.
pub type OptionMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    Table(&'a str),
    Connection,
}

/// Read-only view over an [`OptionMap`] that produces [`ConfigError`]s naming
/// the table (or connection) the option belongs to.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions<'a> {
    scope: Scope<'a>,
    raw: &'a OptionMap,
}

impl<'a> TableOptions<'a> {
    pub fn new(table: &'a str, raw: &'a OptionMap) -> Self {
        Self {
            scope: Scope::Table(table),
            raw,
        }
    }

    pub fn connection(raw: &'a OptionMap) -> Self {
        Self {
            scope: Scope::Connection,
            raw,
        }
    }

    /// Trimmed value, treating blank strings as absent.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.raw
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// First present key among aliases.
    pub fn get_any(&self, keys: &[&str]) -> Option<&'a str> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn required(&self, key: &str) -> Result<&'a str, ConfigError> {
        self.get(key).ok_or_else(|| self.missing(&[key]))
    }

    /// Validates that every key is present, reporting all missing keys at once.
    pub fn require_all(&self, keys: &[&str]) -> Result<Vec<&'a str>, ConfigError> {
        let missing = keys
            .iter()
            .copied()
            .filter(|key| self.get(key).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(self.missing(&missing));
        }
        Ok(keys.iter().filter_map(|key| self.get(key)).collect())
    }

    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|e| ConfigError::invalid_option(key, value, e.to_string()))
            })
            .transpose()
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "on" => Ok(true),
                "false" | "0" | "no" | "n" | "off" => Ok(false),
                _ => Err(ConfigError::invalid_option(key, value, "expected a boolean")),
            },
        }
    }

    /// Comma-separated list, blanks dropped. A JSON array is accepted too.
    pub fn list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(Vec::new());
        };
        if value.starts_with('[') {
            return serde_json::from_str::<Vec<String>>(value).map_err(|_| {
                ConfigError::InvalidJson {
                    option: key.to_owned(),
                    value: value.to_owned(),
                }
            });
        }
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn json(&self, key: &str) -> Result<Option<serde_json::Value>, ConfigError> {
        self.get(key)
            .map(|value| {
                serde_json::from_str(value).map_err(|_| ConfigError::InvalidJson {
                    option: key.to_owned(),
                    value: value.to_owned(),
                })
            })
            .transpose()
    }

    /// RFC 3339 timestamp or `YYYY-MM-DD` date (midnight UTC).
    pub fn instant(&self, key: &str) -> Result<Option<OffsetDateTime>, ConfigError> {
        self.get(key)
            .map(|value| {
                parse_instant(value).ok_or_else(|| {
                    ConfigError::invalid_option(key, value, "expected an RFC 3339 timestamp or YYYY-MM-DD date")
                })
            })
            .transpose()
    }

    fn missing(&self, keys: &[&str]) -> ConfigError {
        match self.scope {
            Scope::Table(table) => ConfigError::missing_options(table, keys),
            Scope::Connection => ConfigError::MissingConnectionOption {
                option: keys.join(", "),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> OptionMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn require_all_reports_every_missing_key() {
        let raw = map(&[("owner", " ")]);
        let options = TableOptions::new("issues", &raw);

        let error = options.require_all(&["owner", "repo"]).expect_err("missing");

        assert_eq!(
            error,
            ConfigError::missing_options("issues", &["owner", "repo"])
        );
    }

    #[test]
    fn connection_scope_reports_connection_option() {
        let raw = OptionMap::new();

        let error = TableOptions::connection(&raw)
            .required("client_id")
            .expect_err("missing");

        assert_eq!(error.to_string(), "connection option 'client_id' is required");
    }

    #[test]
    fn parse_reports_offending_value() {
        let raw = map(&[("per_page", "lots")]);

        let error = TableOptions::new("issues", &raw)
            .parse::<u32>("per_page")
            .expect_err("not a number");

        assert!(error.to_string().contains("'lots'"));
        assert!(error.to_string().contains("per_page"));
    }

    #[test]
    fn list_accepts_csv_and_json_arrays() {
        let raw = map(&[("a", "x, y,,z"), ("b", r#"["1","2"]"#)]);
        let options = TableOptions::new("t", &raw);

        assert_eq!(options.list("a").expect("csv"), vec!["x", "y", "z"]);
        assert_eq!(options.list("b").expect("json"), vec!["1", "2"]);
        assert!(options.list("missing").expect("empty").is_empty());
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let raw = map(&[("dimension_filter", "{not json")]);

        let error = TableOptions::new("report", &raw)
            .json("dimension_filter")
            .expect_err("invalid");

        assert!(matches!(error, ConfigError::InvalidJson { .. }));
    }

    #[test]
    fn flag_understands_common_spellings() {
        let raw = map(&[("a", "TRUE"), ("b", "0"), ("c", "maybe")]);
        let options = TableOptions::new("t", &raw);

        assert!(options.flag("a", false).expect("bool"));
        assert!(!options.flag("b", true).expect("bool"));
        assert!(options.flag("missing", true).expect("default"));
        assert!(options.flag("c", true).is_err());
    }
}
