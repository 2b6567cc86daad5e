use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connector::Connector;
use crate::connectors::{
    GithubConnector, GmailConnector, GoogleAnalyticsConnector, OsipiConnector, SurveymonkeyConnector,
};
use crate::error::{ConfigError, ConnectorError};
use crate::http_client::HttpClient;
use crate::options::OptionMap;

/// Upstream systems a connector can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Github,
    Gmail,
    Osipi,
    GoogleAnalytics,
    Surveymonkey,
}

impl SourceKind {
    pub const ALL: [Self; 5] = [
        Self::Github,
        Self::Gmail,
        Self::Osipi,
        Self::GoogleAnalytics,
        Self::Surveymonkey,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gmail => "gmail",
            Self::Osipi => "osipi",
            Self::GoogleAnalytics => "google_analytics",
            Self::Surveymonkey => "surveymonkey",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "github" => Ok(Self::Github),
            "gmail" => Ok(Self::Gmail),
            "osipi" | "pi" => Ok(Self::Osipi),
            "google_analytics" | "google_analytics_aggregated" | "ga4" => Ok(Self::GoogleAnalytics),
            "surveymonkey" | "survey_monkey" => Ok(Self::Surveymonkey),
            _ => Err(ConfigError::invalid_option(
                "source",
                value,
                "expected one of github, gmail, osipi, google_analytics, surveymonkey",
            )),
        }
    }
}

/// Builds the connector for `kind` from its connection options.
///
/// Options are validated here, so a misconfigured source fails before any
/// table is read.
pub fn connect(
    kind: SourceKind,
    options: &OptionMap,
    http_client: Arc<dyn HttpClient>,
) -> Result<Arc<dyn Connector>, ConnectorError> {
    let connector: Arc<dyn Connector> = match kind {
        SourceKind::Github => Arc::new(GithubConnector::new(http_client, options)?),
        SourceKind::Gmail => Arc::new(GmailConnector::new(http_client, options)?),
        SourceKind::Osipi => Arc::new(OsipiConnector::new(http_client, options)?),
        SourceKind::GoogleAnalytics => Arc::new(GoogleAnalyticsConnector::new(http_client, options)?),
        SourceKind::Surveymonkey => Arc::new(SurveymonkeyConnector::new(http_client, options)?),
    };
    tracing::debug!(source = %kind, tables = connector.list_tables().len(), "connector ready");
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().expect("round trip"), kind);
        }
        assert_eq!("Google-Analytics".parse::<SourceKind>().expect("alias"), SourceKind::GoogleAnalytics);
        assert_eq!("Survey-Monkey".parse::<SourceKind>().expect("alias"), SourceKind::Surveymonkey);
        assert!("jira".parse::<SourceKind>().is_err());
    }
}
