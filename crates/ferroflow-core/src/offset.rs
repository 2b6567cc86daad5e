//! Resumption offsets and the rules that derive the next offset from a batch.
//!
//! | State | Condition | Lower bound for the next fetch |
//! |-------|-----------|--------------------------------|
//! | `Initial` | no offset, or the resume key is absent | `start_date` option, else a lookback window from now |
//! | `Resuming` | the resume key is present | the stored cursor value |
//! | exhausted | no records while resuming | the same offset is returned unchanged |
//!
//! | Mode | Next offset |
//! |------|-------------|
//! | `snapshot` | `{}` or the `{"offset":"done"}` sentinel |
//! | `append` | max cursor, or the previous offset when nothing was read |
//! | `cdc`, `cdc_with_deletes` | max cursor minus the lookback window |

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::table::IngestionMode;

/// Key of the snapshot sentinel and of time-windowed offsets.
pub const WINDOW_KEY: &str = "offset";
/// Value marking a snapshot table whose full pass already ran.
pub const SNAPSHOT_DONE: &str = "done";

/// Opaque resumption token persisted by the orchestrator between reads.
///
/// An empty offset is a valid value; "no offset yet" is expressed as
/// `Option::<&Offset>::None` by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(BTreeMap<String, String>);

impl Offset {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(key.into(), value.into());
        Self(entries)
    }

    /// Sentinel returned by snapshot tables after a full pass.
    pub fn done() -> Self {
        Self::single(WINDOW_KEY, SNAPSHOT_DONE)
    }

    pub fn is_done(&self) -> bool {
        self.get(WINDOW_KEY) == Some(SNAPSHOT_DONE)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl<K, V> FromIterator<(K, V)> for Offset
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rendered = serde_json::to_string(&self.0).map_err(|_| std::fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Where a read resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState<'a> {
    Initial,
    Resuming(&'a str),
}

impl<'a> ResumeState<'a> {
    pub fn from_offset(offset: Option<&'a Offset>, key: &str) -> Self {
        match offset.and_then(|offset| offset.get(key)) {
            Some(value) => Self::Resuming(value),
            None => Self::Initial,
        }
    }

    pub fn cursor(self) -> Option<&'a str> {
        match self {
            Self::Initial => None,
            Self::Resuming(cursor) => Some(cursor),
        }
    }
}

/// A cursor column value interpreted for ordering and lookback arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorValue {
    Timestamp(OffsetDateTime),
    Date(Date),
    Sequence(u128),
    Text(String),
}

impl CursorValue {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(date) = parse_date(raw) {
            return Self::Date(date);
        }
        if let Ok(timestamp) = OffsetDateTime::parse(raw, &Rfc3339) {
            return Self::Timestamp(timestamp.to_offset(UtcOffset::UTC));
        }
        if let Ok(sequence) = raw.parse::<u128>() {
            return Self::Sequence(sequence);
        }
        Self::Text(raw.to_owned())
    }

    /// Moves the value back by `lookback`. Values without a time axis are
    /// returned unchanged.
    pub fn minus(&self, lookback: Duration) -> Self {
        match self {
            Self::Timestamp(timestamp) => Self::Timestamp(
                timestamp
                    .checked_sub(lookback)
                    .unwrap_or(*timestamp),
            ),
            Self::Date(date) => Self::Date(date.checked_sub(lookback).unwrap_or(*date)),
            other => other.clone(),
        }
    }

    pub fn plus(&self, step: Duration) -> Self {
        match self {
            Self::Timestamp(timestamp) => {
                Self::Timestamp(timestamp.checked_add(step).unwrap_or(*timestamp))
            }
            Self::Date(date) => Self::Date(date.checked_add(step).unwrap_or(*date)),
            other => other.clone(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Timestamp(timestamp) => format_timestamp(*timestamp),
            Self::Date(date) => format_date(*date),
            Self::Sequence(sequence) => sequence.to_string(),
            Self::Text(text) => text.clone(),
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Sequence(a), Self::Sequence(b)) => a.cmp(b),
            (a, b) => a.render().cmp(&b.render()),
        }
    }
}

/// Running maximum of the cursor column over one read.
#[derive(Debug, Clone, Default)]
pub struct CursorTracker {
    max: Option<(CursorValue, String)>,
    records: usize,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a record, whether or not it carries a cursor value.
    pub fn record(&mut self) {
        self.records += 1;
    }

    pub fn observe(&mut self, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        let candidate = CursorValue::parse(raw);
        let replace = match &self.max {
            None => true,
            Some((current, _)) => candidate.compare(current) == Ordering::Greater,
        };
        if replace {
            self.max = Some((candidate, raw.trim().to_owned()));
        }
    }

    /// Counts a JSON record and observes its `field` (string or number).
    pub fn observe_record(&mut self, record: &serde_json::Map<String, serde_json::Value>, field: &str) {
        self.record();
        match record.get(field) {
            Some(serde_json::Value::String(value)) => self.observe(value),
            Some(serde_json::Value::Number(value)) => self.observe(&value.to_string()),
            _ => {}
        }
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn max_value(&self) -> Option<&CursorValue> {
        self.max.as_ref().map(|(value, _)| value)
    }

    pub fn max_raw(&self) -> Option<&str> {
        self.max.as_ref().map(|(_, raw)| raw.as_str())
    }
}

/// How a snapshot table reports a completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOffset {
    /// Always `{}`.
    Empty,
    /// `{"offset":"done"}`; a read with that offset returns no records.
    Sentinel,
}

impl SnapshotOffset {
    pub fn terminal(self) -> Offset {
        match self {
            Self::Empty => Offset::empty(),
            Self::Sentinel => Offset::done(),
        }
    }

    /// True when `input` says the full pass already happened.
    pub fn already_done(self, input: Option<&Offset>) -> bool {
        self == Self::Sentinel && input.is_some_and(Offset::is_done)
    }
}

/// Next-offset rules for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorProtocol {
    pub key: &'static str,
    pub lookback: Duration,
    pub snapshot: SnapshotOffset,
}

impl CursorProtocol {
    pub const fn new(key: &'static str, lookback: Duration) -> Self {
        Self {
            key,
            lookback,
            snapshot: SnapshotOffset::Empty,
        }
    }

    pub const fn with_snapshot(mut self, snapshot: SnapshotOffset) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn next_offset(
        &self,
        mode: IngestionMode,
        input: Option<&Offset>,
        tracker: &CursorTracker,
    ) -> Offset {
        match mode {
            IngestionMode::Snapshot => self.snapshot.terminal(),
            IngestionMode::Append => match tracker.max_raw() {
                Some(max) if tracker.records() > 0 => Offset::single(self.key, max),
                _ => carry_forward(input),
            },
            IngestionMode::Cdc | IngestionMode::CdcWithDeletes => {
                if tracker.records() == 0 {
                    if let Some(input) = input {
                        return input.clone();
                    }
                }
                self.advance(tracker).unwrap_or_else(|| carry_forward(input))
            }
        }
    }

    /// Cursor offset derived from the tracked maximum alone, lookback
    /// applied. Values observed without a record (e.g. a carried high-water
    /// mark) count.
    pub fn advance(&self, tracker: &CursorTracker) -> Option<Offset> {
        let max = tracker.max_value()?;
        Some(Offset::single(self.key, self.lookback_cursor(max, tracker)))
    }

    fn lookback_cursor(&self, max: &CursorValue, tracker: &CursorTracker) -> String {
        match max {
            CursorValue::Timestamp(_) | CursorValue::Date(_) => max.minus(self.lookback).render(),
            // Unparsable maxima are used verbatim.
            _ => tracker.max_raw().map(str::to_owned).unwrap_or_else(|| max.render()),
        }
    }
}

fn carry_forward(input: Option<&Offset>) -> Offset {
    input.cloned().unwrap_or_default()
}

/// Offset for a time-windowed read that covered `[start, end)`.
pub fn window_offset(end: OffsetDateTime) -> Offset {
    Offset::single(WINDOW_KEY, format_timestamp(end))
}

/// RFC 3339 in UTC with a `Z` suffix; fractional seconds only when non-zero.
pub fn format_timestamp(timestamp: OffsetDateTime) -> String {
    let utc = timestamp.to_offset(UtcOffset::UTC);
    utc.format(&Rfc3339)
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

pub fn format_date(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| date.to_string())
}

fn parse_date(raw: &str) -> Option<Date> {
    if raw.len() != 10 {
        return None;
    }
    Date::parse(raw, format_description!("[year]-[month]-[day]")).ok()
}

/// Parses an RFC 3339 timestamp or a `YYYY-MM-DD` date (as midnight UTC).
pub fn parse_instant(raw: &str) -> Option<OffsetDateTime> {
    match CursorValue::parse(raw) {
        CursorValue::Timestamp(timestamp) => Some(timestamp),
        CursorValue::Date(date) => Some(date.midnight().assume_utc()),
        CursorValue::Sequence(_) | CursorValue::Text(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(values: &[&str]) -> CursorTracker {
        let mut tracker = CursorTracker::new();
        for value in values {
            tracker.record();
            tracker.observe(value);
        }
        tracker
    }

    const CDC: CursorProtocol = CursorProtocol::new("cursor", Duration::seconds(300));

    #[test]
    fn resume_state_distinguishes_absent_and_present_cursor() {
        let offset = Offset::single("cursor", "2024-01-01T00:00:00Z");

        assert_eq!(ResumeState::from_offset(None, "cursor"), ResumeState::Initial);
        assert_eq!(
            ResumeState::from_offset(Some(&Offset::empty()), "cursor"),
            ResumeState::Initial
        );
        assert_eq!(
            ResumeState::from_offset(Some(&offset), "cursor"),
            ResumeState::Resuming("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn cdc_subtracts_lookback_from_max_cursor() {
        let tracker = tracker_with(&[
            "2024-01-01T00:00:00Z",
            "2024-01-03T00:00:00Z",
            "2024-01-02T00:00:00Z",
        ]);

        let next = CDC.next_offset(IngestionMode::Cdc, None, &tracker);

        assert_eq!(next, Offset::single("cursor", "2024-01-02T23:55:00Z"));
    }

    #[test]
    fn cdc_without_records_returns_input_offset() {
        let input = Offset::single("cursor", "2024-01-02T23:55:00Z");

        let next = CDC.next_offset(IngestionMode::Cdc, Some(&input), &CursorTracker::new());

        assert_eq!(next, input);
    }

    #[test]
    fn advance_counts_values_observed_without_records() {
        let mut tracker = CursorTracker::new();
        tracker.observe("2024-01-03T00:00:00Z");

        assert_eq!(tracker.records(), 0);
        assert_eq!(
            CDC.advance(&tracker),
            Some(Offset::single("cursor", "2024-01-02T23:55:00Z"))
        );
        assert_eq!(CDC.advance(&CursorTracker::new()), None);
    }

    #[test]
    fn cdc_first_run_without_records_is_empty() {
        let next = CDC.next_offset(IngestionMode::Cdc, None, &CursorTracker::new());

        assert!(next.is_empty());
    }

    #[test]
    fn unparsable_cursor_is_used_verbatim() {
        let tracker = tracker_with(&["rev-b", "rev-a"]);

        let next = CDC.next_offset(IngestionMode::Cdc, None, &tracker);

        assert_eq!(next, Offset::single("cursor", "rev-b"));
    }

    #[test]
    fn sequence_ids_compare_numerically() {
        let tracker = tracker_with(&["999", "1000", "87"]);

        assert_eq!(tracker.max_raw(), Some("1000"));
        let protocol = CursorProtocol::new("historyId", Duration::seconds(300));
        assert_eq!(
            protocol.next_offset(IngestionMode::CdcWithDeletes, None, &tracker),
            Offset::single("historyId", "1000")
        );
    }

    #[test]
    fn append_uses_exact_max_and_carries_cursor_forward() {
        let protocol = CursorProtocol::new("cursor", Duration::seconds(300));
        let tracker = tracker_with(&["2024-01-01T00:00:00Z", "2024-01-05T10:00:00Z"]);
        let input = Offset::single("cursor", "2023-12-31T00:00:00Z");

        assert_eq!(
            protocol.next_offset(IngestionMode::Append, Some(&input), &tracker),
            Offset::single("cursor", "2024-01-05T10:00:00Z")
        );
        assert_eq!(
            protocol.next_offset(IngestionMode::Append, Some(&input), &CursorTracker::new()),
            input
        );
    }

    #[test]
    fn snapshot_offsets_ignore_records() {
        let tracker = tracker_with(&["2024-01-01T00:00:00Z"]);
        let sentinel = CDC.with_snapshot(SnapshotOffset::Sentinel);

        assert!(CDC
            .next_offset(IngestionMode::Snapshot, None, &tracker)
            .is_empty());
        assert_eq!(
            sentinel.next_offset(IngestionMode::Snapshot, None, &tracker),
            Offset::done()
        );
        assert!(SnapshotOffset::Sentinel.already_done(Some(&Offset::done())));
        assert!(!SnapshotOffset::Empty.already_done(Some(&Offset::done())));
    }

    #[test]
    fn date_cursors_subtract_whole_days() {
        let protocol = CursorProtocol::new("last_date", Duration::days(3));
        let tracker = tracker_with(&["2024-03-01", "2024-03-10"]);

        assert_eq!(
            protocol.next_offset(IngestionMode::Cdc, None, &tracker),
            Offset::single("last_date", "2024-03-07")
        );
    }

    #[test]
    fn timestamps_render_fraction_only_when_present() {
        let whole = parse_instant("2024-01-01T00:00:00Z").expect("valid");
        let fractional = whole + Duration::microseconds(1);

        assert_eq!(format_timestamp(whole), "2024-01-01T00:00:00Z");
        assert_eq!(format_timestamp(fractional), "2024-01-01T00:00:00.000001Z");
    }

    #[test]
    fn offsets_serialize_as_flat_maps() {
        let offset = Offset::single("cursor", "2024-01-01T00:00:00Z");

        assert_eq!(offset.to_string(), r#"{"cursor":"2024-01-01T00:00:00Z"}"#);
        let parsed: Offset = serde_json::from_str(r#"{"offset":"done"}"#).expect("valid");
        assert!(parsed.is_done());
    }
}
