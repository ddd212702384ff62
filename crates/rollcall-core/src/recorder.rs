//! Attendance Recorder: turns confirmations into at-most-one event per
//! (person, session window).

use crate::types::PersonId;
use chrono::{Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc;

/// A bounded period within which attendance is deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionWindow(String);

impl SessionWindow {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Calendar-day window, e.g. `2026-10-16`.
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    /// Local calendar day containing `timestamp_ms` (Unix epoch milliseconds).
    pub fn daily_local(timestamp_ms: u64) -> Self {
        let date = i64::try_from(timestamp_ms)
            .ok()
            .and_then(|ms| Local.timestamp_millis_opt(ms).single())
            .map(|dt| dt.date_naive())
            .unwrap_or_else(|| Local::now().date_naive());
        Self::for_date(date)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub person_id: PersonId,
    /// Time of the confirming frame, Unix epoch milliseconds.
    pub timestamp_ms: u64,
    pub window: SessionWindow,
}

/// Deduplicates confirmations within the current window.
///
/// A confirmation for a different window rolls the recorder over and clears
/// the set of people already recorded.
#[derive(Debug, Default)]
pub struct AttendanceRecorder {
    window: Option<SessionWindow>,
    recorded: HashSet<PersonId>,
    sink: Option<mpsc::UnboundedSender<AttendanceEvent>>,
}

impl AttendanceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder plus the receiving end of its event stream.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AttendanceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Self {
            sink: Some(tx),
            ..Self::default()
        };
        (recorder, rx)
    }

    pub fn window(&self) -> Option<&SessionWindow> {
        self.window.as_ref()
    }

    pub fn has_recorded(&self, person_id: &PersonId) -> bool {
        self.recorded.contains(person_id)
    }

    fn roll_to(&mut self, window: &SessionWindow) {
        if self.window.as_ref() == Some(window) {
            return;
        }
        tracing::info!(
            previous = ?self.window.as_ref().map(SessionWindow::as_str),
            current = %window,
            recorded = self.recorded.len(),
            "session window rolled over"
        );
        self.window = Some(window.clone());
        self.recorded.clear();
    }

    /// Seed the window with people already recorded (e.g. loaded from storage
    /// after a restart) so they are not emitted again.
    pub fn restore(&mut self, window: &SessionWindow, people: impl IntoIterator<Item = PersonId>) {
        self.roll_to(window);
        self.recorded.extend(people);
    }

    /// Emit an event the first time `person_id` is confirmed in `window`.
    pub fn on_confirmed(
        &mut self,
        person_id: &PersonId,
        timestamp_ms: u64,
        window: &SessionWindow,
    ) -> Option<AttendanceEvent> {
        self.roll_to(window);
        if !self.recorded.insert(person_id.clone()) {
            tracing::debug!(person = %person_id, window = %window, "attendance already recorded");
            return None;
        }

        let event = AttendanceEvent {
            person_id: person_id.clone(),
            timestamp_ms,
            window: window.clone(),
        };
        tracing::info!(person = %person_id, window = %window, timestamp_ms, "attendance recorded");

        if let Some(sink) = &self.sink {
            if sink.send(event.clone()).is_err() {
                tracing::debug!("attendance subscriber dropped; event not forwarded");
            }
        }
        Some(event)
    }
}
