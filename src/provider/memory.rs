use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{CalendarId, Span, TimeZoneSpec};

use super::{BusyProvider, CalendarWriter, CreatedEvent, NewCalendarEvent, ProviderError};

/// Calendar backend held entirely in memory. Created events mark their span busy.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    busy: DashMap<CalendarId, Vec<Span>>,
    failures: DashMap<CalendarId, ProviderError>,
    delays: DashMap<CalendarId, Duration>,
    events: DashMap<CalendarId, Vec<NewCalendarEvent>>,
    fetches: AtomicUsize,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_busy(&self, identity: CalendarId, span: Span) {
        self.busy.entry(identity).or_default().push(span);
    }

    /// Make every lookup for `identity` fail with `error`.
    pub fn fail_with(&self, identity: CalendarId, error: ProviderError) {
        self.failures.insert(identity, error);
    }

    /// Delay every lookup for `identity`.
    pub fn delay(&self, identity: CalendarId, delay: Duration) {
        self.delays.insert(identity, delay);
    }

    /// Number of busy lookups served so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn created_events(&self, identity: &CalendarId) -> Vec<NewCalendarEvent> {
        self.events
            .get(identity)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BusyProvider for InMemoryCalendar {
    async fn busy_intervals(
        &self,
        identity: &CalendarId,
        window: Span,
        _time_zone: &TimeZoneSpec,
    ) -> Result<Vec<Span>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.get(identity).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.get(identity) {
            return Err(error.value().clone());
        }
        Ok(self
            .busy
            .get(identity)
            .map(|spans| spans.iter().copied().filter(|s| s.overlaps(&window)).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CalendarWriter for InMemoryCalendar {
    async fn create_event(
        &self,
        identity: &CalendarId,
        event: &NewCalendarEvent,
    ) -> Result<CreatedEvent, ProviderError> {
        if let Some(error) = self.failures.get(identity) {
            return Err(error.value().clone());
        }
        self.add_busy(identity.clone(), event.span);
        self.events.entry(identity.clone()).or_default().push(event.clone());
        Ok(CreatedEvent {
            event_id: Ulid::new().to_string(),
            html_link: None,
            conference_link: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(span: Span) -> NewCalendarEvent {
        NewCalendarEvent {
            summary: "Meeting".into(),
            description: String::new(),
            span,
            time_zone: TimeZoneSpec::utc(),
            attendees: vec!["guest@example.com".into()],
            conference_request_id: "req-1".into(),
        }
    }

    #[tokio::test]
    async fn busy_lookup_filters_to_window() {
        let cal = InMemoryCalendar::new();
        let id = CalendarId::new("a");
        cal.add_busy(id.clone(), Span::new(0, 100));
        cal.add_busy(id.clone(), Span::new(500, 600));
        let spans = cal
            .busy_intervals(&id, Span::new(50, 400), &TimeZoneSpec::utc())
            .await
            .unwrap();
        assert_eq!(spans, vec![Span::new(0, 100)]);
        assert_eq!(cal.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_identity_is_free() {
        let cal = InMemoryCalendar::new();
        let spans = cal
            .busy_intervals(&CalendarId::new("nobody"), Span::new(0, 10), &TimeZoneSpec::utc())
            .await
            .unwrap();
        assert!(spans.is_empty());
    }

    #[tokio::test]
    async fn injected_failure_is_returned() {
        let cal = InMemoryCalendar::new();
        let id = CalendarId::new("broken");
        cal.fail_with(id.clone(), ProviderError::Unauthorized("expired".into()));
        let err = cal
            .busy_intervals(&id, Span::new(0, 10), &TimeZoneSpec::utc())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Unauthorized("expired".into()));
    }

    #[tokio::test]
    async fn created_event_becomes_busy() {
        let cal = InMemoryCalendar::new();
        let id = CalendarId::new("host");
        let created = cal.create_event(&id, &event(Span::new(100, 200))).await.unwrap();
        assert!(!created.event_id.is_empty());
        assert_eq!(cal.created_events(&id).len(), 1);
        let spans = cal
            .busy_intervals(&id, Span::new(0, 1000), &TimeZoneSpec::utc())
            .await
            .unwrap();
        assert_eq!(spans, vec![Span::new(100, 200)]);
    }
}
