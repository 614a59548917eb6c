//! External calendar collaborators: busy-time lookup and event creation.

pub mod google;
pub mod memory;

pub use google::GoogleCalendar;
pub use memory::InMemoryCalendar;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{CalendarId, Span, TimeZoneSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No bearer token was handed over for this identity.
    MissingCredential(CalendarId),
    Unauthorized(String),
    NotFound(CalendarId),
    /// The provider answered but refused this calendar.
    Rejected(String),
    Api { status: u16, body: String },
    Http(String),
    Decode(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::MissingCredential(id) => write!(f, "no credential for {id}"),
            ProviderError::Unauthorized(body) => write!(f, "unauthorized: {body}"),
            ProviderError::NotFound(id) => write!(f, "calendar not found: {id}"),
            ProviderError::Rejected(reason) => write!(f, "rejected: {reason}"),
            ProviderError::Api { status, body } => write!(f, "provider error ({status}): {body}"),
            ProviderError::Http(e) => write!(f, "request failed: {e}"),
            ProviderError::Decode(e) => write!(f, "bad response: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Busy time for one calendar identity.
#[async_trait]
pub trait BusyProvider: Send + Sync {
    /// Busy intervals intersecting `window`. Intervals outside the window are
    /// tolerated by callers.
    async fn busy_intervals(
        &self,
        identity: &CalendarId,
        window: Span,
        time_zone: &TimeZoneSpec,
    ) -> Result<Vec<Span>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCalendarEvent {
    pub summary: String,
    pub description: String,
    pub span: Span,
    pub time_zone: TimeZoneSpec,
    pub attendees: Vec<String>,
    /// Idempotency key for the generated video-conference link.
    pub conference_request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEvent {
    pub event_id: String,
    pub html_link: Option<String>,
    pub conference_link: Option<String>,
}

#[async_trait]
pub trait CalendarWriter: Send + Sync {
    async fn create_event(
        &self,
        identity: &CalendarId,
        event: &NewCalendarEvent,
    ) -> Result<CreatedEvent, ProviderError>;
}

/// Everything the engine needs from an external calendar system.
pub trait CalendarBackend: BusyProvider + CalendarWriter {}

impl<T: BusyProvider + CalendarWriter> CalendarBackend for T {}

/// Bearer tokens handed to the service per identity. Never refreshed or persisted here.
#[derive(Debug, Default)]
pub struct Credentials {
    tokens: DashMap<CalendarId, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: CalendarId, token: String) {
        self.tokens.insert(identity, token);
    }

    pub fn remove(&self, identity: &CalendarId) -> bool {
        self.tokens.remove(identity).is_some()
    }

    pub fn get(&self, identity: &CalendarId) -> Option<String> {
        self.tokens.get(identity).map(|t| t.value().clone())
    }
}
