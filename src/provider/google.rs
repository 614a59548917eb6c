//! Google Calendar backend: freeBusy lookups and event creation with a Meet link.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{CalendarId, Span, TimeZoneSpec};

use super::{BusyProvider, CalendarWriter, CreatedEvent, Credentials, NewCalendarEvent, ProviderError};

pub const GOOGLE_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

pub struct GoogleCalendar {
    client: Client,
    base_url: String,
    credentials: Arc<Credentials>,
}

impl GoogleCalendar {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            client: Client::new(),
            base_url: GOOGLE_CALENDAR_API_BASE.to_string(),
            credentials,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn token(&self, identity: &CalendarId) -> Result<String, ProviderError> {
        self.credentials
            .get(identity)
            .ok_or_else(|| ProviderError::MissingCredential(identity.clone()))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| ProviderError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Http(format!("base url cannot hold a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(ProviderError::Unauthorized(body))
    } else {
        Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_instant(s: &str) -> Result<i64, ProviderError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ProviderError::Decode(format!("bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl BusyProvider for GoogleCalendar {
    async fn busy_intervals(
        &self,
        identity: &CalendarId,
        window: Span,
        time_zone: &TimeZoneSpec,
    ) -> Result<Vec<Span>, ProviderError> {
        let token = self.token(identity)?;
        let body = FreeBusyRequest {
            time_min: time_zone.format(window.start),
            time_max: time_zone.format(window.end),
            time_zone: time_zone.iana_name(),
            items: vec![FreeBusyItem {
                id: identity.as_str(),
            }],
        };
        debug!(identity = %identity, time_min = %body.time_min, time_max = %body.time_max, "querying freeBusy");

        let response = self
            .client
            .post(self.endpoint(&["freeBusy"])?)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let mut parsed: FreeBusyResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let calendar = parsed
            .calendars
            .remove(identity.as_str())
            .ok_or_else(|| ProviderError::NotFound(identity.clone()))?;
        if let Some(error) = calendar.errors.first() {
            return Err(ProviderError::Rejected(error.reason.clone()));
        }

        let mut spans = Vec::with_capacity(calendar.busy.len());
        for range in &calendar.busy {
            let start = parse_instant(&range.start)?;
            let end = parse_instant(&range.end)?;
            match Span::try_new(start, end) {
                Some(span) => spans.push(span),
                None => warn!(identity = %identity, start = %range.start, end = %range.end, "skipping empty busy range"),
            }
        }
        Ok(spans)
    }
}

#[async_trait]
impl CalendarWriter for GoogleCalendar {
    async fn create_event(
        &self,
        identity: &CalendarId,
        event: &NewCalendarEvent,
    ) -> Result<CreatedEvent, ProviderError> {
        let token = self.token(identity)?;
        let tz_name = event.time_zone.iana_name();
        let body = serde_json::json!({
            "summary": event.summary,
            "description": event.description,
            "start": { "dateTime": event.time_zone.format(event.span.start), "timeZone": tz_name },
            "end": { "dateTime": event.time_zone.format(event.span.end), "timeZone": tz_name },
            "attendees": event.attendees.iter().map(|email| serde_json::json!({ "email": email })).collect::<Vec<_>>(),
            "conferenceData": {
                "createRequest": {
                    "requestId": event.conference_request_id,
                    "conferenceSolutionKey": { "type": "hangoutsMeet" }
                }
            }
        });

        let response = self
            .client
            .post(self.endpoint(&["calendars", identity.as_str(), "events"])?)
            .query(&[("sendUpdates", "all"), ("conferenceDataVersion", "1")])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let inserted: InsertedEvent = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(CreatedEvent {
            event_id: inserted.id,
            html_link: inserted.html_link,
            conference_link: inserted.hangout_link,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FreeBusyRequest<'a> {
    time_min: String,
    time_max: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_zone: Option<&'a str>,
    items: Vec<FreeBusyItem<'a>>,
}

#[derive(Debug, Serialize)]
struct FreeBusyItem<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct FreeBusyResponse {
    #[serde(default)]
    calendars: HashMap<String, FreeBusyCalendar>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyCalendar {
    #[serde(default)]
    busy: Vec<BusyRange>,
    #[serde(default)]
    errors: Vec<FreeBusyError>,
}

#[derive(Debug, Deserialize)]
struct BusyRange {
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct FreeBusyError {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertedEvent {
    id: String,
    html_link: Option<String>,
    hangout_link: Option<String>,
}
