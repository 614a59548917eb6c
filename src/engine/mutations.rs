use chrono::Weekday;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::provider::NewCalendarEvent;

use super::aggregate::{FailureReason, ProviderFailure};
use super::conflict::{check_no_conflict, validate_span, validate_text};
use super::{Engine, EngineError, WalCommand};

fn check_window(weekday: Weekday, window: &DayWindow) -> Result<(), EngineError> {
    if window.is_well_formed() {
        Ok(())
    } else {
        Err(EngineError::InvalidWindow {
            weekday,
            start: window.start,
            end: window.end,
        })
    }
}

impl Engine {
    pub async fn set_day_window(&self, owner: &str, weekday: Weekday, window: DayWindow) -> Result<(), EngineError> {
        self.set_schedule(owner, vec![(weekday, window)]).await
    }

    /// Store several weekday windows at once. Nothing is written unless every window is valid.
    pub async fn set_schedule(&self, owner: &str, days: Vec<(Weekday, DayWindow)>) -> Result<(), EngineError> {
        for (weekday, window) in &days {
            check_window(*weekday, window)?;
        }
        let _gate = self.owner_gate.read().await;
        let os = self.get_or_create_owner(owner)?;
        let mut guard = os.write().await;
        for (weekday, window) in days {
            let event = Event::ScheduleDaySet {
                owner: owner.to_string(),
                weekday,
                window,
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        Ok(())
    }

    /// Forget every stored weekday; the owner falls back to the default window.
    pub async fn clear_schedule(&self, owner: &str) -> Result<(), EngineError> {
        let os = self
            .get_owner(owner)
            .ok_or_else(|| EngineError::UnknownOwner(owner.to_string()))?;
        let mut guard = os.write().await;
        let event = Event::ScheduleCleared { owner: owner.to_string() };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_member(&self, owner: &str, identity: CalendarId) -> Result<(), EngineError> {
        if identity.as_str().is_empty() {
            return Err(EngineError::InvalidInput("calendar identity is empty"));
        }
        validate_text(identity.as_str(), MAX_IDENTITY_LEN, "calendar identity too long")?;
        let _gate = self.owner_gate.read().await;
        let os = self.get_or_create_owner(owner)?;
        let mut guard = os.write().await;
        if guard.members.contains(&identity) {
            return Err(EngineError::AlreadyMember {
                owner: owner.to_string(),
                identity,
            });
        }
        if guard.members.len() >= MAX_MEMBERS_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many calendars on owner"));
        }
        let event = Event::MemberAdded {
            owner: owner.to_string(),
            identity,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_member(&self, owner: &str, identity: CalendarId) -> Result<(), EngineError> {
        let os = self
            .get_owner(owner)
            .ok_or_else(|| EngineError::UnknownOwner(owner.to_string()))?;
        let mut guard = os.write().await;
        if !guard.members.contains(&identity) {
            return Err(EngineError::NotMember {
                owner: owner.to_string(),
                identity,
            });
        }
        let event = Event::MemberRemoved {
            owner: owner.to_string(),
            identity,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// A guest asks for `span`. Rejected if it overlaps another pending or confirmed request.
    pub async fn submit_request(&self, id: Ulid, owner: &str, span: Span, guest: Guest) -> Result<(), EngineError> {
        validate_span(&span)?;
        if guest.email.trim().is_empty() {
            return Err(EngineError::InvalidInput("guest email is empty"));
        }
        validate_text(&guest.name, MAX_TEXT_LEN, "guest name too long")?;
        validate_text(&guest.email, MAX_TEXT_LEN, "guest email too long")?;
        if let Some(note) = &guest.note {
            validate_text(note, MAX_TEXT_LEN, "note too long")?;
        }
        if self.request_to_owner.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.owner_gate.read().await;
        let os = self.get_or_create_owner(owner)?;
        let mut guard = os.write().await;
        if guard.requests.len() >= MAX_REQUESTS_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many requests on owner"));
        }
        check_no_conflict(&guard, &span)?;

        // Claim the id under the owner lock; a concurrent submit with the same id loses here.
        match self.request_to_owner.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
            }
        }

        let event = Event::RequestSubmitted {
            id,
            owner: owner.to_string(),
            span,
            guest_name: guest.name,
            guest_email: guest.email,
            note: guest.note,
        };
        let result = self.persist_and_apply(&mut guard, &event).await;
        if result.is_err() {
            self.request_to_owner.remove(&id);
        }
        result
    }

    /// Write the meeting to the host's calendar, then mark the request confirmed.
    ///
    /// The owner stays write-locked across the calendar call so the same
    /// request cannot be confirmed twice.
    pub async fn approve_request(&self, id: Ulid) -> Result<BookingRequest, EngineError> {
        let mut guard = self.resolve_request_write(&id).await?;
        let request = guard.request(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::NotPending(id));
        }

        let host = guard
            .calendar_identities()
            .into_iter()
            .next()
            .ok_or(EngineError::InvalidInput("owner has no calendar"))?;
        let mut description = format!("Guest: {} <{}>", request.guest_name, request.guest_email);
        if let Some(note) = &request.note {
            description.push_str("\n\n");
            description.push_str(note);
        }
        let new_event = NewCalendarEvent {
            summary: format!("Meeting: {}", request.guest_name),
            description,
            span: request.span,
            time_zone: self.config.time_zone,
            attendees: vec![request.guest_email.clone()],
            conference_request_id: Ulid::new().to_string(),
        };

        let timeout = self.config.provider_timeout;
        let created = match tokio::time::timeout(timeout, self.calendar.create_event(&host, &new_event)).await {
            Ok(Ok(created)) => created,
            Ok(Err(e)) => {
                warn!(request = %id, identity = %host, "calendar write failed: {e}");
                return Err(EngineError::CalendarWrite(ProviderFailure {
                    identity: host,
                    reason: FailureReason::Provider(e),
                }));
            }
            Err(_) => {
                warn!(request = %id, identity = %host, "calendar write timed out");
                return Err(EngineError::CalendarWrite(ProviderFailure {
                    identity: host,
                    reason: FailureReason::TimedOut(timeout),
                }));
            }
        };

        let event = Event::RequestConfirmed {
            id,
            owner: guard.owner.clone(),
            event_id: created.event_id,
            link: created.conference_link.or(created.html_link),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(request = %id, identity = %host, "request confirmed");
        guard.request(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn decline_request(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_request_write(&id).await?;
        let status = guard.request(&id).map(|r| r.status.clone()).ok_or(EngineError::NotFound(id))?;
        if status != RequestStatus::Pending {
            return Err(EngineError::NotPending(id));
        }
        let event = Event::RequestDeclined {
            id,
            owner: guard.owner.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Pending requests whose start is at or before `now`. Contended owners are skipped.
    pub fn collect_stale_requests(&self, now: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for entry in self.state.iter() {
            let os = entry.value().clone();
            if let Ok(guard) = os.try_read() {
                for request in &guard.requests {
                    if request.status == RequestStatus::Pending && request.span.start <= now {
                        stale.push(request.id);
                    }
                }
            }
        }
        stale
    }

    pub async fn expire_request(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let mut guard = self.resolve_request_write(&id).await?;
        let request = guard.request(&id).ok_or(EngineError::NotFound(id))?;
        if request.status != RequestStatus::Pending || request.span.start > now {
            return Err(EngineError::NotPending(id));
        }
        let event = Event::RequestExpired {
            id,
            owner: guard.owner.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        // No owner can be created while the gate is held, so the owner list stays complete.
        let gate = self.owner_gate.write().await;
        let owners: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        // Hold every read lock until the rewrite lands so no applied event is lost.
        let mut guards = Vec::with_capacity(owners.len());
        for os in owners {
            guards.push(os.read_owned().await);
        }

        for guard in &guards {
            let owner = guard.owner.clone();
            for (weekday, window) in guard.schedule.configured() {
                events.push(Event::ScheduleDaySet {
                    owner: owner.clone(),
                    weekday,
                    window,
                });
            }
            for identity in &guard.members {
                events.push(Event::MemberAdded {
                    owner: owner.clone(),
                    identity: identity.clone(),
                });
            }
            for request in &guard.requests {
                events.push(Event::RequestSubmitted {
                    id: request.id,
                    owner: owner.clone(),
                    span: request.span,
                    guest_name: request.guest_name.clone(),
                    guest_email: request.guest_email.clone(),
                    note: request.note.clone(),
                });
                match &request.status {
                    RequestStatus::Pending => {}
                    RequestStatus::Confirmed { event_id, link } => events.push(Event::RequestConfirmed {
                        id: request.id,
                        owner: owner.clone(),
                        event_id: event_id.clone(),
                        link: link.clone(),
                    }),
                    RequestStatus::Declined => events.push(Event::RequestDeclined {
                        id: request.id,
                        owner: owner.clone(),
                    }),
                    RequestStatus::Expired => events.push(Event::RequestExpired {
                        id: request.id,
                        owner: owner.clone(),
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        drop(gate);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
