use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::aggregate::collect_busy;
use super::availability::{resolve_day, working_window, DayAvailability};
use super::{Engine, EngineError};

/// Result of one slot query.
#[derive(Debug, Clone)]
pub struct SlotReport {
    pub owner: String,
    pub date: NaiveDate,
    pub time_zone: TimeZoneSpec,
    pub availability: DayAvailability,
    /// Calendars that could not be checked. Their busy time was ignored.
    pub unverified: Vec<CalendarId>,
}

impl SlotReport {
    pub fn slots(&self) -> &[Slot] {
        self.availability.slots()
    }
}

impl Engine {
    /// Effective weekly hours: stored weekdays, everything else the default window.
    pub async fn weekly_configuration(&self, owner: &str) -> WeeklyConfiguration {
        match self.get_owner(owner) {
            Some(os) => os.read().await.schedule.resolve(self.config.default_window),
            None => WeeklyConfiguration::uniform(self.config.default_window),
        }
    }

    pub async fn calendar_identities(&self, owner: &str) -> Vec<CalendarId> {
        match self.get_owner(owner) {
            Some(os) => os.read().await.calendar_identities(),
            None => vec![CalendarId::new(owner)],
        }
    }

    pub async fn members(&self, owner: &str) -> Vec<CalendarId> {
        match self.get_owner(owner) {
            Some(os) => os.read().await.members.clone(),
            None => Vec::new(),
        }
    }

    pub async fn list_requests(&self, owner: &str) -> Vec<BookingRequest> {
        match self.get_owner(owner) {
            Some(os) => os.read().await.requests.clone(),
            None => Vec::new(),
        }
    }

    pub async fn get_request(&self, id: &Ulid) -> Option<BookingRequest> {
        let owner = self.get_owner_for_request(id)?;
        let os = self.get_owner(&owner)?;
        let guard = os.read().await;
        guard.request(id).cloned()
    }

    pub fn list_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.state.iter().map(|e| e.key().clone()).collect();
        owners.sort();
        owners
    }

    /// Bookable slots for `owner` on `date`.
    ///
    /// The owner's state is only read-locked while taking a snapshot; calendar
    /// lookups run without any lock. Inactive days never reach a calendar.
    pub async fn compute_slots(
        &self,
        owner: &str,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<SlotReport, EngineError> {
        if owner.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner name too long"));
        }
        let time_zone = self.config.time_zone;
        let started = std::time::Instant::now();

        let (config, identities, held, window) = match self.get_owner(owner) {
            Some(os) => {
                let guard = os.read().await;
                let config = guard.schedule.resolve(self.config.default_window);
                let window = working_window(date, &config, &time_zone)?;
                let held: Vec<Span> = match &window {
                    Some(w) => guard.outstanding_overlapping(w).map(|r| r.span).collect(),
                    None => Vec::new(),
                };
                (config, guard.calendar_identities(), held, window)
            }
            None => {
                let config = WeeklyConfiguration::uniform(self.config.default_window);
                let window = working_window(date, &config, &time_zone)?;
                (config, vec![CalendarId::new(owner)], Vec::new(), window)
            }
        };

        let mut request = ResolutionRequest::new(date, time_zone);
        request.identities = identities;

        let Some(window) = window else {
            debug!(owner, %date, "inactive day, no calendar lookup");
            return Ok(SlotReport {
                owner: owner.to_string(),
                date,
                time_zone,
                availability: DayAvailability::Inactive,
                unverified: Vec::new(),
            });
        };

        let aggregation = collect_busy(
            self.calendar.as_ref(),
            &request.identities,
            window,
            &time_zone,
            self.config.provider_timeout,
            cancel,
        )
        .await?;
        let unverified: Vec<CalendarId> = aggregation.unverified().cloned().collect();
        let mut busy = aggregation.busy;
        busy.extend(held);

        let availability = resolve_day(&request, &config, &busy, &self.config.resolver)?;
        metrics::histogram!(observability::SLOT_RESOLUTION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(
            owner,
            %date,
            calendars = request.identities.len(),
            busy = busy.len(),
            slots = availability.slots().len(),
            unverified = unverified.len(),
            "slots resolved"
        );

        Ok(SlotReport {
            owner: owner.to_string(),
            date,
            time_zone,
            availability,
            unverified,
        })
    }
}
