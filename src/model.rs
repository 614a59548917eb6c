use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, SecondsFormat, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted bounds. Empty or inverted input yields `None`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One external calendar checked for busy time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalendarId(pub String);

impl CalendarId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CalendarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Working hours ────────────────────────────────────────────────

/// Sunday-first, matching `Weekday::num_days_from_sunday`.
pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

pub fn time_of_day(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "sunday",
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
    }
}

/// Working hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub active: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DayWindow {
    pub fn open(start: NaiveTime, end: NaiveTime) -> Self {
        Self { active: true, start, end }
    }

    pub fn closed(start: NaiveTime, end: NaiveTime) -> Self {
        Self { active: false, start, end }
    }

    /// 10:00–18:00, active. Used when an owner has nothing configured for a weekday.
    pub fn fallback() -> Self {
        Self::open(time_of_day(10, 0), time_of_day(18, 0))
    }

    pub fn is_well_formed(&self) -> bool {
        !self.active || self.start < self.end
    }
}

impl Default for DayWindow {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Total weekday → window mapping. Every weekday is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyConfiguration {
    days: [DayWindow; 7],
}

impl WeeklyConfiguration {
    pub fn uniform(window: DayWindow) -> Self {
        Self { days: [window; 7] }
    }

    pub fn day(&self, weekday: Weekday) -> &DayWindow {
        &self.days[weekday.num_days_from_sunday() as usize]
    }

    pub fn set(&mut self, weekday: Weekday, window: DayWindow) {
        self.days[weekday.num_days_from_sunday() as usize] = window;
    }

    pub fn with(mut self, weekday: Weekday, window: DayWindow) -> Self {
        self.set(weekday, window);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Weekday, &DayWindow)> {
        WEEKDAYS.iter().copied().zip(self.days.iter())
    }
}

impl Default for WeeklyConfiguration {
    fn default() -> Self {
        Self::uniform(DayWindow::fallback())
    }
}

/// What an owner actually stored: any subset of weekdays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSchedule {
    days: [Option<DayWindow>; 7],
}

impl PartialSchedule {
    pub fn get(&self, weekday: Weekday) -> Option<&DayWindow> {
        self.days[weekday.num_days_from_sunday() as usize].as_ref()
    }

    pub fn set(&mut self, weekday: Weekday, window: DayWindow) {
        self.days[weekday.num_days_from_sunday() as usize] = Some(window);
    }

    pub fn clear(&mut self) {
        self.days = [None; 7];
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(Option::is_none)
    }

    pub fn configured(&self) -> impl Iterator<Item = (Weekday, DayWindow)> + '_ {
        WEEKDAYS
            .iter()
            .copied()
            .zip(self.days.iter())
            .filter_map(|(day, window)| window.map(|w| (day, w)))
    }

    /// Fill every missing weekday with `default`.
    pub fn resolve(&self, default: DayWindow) -> WeeklyConfiguration {
        let mut config = WeeklyConfiguration::uniform(default);
        for (day, window) in self.configured() {
            config.set(day, window);
        }
        config
    }
}

/// A local wall-clock range on an unspecified day, written `HH:MM-HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl LocalRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }
}

impl FromStr for LocalRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got {s:?}"))?;
        let start = parse_time_of_day(start).ok_or_else(|| format!("bad start time in {s:?}"))?;
        let end = parse_time_of_day(end).ok_or_else(|| format!("bad end time in {s:?}"))?;
        if start >= end {
            return Err(format!("empty range {s:?}"));
        }
        Ok(Self { start, end })
    }
}

// ── Time zones ───────────────────────────────────────────────────

/// Zone in which dates and working hours are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeZoneSpec {
    Named(Tz),
    Fixed(FixedOffset),
}

impl TimeZoneSpec {
    pub fn tokyo() -> Self {
        TimeZoneSpec::Named(chrono_tz::Asia::Tokyo)
    }

    pub fn utc() -> Self {
        TimeZoneSpec::Named(chrono_tz::UTC)
    }

    pub fn iana_name(&self) -> Option<&'static str> {
        match self {
            TimeZoneSpec::Named(tz) => Some(tz.name()),
            TimeZoneSpec::Fixed(_) => None,
        }
    }

    /// Absolute instant of `time` on `date` in this zone.
    ///
    /// Ambiguous wall times take the earlier instant. Wall times inside a
    /// forward gap are read with the offset in force before the gap.
    pub fn instant(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        let local = date.and_time(time);
        match self {
            TimeZoneSpec::Named(tz) => local_to_ms(tz, &local),
            TimeZoneSpec::Fixed(offset) => local_to_ms(offset, &local),
        }
    }

    /// RFC 3339 rendering of `ms` in this zone.
    pub fn format(&self, ms: Ms) -> String {
        let Some(utc) = DateTime::<Utc>::from_timestamp_millis(ms) else {
            return ms.to_string();
        };
        match self {
            TimeZoneSpec::Named(tz) => utc.with_timezone(tz).to_rfc3339_opts(SecondsFormat::Secs, false),
            TimeZoneSpec::Fixed(offset) => {
                utc.with_timezone(offset).to_rfc3339_opts(SecondsFormat::Secs, false)
            }
        }
    }
}

fn local_to_ms<Z: TimeZone>(zone: &Z, local: &NaiveDateTime) -> Ms {
    match zone.from_local_datetime(local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let before = *local - chrono::Duration::hours(24);
            let offset = zone.offset_from_utc_datetime(&before).fix();
            local.and_utc().timestamp_millis() - i64::from(offset.local_minus_utc()) * 1000
        }
    }
}

impl FromStr for TimeZoneSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(tz) = s.parse::<Tz>() {
            return Ok(TimeZoneSpec::Named(tz));
        }
        parse_fixed_offset(s)
            .map(TimeZoneSpec::Fixed)
            .ok_or_else(|| format!("unknown time zone: {s}"))
    }
}

fn parse_fixed_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl fmt::Display for TimeZoneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeZoneSpec::Named(tz) => f.write_str(tz.name()),
            TimeZoneSpec::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

// ── Resolution inputs and outputs ────────────────────────────────

/// A bookable candidate. `end - start` is always the configured slot duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub date: NaiveDate,
    pub identities: Vec<CalendarId>,
    pub time_zone: TimeZoneSpec,
}

impl ResolutionRequest {
    pub fn new(date: NaiveDate, time_zone: TimeZoneSpec) -> Self {
        Self {
            date,
            identities: Vec::new(),
            time_zone,
        }
    }
}

// ── Booking requests ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Confirmed { event_id: String, link: Option<String> },
    Declined,
    Expired,
}

impl RequestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Confirmed { .. } => "confirmed",
            RequestStatus::Declined => "declined",
            RequestStatus::Expired => "expired",
        }
    }

    /// Pending and confirmed requests occupy the host's time.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Confirmed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub name: String,
    pub email: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub owner: String,
    pub span: Span,
    pub guest_name: String,
    pub guest_email: String,
    pub note: Option<String>,
    pub status: RequestStatus,
}

// ── Per-owner state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OwnerState {
    pub owner: String,
    pub schedule: PartialSchedule,
    /// Calendars checked for this owner. Empty means the owner's own calendar.
    pub members: Vec<CalendarId>,
    /// Sorted by `span.start`.
    pub requests: Vec<BookingRequest>,
}

impl OwnerState {
    pub fn new(owner: String) -> Self {
        Self {
            owner,
            schedule: PartialSchedule::default(),
            members: Vec::new(),
            requests: Vec::new(),
        }
    }

    /// Members, or the owner itself as its single primary calendar.
    pub fn calendar_identities(&self) -> Vec<CalendarId> {
        if self.members.is_empty() {
            vec![CalendarId::new(self.owner.clone())]
        } else {
            self.members.clone()
        }
    }

    /// Insert request maintaining sort order by span.start.
    pub fn insert_request(&mut self, request: BookingRequest) {
        let pos = self
            .requests
            .binary_search_by_key(&request.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.requests.insert(pos, request);
    }

    pub fn request(&self, id: &Ulid) -> Option<&BookingRequest> {
        self.requests.iter().find(|r| r.id == *id)
    }

    pub fn request_mut(&mut self, id: &Ulid) -> Option<&mut BookingRequest> {
        self.requests.iter_mut().find(|r| r.id == *id)
    }

    /// Pending or confirmed requests whose span overlaps `query`.
    pub fn outstanding_overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingRequest> {
        let right_bound = self.requests.partition_point(|r| r.span.start < query.end);
        self.requests[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start && r.status.is_outstanding())
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleDaySet {
        owner: String,
        weekday: Weekday,
        window: DayWindow,
    },
    ScheduleCleared {
        owner: String,
    },
    MemberAdded {
        owner: String,
        identity: CalendarId,
    },
    MemberRemoved {
        owner: String,
        identity: CalendarId,
    },
    RequestSubmitted {
        id: Ulid,
        owner: String,
        span: Span,
        guest_name: String,
        guest_email: String,
        note: Option<String>,
    },
    RequestConfirmed {
        id: Ulid,
        owner: String,
        event_id: String,
        link: Option<String>,
    },
    RequestDeclined {
        id: Ulid,
        owner: String,
    },
    RequestExpired {
        id: Ulid,
        owner: String,
    },
}

impl Event {
    pub fn owner(&self) -> &str {
        match self {
            Event::ScheduleDaySet { owner, .. }
            | Event::ScheduleCleared { owner }
            | Event::MemberAdded { owner, .. }
            | Event::MemberRemoved { owner, .. }
            | Event::RequestSubmitted { owner, .. }
            | Event::RequestConfirmed { owner, .. }
            | Event::RequestDeclined { owner, .. }
            | Event::RequestExpired { owner, .. } => owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start: Ms, end: Ms, status: RequestStatus) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            owner: "alice".into(),
            span: Span::new(start, end),
            guest_name: "Guest".into(),
            guest_email: "guest@example.com".into(),
            note: None,
            status,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_try_new_rejects_empty() {
        assert_eq!(Span::try_new(5, 5), None);
        assert_eq!(Span::try_new(6, 5), None);
        assert_eq!(Span::try_new(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn day_window_well_formed() {
        assert!(DayWindow::fallback().is_well_formed());
        assert!(!DayWindow::open(time_of_day(12, 0), time_of_day(9, 0)).is_well_formed());
        assert!(!DayWindow::open(time_of_day(9, 0), time_of_day(9, 0)).is_well_formed());
        // Inactive days are never checked.
        assert!(DayWindow::closed(time_of_day(12, 0), time_of_day(9, 0)).is_well_formed());
    }

    #[test]
    fn partial_schedule_fills_missing_days() {
        let mut stored = PartialSchedule::default();
        assert!(stored.is_empty());
        let monday = DayWindow::open(time_of_day(9, 0), time_of_day(12, 0));
        stored.set(Weekday::Mon, monday);
        stored.set(Weekday::Sun, DayWindow::closed(time_of_day(10, 0), time_of_day(18, 0)));

        let config = stored.resolve(DayWindow::fallback());
        assert_eq!(*config.day(Weekday::Mon), monday);
        assert!(!config.day(Weekday::Sun).active);
        assert_eq!(*config.day(Weekday::Wed), DayWindow::fallback());
        assert_eq!(config.iter().count(), 7);
        assert_eq!(stored.configured().count(), 2);

        stored.clear();
        assert!(stored.is_empty());
    }

    #[test]
    fn weekly_configuration_iterates_sunday_first() {
        let config = WeeklyConfiguration::default().with(Weekday::Sat, DayWindow::closed(time_of_day(10, 0), time_of_day(18, 0)));
        let days: Vec<Weekday> = config.iter().map(|(d, _)| d).collect();
        assert_eq!(days, WEEKDAYS.to_vec());
        assert!(!config.day(Weekday::Sat).active);
    }

    #[test]
    fn local_range_parse() {
        let r: LocalRange = "12:00-13:00".parse().unwrap();
        assert_eq!(r.start, time_of_day(12, 0));
        assert_eq!(r.end, time_of_day(13, 0));
        assert!("13:00-12:00".parse::<LocalRange>().is_err());
        assert!("noon".parse::<LocalRange>().is_err());
        assert!(" 09:30 - 10:15 ".trim().parse::<LocalRange>().is_ok());
    }

    #[test]
    fn time_zone_parse_named_and_fixed() {
        assert_eq!("Asia/Tokyo".parse::<TimeZoneSpec>().unwrap(), TimeZoneSpec::tokyo());
        let fixed: TimeZoneSpec = "+09:00".parse().unwrap();
        assert_eq!(fixed, TimeZoneSpec::Fixed(FixedOffset::east_opt(9 * 3600).unwrap()));
        let compact: TimeZoneSpec = "-0530".parse().unwrap();
        assert_eq!(compact, TimeZoneSpec::Fixed(FixedOffset::west_opt(5 * 3600 + 1800).unwrap()));
        assert!("Mars/Olympus".parse::<TimeZoneSpec>().is_err());
        assert!("+25:00".parse::<TimeZoneSpec>().is_err());
    }

    #[test]
    fn instant_in_tokyo() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();
        let ms = TimeZoneSpec::tokyo().instant(date, time_of_day(9, 0));
        let expected = Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(ms, expected);
        assert_eq!(TimeZoneSpec::tokyo().format(ms), "2026-01-20T09:00:00+09:00");
    }

    #[test]
    fn instant_fixed_offset_matches_named() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();
        let fixed: TimeZoneSpec = "+09:00".parse().unwrap();
        assert_eq!(
            fixed.instant(date, time_of_day(13, 30)),
            TimeZoneSpec::tokyo().instant(date, time_of_day(13, 30))
        );
    }

    #[test]
    fn instant_in_dst_gap_uses_pre_gap_offset() {
        // 2026-03-08 02:30 does not exist in New York.
        let tz: TimeZoneSpec = "America/New_York".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
        let ms = tz.instant(date, time_of_day(2, 30));
        let expected = Utc.with_ymd_and_hms(2026, 3, 8, 7, 30, 0).unwrap().timestamp_millis();
        assert_eq!(ms, expected);
    }

    #[test]
    fn instant_in_dst_overlap_takes_earlier() {
        // 2026-11-01 01:30 happens twice in New York; EDT (-4) comes first.
        let tz: TimeZoneSpec = "America/New_York".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
        let ms = tz.instant(date, time_of_day(1, 30));
        let expected = Utc.with_ymd_and_hms(2026, 11, 1, 5, 30, 0).unwrap().timestamp_millis();
        assert_eq!(ms, expected);
    }

    #[test]
    fn owner_without_members_checks_own_calendar() {
        let mut os = OwnerState::new("alice@example.com".into());
        assert_eq!(os.calendar_identities(), vec![CalendarId::new("alice@example.com")]);
        os.members.push(CalendarId::new("bob@example.com"));
        assert_eq!(os.calendar_identities(), vec![CalendarId::new("bob@example.com")]);
    }

    #[test]
    fn requests_stay_sorted_and_filter_outstanding() {
        let mut os = OwnerState::new("alice".into());
        os.insert_request(request(300, 400, RequestStatus::Pending));
        os.insert_request(request(100, 200, RequestStatus::Declined));
        os.insert_request(request(200, 300, RequestStatus::Confirmed { event_id: "e1".into(), link: None }));
        let starts: Vec<Ms> = os.requests.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        let hits: Vec<_> = os.outstanding_overlapping(&Span::new(0, 1000)).collect();
        assert_eq!(hits.len(), 2);
        // Adjacent request is not overlapping (half-open).
        assert_eq!(os.outstanding_overlapping(&Span::new(400, 500)).count(), 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ScheduleDaySet {
            owner: "alice".into(),
            weekday: Weekday::Mon,
            window: DayWindow::open(time_of_day(9, 0), time_of_day(17, 30)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.owner(), "alice");
    }
}
