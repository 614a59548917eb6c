use chrono::{Datelike, NaiveDate};

use crate::model::*;

use super::aggregate::BusySet;
use super::error::EngineError;

// ── Slot resolution ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    pub slot_duration_ms: Ms,
    /// Local ranges that are never offered, e.g. a lunch hour.
    pub exclusions: Vec<LocalRange>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            slot_duration_ms: HOUR_MS,
            exclusions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayAvailability {
    /// The weekday is switched off. Not an error.
    Inactive,
    Open { window: Span, slots: Vec<Slot> },
}

impl DayAvailability {
    pub fn slots(&self) -> &[Slot] {
        match self {
            DayAvailability::Inactive => &[],
            DayAvailability::Open { slots, .. } => slots,
        }
    }

    pub fn into_slots(self) -> Vec<Slot> {
        match self {
            DayAvailability::Inactive => Vec::new(),
            DayAvailability::Open { slots, .. } => slots,
        }
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, DayAvailability::Inactive)
    }
}

/// Absolute working window for `date`, or `None` when the weekday is inactive.
pub fn working_window(
    date: NaiveDate,
    config: &WeeklyConfiguration,
    time_zone: &TimeZoneSpec,
) -> Result<Option<Span>, EngineError> {
    let weekday = date.weekday();
    let day = config.day(weekday);
    if !day.active {
        return Ok(None);
    }
    let invalid = || EngineError::InvalidWindow {
        weekday,
        start: day.start,
        end: day.end,
    };
    if day.start >= day.end {
        return Err(invalid());
    }
    // A DST transition inside the window can still collapse it.
    Span::try_new(
        time_zone.instant(date, day.start),
        time_zone.instant(date, day.end),
    )
    .map(Some)
    .ok_or_else(invalid)
}

/// Free fixed-duration slots for one day, keeping the inactive/open distinction.
pub fn resolve_day(
    request: &ResolutionRequest,
    config: &WeeklyConfiguration,
    busy: &BusySet,
    options: &ResolverOptions,
) -> Result<DayAvailability, EngineError> {
    if options.slot_duration_ms <= 0 {
        return Err(EngineError::InvalidSlotDuration(options.slot_duration_ms));
    }
    let Some(window) = working_window(request.date, config, &request.time_zone)? else {
        return Ok(DayAvailability::Inactive);
    };

    let mut blocked: Vec<Span> = busy.overlapping(&window).collect();
    for range in &options.exclusions {
        let start = request.time_zone.instant(request.date, range.start);
        let end = request.time_zone.instant(request.date, range.end);
        if let Some(span) = Span::try_new(start, end) {
            blocked.push(span);
        }
    }
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);

    Ok(DayAvailability::Open {
        window,
        slots: walk_slots(window, &blocked, options.slot_duration_ms),
    })
}

/// Ordered free slots for the requested date. Inactive days yield an empty list.
pub fn resolve_availability(
    request: &ResolutionRequest,
    config: &WeeklyConfiguration,
    busy: &BusySet,
    options: &ResolverOptions,
) -> Result<Vec<Slot>, EngineError> {
    resolve_day(request, config, busy, options).map(DayAvailability::into_slots)
}

/// Step through `window` emitting every `[cursor, cursor + step)` that misses
/// all of `blocked`. `blocked` must be sorted and disjoint. No partial trailing slot.
pub fn walk_slots(window: Span, blocked: &[Span], step: Ms) -> Vec<Slot> {
    debug_assert!(step > 0);
    let mut slots = Vec::new();
    let mut bi = 0;
    let mut cursor = window.start;

    while let Some(end) = cursor.checked_add(step) {
        if end > window.end {
            break;
        }
        while bi < blocked.len() && blocked[bi].end <= cursor {
            bi += 1;
        }
        if bi == blocked.len() || blocked[bi].start >= end {
            slots.push(Slot { start: cursor, end });
        }
        cursor = end;
    }

    slots
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;
    use crate::engine::aggregate::aggregate;

    // 2026-01-19 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 19).unwrap()
    }

    fn tz() -> TimeZoneSpec {
        TimeZoneSpec::tokyo()
    }

    fn at(h: u32, m: u32) -> Ms {
        tz().instant(monday(), time_of_day(h, m))
    }

    fn busy(h1: u32, m1: u32, h2: u32, m2: u32) -> Span {
        Span::new(at(h1, m1), at(h2, m2))
    }

    fn config(start: (u32, u32), end: (u32, u32)) -> WeeklyConfiguration {
        WeeklyConfiguration::uniform(DayWindow::open(
            time_of_day(start.0, start.1),
            time_of_day(end.0, end.1),
        ))
    }

    fn request() -> ResolutionRequest {
        ResolutionRequest::new(monday(), tz())
    }

    fn starts(slots: &[Slot]) -> Vec<Ms> {
        slots.iter().map(|s| s.start).collect()
    }

    fn resolve(config: &WeeklyConfiguration, spans: Vec<Span>) -> Vec<Slot> {
        resolve_availability(&request(), config, &BusySet::from_spans(spans), &ResolverOptions::default()).unwrap()
    }

    #[test]
    fn free_window_yields_every_hour() {
        let slots = resolve(&config((9, 0), (12, 0)), vec![]);
        assert_eq!(starts(&slots), vec![at(9, 0), at(10, 0), at(11, 0)]);
        assert!(slots.iter().all(|s| s.end - s.start == HOUR_MS));
    }

    #[test]
    fn busy_hour_is_excluded() {
        let slots = resolve(&config((9, 0), (12, 0)), vec![busy(10, 0, 11, 0)]);
        assert_eq!(starts(&slots), vec![at(9, 0), at(11, 0)]);
    }

    #[test]
    fn straddling_busy_blocks_both_neighbours() {
        let slots = resolve(&config((9, 0), (12, 0)), vec![busy(9, 30, 10, 30)]);
        assert_eq!(starts(&slots), vec![at(11, 0)]);
    }

    #[test]
    fn inactive_day_is_empty_regardless_of_busy() {
        let cfg = config((9, 0), (12, 0)).with(Weekday::Mon, DayWindow::closed(time_of_day(9, 0), time_of_day(12, 0)));
        let day = resolve_day(
            &request(),
            &cfg,
            &BusySet::from_spans(vec![busy(9, 0, 10, 0)]),
            &ResolverOptions::default(),
        )
        .unwrap();
        assert!(day.is_inactive());
        assert!(day.slots().is_empty());
    }

    #[test]
    fn two_identities_are_unioned() {
        let set = aggregate(vec![
            (CalendarId::new("a"), vec![busy(9, 0, 10, 0)]),
            (CalendarId::new("b"), vec![busy(11, 0, 12, 0)]),
        ]);
        let slots = resolve_availability(&request(), &config((9, 0), (12, 0)), &set, &ResolverOptions::default()).unwrap();
        assert_eq!(starts(&slots), vec![at(10, 0)]);
    }

    #[test]
    fn window_shorter_than_slot_is_empty() {
        let slots = resolve(&config((9, 0), (9, 30)), vec![]);
        assert!(slots.is_empty());
    }

    #[test]
    fn touching_busy_does_not_block() {
        // Busy ends exactly at 10:00 and starts exactly at 11:00.
        let slots = resolve(&config((9, 0), (12, 0)), vec![busy(8, 0, 10, 0), busy(11, 0, 13, 0)]);
        assert_eq!(starts(&slots), vec![at(10, 0)]);
    }

    #[test]
    fn busy_outside_window_is_ignored() {
        let slots = resolve(&config((9, 0), (12, 0)), vec![busy(6, 0, 8, 0), busy(13, 0, 15, 0)]);
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn lunch_exclusion_reproduces_fixed_candidate_hours() {
        let options = ResolverOptions {
            slot_duration_ms: HOUR_MS,
            exclusions: vec!["12:00-13:00".parse().unwrap()],
        };
        let slots = resolve_availability(&request(), &WeeklyConfiguration::default(), &BusySet::default(), &options).unwrap();
        let hours: Vec<Ms> = [10, 11, 13, 14, 15, 16, 17].iter().map(|&h| at(h, 0)).collect();
        assert_eq!(starts(&slots), hours);
    }

    #[test]
    fn half_hour_slots() {
        let options = ResolverOptions {
            slot_duration_ms: 30 * MINUTE_MS,
            exclusions: vec![],
        };
        let slots = resolve_availability(
            &request(),
            &config((9, 0), (11, 0)),
            &BusySet::from_spans(vec![busy(9, 45, 10, 15)]),
            &options,
        )
        .unwrap();
        assert_eq!(starts(&slots), vec![at(9, 0), at(10, 30)]);
    }

    #[test]
    fn inverted_window_is_a_configuration_error() {
        let cfg = WeeklyConfiguration::uniform(DayWindow::open(time_of_day(12, 0), time_of_day(9, 0)));
        let err = resolve_availability(&request(), &cfg, &BusySet::default(), &ResolverOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWindow { weekday: Weekday::Mon, .. }));

        let empty = WeeklyConfiguration::uniform(DayWindow::open(time_of_day(9, 0), time_of_day(9, 0)));
        assert!(resolve_availability(&request(), &empty, &BusySet::default(), &ResolverOptions::default()).is_err());
    }

    #[test]
    fn inverted_window_on_inactive_day_is_fine() {
        let cfg = WeeklyConfiguration::uniform(DayWindow::closed(time_of_day(12, 0), time_of_day(9, 0)));
        let slots = resolve_availability(&request(), &cfg, &BusySet::default(), &ResolverOptions::default()).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn zero_slot_duration_rejected() {
        let options = ResolverOptions {
            slot_duration_ms: 0,
            exclusions: vec![],
        };
        let err = resolve_availability(&request(), &WeeklyConfiguration::default(), &BusySet::default(), &options).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSlotDuration(0)));
    }

    #[test]
    fn window_is_absolute_across_spring_forward() {
        // New York skips 02:00-03:00 on 2026-03-08 (a Sunday). 00:00-05:00 local is 4h long.
        let tz: TimeZoneSpec = "America/New_York".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
        let cfg = config((0, 0), (5, 0));
        let req = ResolutionRequest::new(date, tz);
        let day = resolve_day(&req, &cfg, &BusySet::default(), &ResolverOptions::default()).unwrap();
        let DayAvailability::Open { window, slots } = day else {
            panic!("expected open day");
        };
        assert_eq!(window.duration_ms(), 4 * HOUR_MS);
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn window_is_absolute_across_fall_back() {
        // 2026-11-01 01:00 repeats in New York. 00:00-03:00 local is 4h long.
        let tz: TimeZoneSpec = "America/New_York".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
        let req = ResolutionRequest::new(date, tz);
        let slots = resolve_availability(&req, &config((0, 0), (3, 0)), &BusySet::default(), &ResolverOptions::default()).unwrap();
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(0, 10), Span::new(5, 15), Span::new(20, 30)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 15), Span::new(20, 30)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(0, 10), Span::new(10, 20)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 20)]);
    }

    #[test]
    fn walk_matches_naive_overlap_test() {
        // Every slot the walk emits overlaps nothing, every slot it skips overlaps something.
        let window = Span::new(0, 100);
        for seed in 0..50u64 {
            let mut raw = Vec::new();
            let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            for _ in 0..(seed % 6) {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let start = (x >> 33) as Ms % 120 - 10;
                let len = ((x >> 20) as Ms % 25) + 1;
                raw.push(Span::new(start, start + len));
            }
            let mut sorted = raw.clone();
            sorted.sort_by_key(|s| s.start);
            let merged = merge_overlapping(&sorted);
            let emitted = walk_slots(window, &merged, 10);

            let mut cursor = 0;
            while cursor + 10 <= 100 {
                let candidate = Span::new(cursor, cursor + 10);
                let free = raw.iter().all(|b| !b.overlaps(&candidate));
                let found = emitted.iter().any(|s| s.start == cursor);
                assert_eq!(free, found, "seed {seed} cursor {cursor}");
                cursor += 10;
            }
            assert!(emitted.windows(2).all(|w| w[0].start < w[1].start));
        }
    }
}
