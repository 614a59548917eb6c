use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{CalendarId, Span, TimeZoneSpec};
use crate::observability;
use crate::provider::{BusyProvider, ProviderError};

use super::error::EngineError;

/// Busy intervals from any number of calendars. Unordered, duplicates allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusySet {
    spans: Vec<Span>,
}

impl BusySet {
    pub fn from_spans(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    pub fn extend(&mut self, spans: impl IntoIterator<Item = Span>) {
        self.spans.extend(spans);
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn overlapping<'a>(&'a self, window: &'a Span) -> impl Iterator<Item = Span> + 'a {
        self.spans.iter().copied().filter(move |s| s.overlaps(window))
    }
}

/// Union per-calendar busy lists. Order of calendars does not matter.
pub fn aggregate<I>(per_identity: I) -> BusySet
where
    I: IntoIterator<Item = (CalendarId, Vec<Span>)>,
{
    let mut set = BusySet::default();
    for (_, spans) in per_identity {
        set.extend(spans);
    }
    set
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Provider(ProviderError),
    TimedOut(Duration),
}

/// One calendar whose busy time could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub identity: CalendarId,
    pub reason: FailureReason,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            FailureReason::Provider(e) => write!(f, "{}: {e}", self.identity),
            FailureReason::TimedOut(d) => {
                write!(f, "{}: timed out after {}ms", self.identity, d.as_millis())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub busy: BusySet,
    /// Calendars treated as free because they could not be checked.
    pub failures: Vec<ProviderFailure>,
}

impl Aggregation {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn unverified(&self) -> impl Iterator<Item = &CalendarId> {
        self.failures.iter().map(|f| &f.identity)
    }
}

/// Fetch busy time for every identity concurrently, each under its own timeout.
///
/// A failing or slow calendar contributes nothing and is reported in
/// `failures`. Cancellation abandons the remaining fetches.
pub async fn collect_busy<P>(
    provider: &P,
    identities: &[CalendarId],
    window: Span,
    time_zone: &TimeZoneSpec,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Aggregation, EngineError>
where
    P: BusyProvider + ?Sized,
{
    let fetches = identities.iter().map(|identity| async move {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, provider.busy_intervals(identity, window, time_zone)).await;
        metrics::histogram!(observability::PROVIDER_FETCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let outcome = match result {
            Ok(Ok(spans)) => Ok(spans),
            Ok(Err(e)) => Err(FailureReason::Provider(e)),
            Err(_) => Err(FailureReason::TimedOut(timeout)),
        };
        (identity.clone(), outcome)
    });

    let results = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        results = join_all(fetches) => results,
    };

    let mut aggregation = Aggregation::default();
    for (identity, outcome) in results {
        match outcome {
            Ok(spans) => {
                debug!(identity = %identity, busy = spans.len(), "busy intervals fetched");
                aggregation.busy.extend(spans);
            }
            Err(reason) => {
                let failure = ProviderFailure { identity, reason };
                warn!(failure = %failure, "calendar unavailable, treating as free");
                metrics::counter!(observability::PROVIDER_FAILURES_TOTAL).increment(1);
                aggregation.failures.push(failure);
            }
        }
    }
    Ok(aggregation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryCalendar;

    fn ids(names: &[&str]) -> Vec<CalendarId> {
        names.iter().map(|n| CalendarId::new(*n)).collect()
    }

    #[test]
    fn aggregate_is_order_independent() {
        let a = (CalendarId::new("a"), vec![Span::new(0, 10)]);
        let b = (CalendarId::new("b"), vec![Span::new(20, 30), Span::new(0, 10)]);
        let mut ab: Vec<Span> = aggregate(vec![a.clone(), b.clone()]).spans().to_vec();
        let mut ba: Vec<Span> = aggregate(vec![b, a]).spans().to_vec();
        ab.sort_by_key(|s| (s.start, s.end));
        ba.sort_by_key(|s| (s.start, s.end));
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 3); // duplicates kept
    }

    #[test]
    fn busy_set_overlapping_filters() {
        let set = BusySet::from_spans(vec![Span::new(0, 10), Span::new(10, 20), Span::new(30, 40)]);
        let hits: Vec<Span> = set.overlapping(&Span::new(10, 35)).collect();
        assert_eq!(hits, vec![Span::new(10, 20), Span::new(30, 40)]);
    }

    #[tokio::test]
    async fn collects_all_identities() {
        let cal = InMemoryCalendar::new();
        cal.add_busy(CalendarId::new("a"), Span::new(0, 10));
        cal.add_busy(CalendarId::new("b"), Span::new(50, 60));
        let agg = collect_busy(
            &cal,
            &ids(&["a", "b", "c"]),
            Span::new(0, 100),
            &TimeZoneSpec::utc(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(agg.is_complete());
        assert_eq!(agg.busy.len(), 2);
        assert_eq!(cal.fetch_count(), 3);
    }

    #[tokio::test]
    async fn failing_identity_is_downgraded() {
        let cal = InMemoryCalendar::new();
        cal.add_busy(CalendarId::new("a"), Span::new(0, 10));
        cal.fail_with(CalendarId::new("b"), ProviderError::Unauthorized("expired".into()));
        let agg = collect_busy(
            &cal,
            &ids(&["a", "b"]),
            Span::new(0, 100),
            &TimeZoneSpec::utc(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!agg.is_complete());
        assert_eq!(agg.busy.spans(), &[Span::new(0, 10)]);
        assert_eq!(agg.unverified().collect::<Vec<_>>(), vec![&CalendarId::new("b")]);
        assert!(matches!(agg.failures[0].reason, FailureReason::Provider(ProviderError::Unauthorized(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_identity_times_out() {
        let cal = InMemoryCalendar::new();
        cal.add_busy(CalendarId::new("slow"), Span::new(0, 10));
        cal.add_busy(CalendarId::new("fast"), Span::new(20, 30));
        cal.delay(CalendarId::new("slow"), Duration::from_secs(30));
        let agg = collect_busy(
            &cal,
            &ids(&["slow", "fast"]),
            Span::new(0, 100),
            &TimeZoneSpec::utc(),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(agg.busy.spans(), &[Span::new(20, 30)]);
        assert_eq!(agg.failures.len(), 1);
        assert_eq!(agg.failures[0].identity, CalendarId::new("slow"));
        assert_eq!(agg.failures[0].reason, FailureReason::TimedOut(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_cancelled() {
        let cal = InMemoryCalendar::new();
        cal.delay(CalendarId::new("a"), Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = collect_busy(
            &cal,
            &ids(&["a"]),
            Span::new(0, 100),
            &TimeZoneSpec::utc(),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_never_completes() {
        let cal = InMemoryCalendar::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = collect_busy(
            &cal,
            &ids(&["a"]),
            Span::new(0, 100),
            &TimeZoneSpec::utc(),
            Duration::from_secs(1),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[test]
    fn failure_display_names_identity() {
        let f = ProviderFailure {
            identity: CalendarId::new("bob@example.com"),
            reason: FailureReason::TimedOut(Duration::from_millis(250)),
        };
        assert_eq!(f.to_string(), "bob@example.com: timed out after 250ms");
    }
}
