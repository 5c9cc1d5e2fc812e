use fleet_common::bus::LifecycleEventKind;
use fleet_common::LifecycleOperation;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::error::ApiFailure;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

/// What one fetch saw: the resource, or a 404.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed<T> {
    Present(T),
    Absent,
}

impl<T> Observed<T> {
    pub fn present(&self) -> Option<&T> {
        match self {
            Observed::Present(v) => Some(v),
            Observed::Absent => None,
        }
    }

    pub fn into_present(self) -> Option<T> {
        match self {
            Observed::Present(v) => Some(v),
            Observed::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Observed::Absent)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Convergence<T> {
    Converged(Observed<T>),
    /// Deadline reached; carries the last successful observation, if any.
    TimedOut(Option<Observed<T>>),
}

/// Bounded "fetch until predicate holds" loop shared by every lifecycle wait.
///
/// The deadline is taken from the monotonic clock once, up front. Fetches are
/// cut off at the deadline, so a stalled API call cannot push the loop past
/// its budget. Transient fetch failures are logged and the loop carries on with
/// the previous observation; a 404 is an observation (`Absent`) rather than an
/// error, and only fails the wait when the predicate does not accept it.
#[derive(Clone)]
pub struct ConvergencePoller {
    events: EventBus,
}

impl ConvergencePoller {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    pub async fn await_condition<T, F, Fut, P>(
        &self,
        resource_id: &str,
        operation: LifecycleOperation,
        spec: PollSpec,
        mut fetch: F,
        predicate: P,
    ) -> Result<Convergence<T>, ApiFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiFailure>>,
        P: Fn(&Observed<T>) -> bool,
    {
        let started = Instant::now();
        let deadline = started + spec.timeout;
        let mut last: Option<Observed<T>> = None;
        let mut poll: u32 = 0;

        loop {
            poll += 1;
            let observed = match timeout_at(deadline, fetch()).await {
                Ok(Ok(v)) => Some(Observed::Present(v)),
                Ok(Err(e)) if e.is_absent() => {
                    if !predicate(&Observed::Absent) {
                        tracing::warn!(
                            resource_id,
                            operation = operation.as_str(),
                            poll,
                            "[poller] resource disappeared"
                        );
                        return Err(e);
                    }
                    Some(Observed::Absent)
                }
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(
                        resource_id,
                        operation = operation.as_str(),
                        poll,
                        error = %e,
                        "[poller] fetch failed, keeping last observation"
                    );
                    None
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => None,
            };

            let converged = observed.as_ref().is_some_and(|o| predicate(o));
            let elapsed = started.elapsed();
            self.events.publish(
                resource_id,
                LifecycleEventKind::Polled {
                    operation,
                    poll,
                    elapsed_ms: elapsed.as_millis() as u64,
                    converged,
                },
            );

            if let Some(o) = observed {
                if converged {
                    tracing::debug!(
                        resource_id,
                        operation = operation.as_str(),
                        poll,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "[poller] converged"
                    );
                    return Ok(Convergence::Converged(o));
                }
                last = Some(o);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    resource_id,
                    operation = operation.as_str(),
                    polls = poll,
                    timeout_secs = spec.timeout.as_secs(),
                    "[poller] timed out"
                );
                return Ok(Convergence::TimedOut(last));
            }
            sleep_until((now + spec.interval).min(deadline)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PermanentKind;
    use fleet_common::bus::LifecycleEvent;

    const SPEC: PollSpec = PollSpec {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(60),
    };

    fn poller() -> ConvergencePoller {
        ConvergencePoller::new(EventBus::new())
    }

    fn not_found() -> ApiFailure {
        ApiFailure::Permanent {
            operation: "get_instance",
            kind: PermanentKind::NotFound,
            reason: "404".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn true_on_first_fetch_converges_without_sleeping() {
        let start = Instant::now();
        let mut fetches = 0;
        let res = poller()
            .await_condition(
                "r",
                LifecycleOperation::Start,
                SPEC,
                || {
                    fetches += 1;
                    async { Ok::<_, ApiFailure>("running") }
                },
                |o| o.present() == Some(&"running"),
            )
            .await
            .unwrap();

        assert_eq!(res, Convergence::Converged(Observed::Present("running")));
        assert_eq!(fetches, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn never_true_times_out_within_one_interval_of_the_budget() {
        let start = Instant::now();
        let mut n = 0u32;
        let res = poller()
            .await_condition(
                "r",
                LifecycleOperation::Stop,
                SPEC,
                || {
                    n += 1;
                    let v = n;
                    async move { Ok::<_, ApiFailure>(v) }
                },
                |_| false,
            )
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= SPEC.timeout, "{elapsed:?}");
        assert!(elapsed < SPEC.timeout + SPEC.interval, "{elapsed:?}");
        match res {
            Convergence::TimedOut(Some(Observed::Present(v))) => assert_eq!(v, n),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn absence_converges_when_the_predicate_wants_it() {
        let res = poller()
            .await_condition(
                "r",
                LifecycleOperation::Destroy,
                SPEC,
                || async { Err::<(), _>(not_found()) },
                |o| o.is_absent(),
            )
            .await
            .unwrap();
        assert_eq!(res, Convergence::Converged(Observed::Absent));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_absence_is_surfaced() {
        let err = poller()
            .await_condition(
                "r",
                LifecycleOperation::Start,
                SPEC,
                || async { Err::<(), _>(not_found()) },
                |o| o.present().is_some(),
            )
            .await
            .unwrap_err();
        assert!(err.is_absent());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_keep_polling() {
        let mut n = 0u32;
        let res = poller()
            .await_condition(
                "r",
                LifecycleOperation::Create,
                SPEC,
                || {
                    n += 1;
                    let attempt = n;
                    async move {
                        if attempt == 1 {
                            Err(ApiFailure::Transient {
                                operation: "get_instance",
                                attempts: 4,
                                last_error: "503".into(),
                            })
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |o| o.present().is_some(),
            )
            .await
            .unwrap();
        assert_eq!(res, Convergence::Converged(Observed::Present(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_abort() {
        let err = poller()
            .await_condition(
                "r",
                LifecycleOperation::Snapshot,
                SPEC,
                || async {
                    Err::<(), _>(ApiFailure::Permanent {
                        operation: "get_snapshot",
                        kind: PermanentKind::Rejected,
                        reason: "403".into(),
                    })
                },
                |_| true,
            )
            .await
            .unwrap_err();
        assert!(!err.is_absent());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_fetch_is_cut_at_the_deadline() {
        let start = Instant::now();
        let res = poller()
            .await_condition(
                "r",
                LifecycleOperation::Destroy,
                SPEC,
                || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, ApiFailure>(())
                },
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(res, Convergence::TimedOut(None));
        assert_eq!(start.elapsed(), SPEC.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn each_poll_is_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut n = 0u32;
        ConvergencePoller::new(bus)
            .await_condition(
                "r-9",
                LifecycleOperation::Start,
                SPEC,
                || {
                    n += 1;
                    let v = n;
                    async move { Ok::<_, ApiFailure>(v) }
                },
                |o| o.present() == Some(&3),
            )
            .await
            .unwrap();

        let mut seen: Vec<LifecycleEvent> = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            seen.push(evt);
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.resource_id == "r-9"));
        assert!(matches!(
            seen[2].kind,
            LifecycleEventKind::Polled {
                poll: 3,
                converged: true,
                ..
            }
        ));
    }
}
