//! Consecutive-failure circuit breaker.
//!
//! Closed → Open after `fail_max` consecutive failures; Open rejects calls
//! for `open` duration; then Half-Open admits exactly one probe. The probe's
//! outcome decides: success closes the circuit, failure re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use hive_core::config::BreakerConfig;
use hive_core::HiveError;

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

pub struct CircuitBreaker {
    service: &'static str,
    fail_max: u32,
    open: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(service: &'static str, config: &BreakerConfig) -> Self {
        Self {
            service,
            fail_max: config.fail_max.max(1),
            open: Duration::from_secs(config.open_secs),
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Gate a call. `Err(CircuitOpen)` carries the seconds until the next
    /// probe window.
    pub fn check(&self) -> Result<(), HiveError> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= *until {
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!(service = self.service, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(HiveError::CircuitOpen {
                        service: self.service.to_string(),
                        retry_after_secs: (*until - now).as_secs().max(1),
                    })
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Err(HiveError::CircuitOpen {
                        service: self.service.to_string(),
                        retry_after_secs: 1,
                    })
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::HalfOpen { .. } | State::Open { .. }) {
            info!(service = self.service, "circuit closed");
        }
        *state = State::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.fail_max {
                    warn!(
                        service = self.service,
                        failures = *failures,
                        open_secs = self.open.as_secs(),
                        "circuit opened"
                    );
                    *state = State::Open {
                        until: Instant::now() + self.open,
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(service = self.service, "probe failed, circuit re-opened");
                *state = State::Open {
                    until: Instant::now() + self.open,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Run `call` behind the breaker, recording its outcome.
    pub async fn guard<T, F>(&self, call: F) -> Result<T, HiveError>
    where
        F: std::future::Future<Output = Result<T, HiveError>>,
    {
        self.check()?;
        match call.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                // Only infrastructure failures count against the breaker;
                // a 4xx means the service is fine and we are wrong.
                if matches!(
                    e.kind(),
                    hive_core::ErrorKind::Transient | hive_core::ErrorKind::Internal
                ) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(fail_max: u32, open_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig {
                fail_max,
                open_secs,
            },
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = breaker(3, 60);
        assert!(b.check().is_ok());
        b.record_failure();
        b.record_failure();
        assert!(b.check().is_ok());
        b.record_failure();
        assert!(matches!(b.check(), Err(HiveError::CircuitOpen { .. })));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let b = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert!(b.check().is_ok());
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let b = breaker(1, 0);
        b.record_failure();
        // open_secs = 0 → immediately eligible for a probe.
        assert!(b.check().is_ok());
        // Second caller is rejected while the probe is in flight.
        assert!(b.check().is_err());
        // Probe success closes the circuit for everyone.
        b.record_success();
        assert!(b.check().is_ok());
    }

    #[test]
    fn failed_probe_reopens() {
        let b = breaker(1, 0);
        b.record_failure();
        assert!(b.check().is_ok()); // probe admitted
        b.record_failure(); // probe failed
        // Re-opened with open_secs=0 means the next check probes again.
        assert!(b.check().is_ok());
        assert!(b.check().is_err());
    }
}
