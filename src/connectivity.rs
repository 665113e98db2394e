// =============================================================================
// Connectivity monitor — tracks outbound I/O health, gates retries with
// exponential backoff
// =============================================================================
//
// Every outbound HTTP attempt reports its outcome here. Consecutive failures
// widen the retry window up to a configured ceiling; one success snaps the
// state back to CONNECTED with the base delay. Constructed once at startup
// and passed to collaborators as an explicit Arc.
// =============================================================================

use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ConnectivityConfig;

/// Coarse health classification exposed to the rest of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Degraded,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "CONNECTED"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Full connectivity state snapshot.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
    pub status: ConnectionStatus,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub next_retry_time: Option<Instant>,
    pub consecutive_failures: u32,
    pub retry_delay_seconds: u64,
    pub last_error_message: String,
}

impl ConnectivityState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            last_success: None,
            last_failure: None,
            next_retry_time: None,
            consecutive_failures: 0,
            retry_delay_seconds: 1,
            last_error_message: String::new(),
        }
    }
}

/// Process-wide connectivity supervisor. All reads and writes serialize on
/// the internal lock.
pub struct ConnectivityMonitor {
    state: Mutex<ConnectivityState>,
    config: ConnectivityConfig,
}

impl ConnectivityMonitor {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            state: Mutex::new(ConnectivityState::new()),
            config,
        }
    }

    /// Record a successful outbound operation.
    pub fn report_success(&self) {
        let mut state = self.state.lock();
        let was_down = state.status != ConnectionStatus::Connected;
        state.status = ConnectionStatus::Connected;
        state.last_success = Some(Instant::now());
        state.consecutive_failures = 0;
        state.retry_delay_seconds = 1;
        state.next_retry_time = None;
        if was_down {
            debug!("connectivity restored");
        }
    }

    /// Record a failed outbound operation and widen the backoff window.
    pub fn report_failure(&self, error_message: &str) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.consecutive_failures += 1;
        state.last_failure = Some(now);
        state.last_error_message = error_message.to_string();

        let widened = (state.retry_delay_seconds as f64 * self.config.backoff_multiplier)
            .min(self.config.max_retry_delay_seconds as f64);
        state.retry_delay_seconds = (widened as u64).max(1);
        state.next_retry_time =
            Some(now + std::time::Duration::from_secs(state.retry_delay_seconds));

        if state.consecutive_failures >= self.config.disconnected_threshold {
            state.status = ConnectionStatus::Disconnected;
        } else if state.consecutive_failures >= self.config.degraded_threshold {
            state.status = ConnectionStatus::Degraded;
        }

        warn!(
            consecutive_failures = state.consecutive_failures,
            retry_delay_s = state.retry_delay_seconds,
            status = %state.status,
            error = error_message,
            "outbound failure recorded"
        );
    }

    /// Whether an outbound attempt is allowed right now. Always true while
    /// CONNECTED; otherwise true once the retry window has elapsed.
    pub fn should_attempt_connection(&self) -> bool {
        let state = self.state.lock();
        if state.status == ConnectionStatus::Connected {
            return true;
        }
        match state.next_retry_time {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    /// Seconds until the next retry window opens (zero when open).
    pub fn seconds_until_retry(&self) -> u64 {
        let state = self.state.lock();
        match state.next_retry_time {
            Some(at) => at.saturating_duration_since(Instant::now()).as_secs(),
            None => 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// True when the network is considered down (DISCONNECTED).
    pub fn is_outage(&self) -> bool {
        self.state.lock().status == ConnectionStatus::Disconnected
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.lock().clone()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConnectivityMonitor {
        ConnectivityMonitor::new(ConnectivityConfig {
            max_retry_delay_seconds: 60,
            degraded_threshold: 3,
            disconnected_threshold: 5,
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn starts_connected_and_open() {
        let m = monitor();
        assert_eq!(m.status(), ConnectionStatus::Connected);
        assert!(m.should_attempt_connection());
        assert_eq!(m.seconds_until_retry(), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let m = monitor();
        for _ in 0..10 {
            m.report_failure("timeout");
        }
        let state = m.state();
        // 1 -> 2 -> 4 -> 8 -> 16 -> 32 -> 60 (capped)
        assert_eq!(state.retry_delay_seconds, 60);
        assert_eq!(state.consecutive_failures, 10);
    }

    #[test]
    fn degrades_then_disconnects_at_thresholds() {
        let m = monitor();
        m.report_failure("e1");
        m.report_failure("e2");
        assert_eq!(m.status(), ConnectionStatus::Connected);
        m.report_failure("e3");
        assert_eq!(m.status(), ConnectionStatus::Degraded);
        m.report_failure("e4");
        m.report_failure("e5");
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert!(m.is_outage());
    }

    #[test]
    fn success_after_failures_restores_connected_state() {
        let m = monitor();
        for _ in 0..7 {
            m.report_failure("boom");
        }
        assert_eq!(m.status(), ConnectionStatus::Disconnected);

        m.report_success();
        let state = m.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.retry_delay_seconds, 1);
        assert!(m.should_attempt_connection());
    }

    #[test]
    fn failure_closes_the_retry_window() {
        let m = monitor();
        for _ in 0..5 {
            m.report_failure("down");
        }
        // DISCONNECTED with a future next_retry_time gates attempts.
        assert!(!m.should_attempt_connection());
        assert!(m.seconds_until_retry() > 0);
    }

    #[test]
    fn last_error_message_is_retained() {
        let m = monitor();
        m.report_failure("dns failure");
        assert_eq!(m.state().last_error_message, "dns failure");
    }
}
