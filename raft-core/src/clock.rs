//! The clock interface (§6 Clock interface): monotonic time + sleep,
//! mockable for deterministic tests.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Monotonic time source, mockable in tests so election/heartbeat timing
/// can be driven deterministically (§6, §4.3).
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);

    /// Blocks until `condition` returns `true` or `timeout` elapses,
    /// returning whether the condition was observed true. The default
    /// implementation busy-polls at a short interval, suitable for a
    /// production [`SystemClock`]; a test clock may implement this more
    /// precisely against virtual time.
    fn wait_for(&self, mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = self.now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if self.now() >= deadline {
                return condition();
            }
            self.sleep(Duration::from_millis(5).min(timeout));
        }
    }
}

/// The real wall-clock, backed by `std::time` and `std::thread::sleep`.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A condition-variable-backed gate used by blocking waiters
/// (`Command::commit`, `Shard::get_committed_command`) to park until a
/// predicate holds or a deadline passes, without busy-polling (§5
/// Suspension points).
pub struct WaitGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl WaitGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Signal every waiter on this gate to re-check its predicate.
    pub fn notify_all(&self) {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock().unwrap();
        *ready = true;
        cvar.notify_all();
    }

    pub fn wait_while(&self, timeout: Duration, mut should_keep_waiting: impl FnMut() -> bool) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        let (_guard, result) = cvar
            .wait_timeout_while(guard, timeout, |_| should_keep_waiting())
            .unwrap();
        !result.timed_out()
    }
}

impl Default for WaitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for WaitGate {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_gate_unblocks_on_notify() {
        let gate = WaitGate::new();
        let gate2 = gate.clone();
        let flag = Arc::new(Mutex::new(false));
        let flag2 = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            *flag2.lock().unwrap() = true;
            gate2.notify_all();
        });
        let ok = gate.wait_while(Duration::from_secs(1), || !*flag.lock().unwrap());
        assert!(ok);
        assert!(*flag.lock().unwrap());
    }

    #[test]
    fn wait_gate_times_out() {
        let gate = WaitGate::new();
        let ok = gate.wait_while(Duration::from_millis(20), || true);
        assert!(!ok);
    }
}
