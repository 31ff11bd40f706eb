// Process-wide wall clock
//
// Started at bootstrap and threaded through the service context so that
// every timestamp in the runtime comes from one source. Tests substitute a
// fixed clock and advance it deterministically with `travel`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    /// Milliseconds since the unix epoch when in fixed mode; unused otherwise.
    fixed: Option<AtomicI64>,
    /// Offset applied on top of the time source, in milliseconds.
    offset_ms: AtomicI64,
}

impl Clock {
    /// A clock backed by the system time.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                fixed: None,
                offset_ms: AtomicI64::new(0),
            }),
        }
    }

    /// A clock frozen at `start_ms` until travelled. Test hook.
    pub fn fixed(start_ms: i64) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                fixed: Some(AtomicI64::new(start_ms)),
                offset_ms: AtomicI64::new(0),
            }),
        }
    }

    /// Current time in milliseconds since the unix epoch.
    pub fn now_ms(&self) -> i64 {
        let base = match &self.inner.fixed {
            Some(fixed) => fixed.load(Ordering::Relaxed),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        };
        base + self.inner.offset_ms.load(Ordering::Relaxed)
    }

    /// Current time in whole seconds since the unix epoch.
    pub fn unix_secs(&self) -> i64 {
        self.now_ms() / 1000
    }

    /// Shift the clock by `delta_ms`. Test hook, not a production feature.
    pub fn travel(&self, delta_ms: i64) {
        self.inner.offset_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
