//! Injectable clock.
//!
//! Every expiration calculation in this crate routes through a [`Clock`]
//! rather than calling `chrono::Utc::now()` directly, so tests can drive
//! the [`crate::credentials::oauth2::TokenState`] machine deterministically
//! (see spec property 5: the FRESH/STALE/EXPIRED boundaries at exact
//! second offsets from expiration).

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock, backed by `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A shared, cloneable handle to a [`Clock`].
pub type SharedClock = Arc<dyn Clock>;

/// Returns the default [`SharedClock`] (the real wall clock).
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A clock that can be moved forward under test control.
    #[derive(Debug)]
    pub struct MockClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl MockClock {
        pub fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(start),
            })
        }

        pub fn set(&self, t: DateTime<Utc>) {
            *self.now.lock().unwrap() = t;
        }

        pub fn advance(&self, d: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += d;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
