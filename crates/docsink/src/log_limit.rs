//! Rate-limited reporting of per-item indexing failures.
//!
//! A single bulk response can carry thousands of failed items sharing a
//! handful of distinct causes. The limiter admits at most one log line per
//! distinct (type, reason) key per window, which keeps flush logging bounded
//! no matter how large the failure set is.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Keys kept before expired entries are pruned.
const MAX_KEYS: usize = 1024;

pub(crate) struct FailureLogLimiter {
  window: Duration,
  seen: Mutex<HashMap<(String, String), Instant>>,
}

impl FailureLogLimiter {
  pub(crate) fn new(window: Duration) -> Self {
    Self {
      window,
      seen: Mutex::new(HashMap::new()),
    }
  }

  /// Returns true when a line should be logged for this key, recording the
  /// admission. Repeated keys within the window are suppressed.
  pub(crate) fn admit(&self, kind: &str, reason: &str) -> bool {
    let now = Instant::now();
    let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if seen.len() >= MAX_KEYS {
      let window = self.window;
      seen.retain(|_, last| now.duration_since(*last) < window);
    }

    let key = (kind.to_owned(), reason.to_owned());
    match seen.get(&key) {
      Some(last) if now.duration_since(*last) < self.window => false,
      _ => {
        seen.insert(key, now);
        true
      }
    }
  }
}
