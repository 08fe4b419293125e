//! Worker pool autoscaling.
//!
//! The controller ticks every `idle_interval` and watches three signals:
//! queue pressure (items waiting, or a worker that had to wait for a free
//! buffer), downstream throttling (429s over a rolling request window), and
//! the CPU-derived worker limit. Pressure grows the pool one worker at a
//! time, sustained idleness or throttling shrinks it, and the pool never
//! drops below one worker nor exceeds `max(1, cpus / 4)`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::indexer::{PoolState, spawn_worker, stop_one_worker};

/// Throttle rate is computed over at most this many of the most recent bulk
/// requests.
const REQUEST_WINDOW: u64 = 1000;

/// Shed workers while throttled requests exceed 1% of the window.
const MAX_THROTTLE_PERCENT: u64 = 1;

/// Rolling window of bulk request outcomes, fed with cumulative counters and
/// pruned to the most recent [`REQUEST_WINDOW`] requests.
struct RequestWindow {
  prev_requests: u64,
  prev_throttled: u64,
  deltas: VecDeque<(u64, u64)>,
  requests: u64,
  throttled: u64,
}

impl RequestWindow {
  fn new() -> Self {
    Self {
      prev_requests: 0,
      prev_throttled: 0,
      deltas: VecDeque::new(),
      requests: 0,
      throttled: 0,
    }
  }

  fn observe(&mut self, requests: u64, throttled: u64) {
    let delta_requests = requests.saturating_sub(self.prev_requests);
    let delta_throttled = throttled.saturating_sub(self.prev_throttled);
    self.prev_requests = requests;
    self.prev_throttled = throttled;
    if delta_requests == 0 && delta_throttled == 0 {
      return;
    }

    self.deltas.push_back((delta_requests, delta_throttled));
    self.requests += delta_requests;
    self.throttled += delta_throttled;
    while self.requests > REQUEST_WINDOW {
      let Some((requests, throttled)) = self.deltas.pop_front() else {
        break;
      };
      self.requests -= requests;
      self.throttled -= throttled;
    }
  }

  fn over_limit(&self) -> bool {
    self.requests > 0 && self.throttled * 100 > self.requests * MAX_THROTTLE_PERCENT
  }
}

pub(crate) struct ScalingController {
  state: Arc<PoolState>,
  up_ticks: u32,
  idle_ticks: u32,
  last_up: Option<Instant>,
  last_down: Option<Instant>,
  window: RequestWindow,
}

impl ScalingController {
  pub(crate) fn new(state: Arc<PoolState>) -> Self {
    // Cooldowns are measured from startup, so a freshly created pool does not
    // shed its workers on the first idle ticks.
    let started = Instant::now();
    Self {
      state,
      up_ticks: 0,
      idle_ticks: 0,
      last_up: Some(started),
      last_down: Some(started),
      window: RequestWindow::new(),
    }
  }

  pub(crate) async fn run(mut self) {
    let mut ticker = tokio::time::interval(self.state.config.scaling.idle_interval);
    // Skip the immediate tick.
    ticker.tick().await;
    debug!(
      interval_ms = self.state.config.scaling.idle_interval.as_millis() as u64,
      "scaling controller started"
    );

    loop {
      tokio::select! {
        _ = ticker.tick() => self.evaluate(Instant::now()),
        _ = self.state.close_token.cancelled() => break,
      }
    }
    debug!("scaling controller stopped");
  }

  fn evaluate(&mut self, now: Instant) {
    let scaling = &self.state.config.scaling;
    let stats = &self.state.stats;
    let limit = scaling.active_limit();
    let active = stats.indexers_active.load(Ordering::Relaxed) as usize;
    let waited = self.state.waited_for_buffer.swap(false, Ordering::Relaxed);

    // A lowered worker limit wins over cooldowns.
    if active > limit {
      for _ in 0..(active - limit) {
        if stop_one_worker(&self.state) {
          info!(limit, "stopped worker above pool limit");
        }
      }
      return;
    }

    self.window.observe(
      stats.bulk_requests.load(Ordering::Relaxed),
      stats.too_many_requests.load(Ordering::Relaxed),
    );
    if self.window.over_limit() {
      // The store is pushing back; shed workers until the rate recovers and
      // do not grow again before then.
      if active > 1 && stop_one_worker(&self.state) {
        self.last_down = Some(now);
        info!(active = active - 1, "scaled down on throttling");
      }
      return;
    }

    let pressure = waited || !self.state.items_rx.is_empty();
    if pressure {
      self.idle_ticks = 0;
      if active < limit {
        self.up_ticks += 1;
        if self.up_ticks >= scaling.scale_up.threshold && cooled(self.last_up, scaling.scale_up.cooldown, now) {
          spawn_worker(&self.state, true);
          self.up_ticks = 0;
          self.last_up = Some(now);
          info!(active = active + 1, "scaled up worker pool");
        }
      }
    } else {
      self.up_ticks = 0;
      self.idle_ticks += 1;
      if self.idle_ticks >= scaling.scale_down.threshold
        && active > 1
        && cooled(self.last_down, scaling.scale_down.cooldown, now)
        && stop_one_worker(&self.state)
      {
        self.idle_ticks = 0;
        self.last_down = Some(now);
        info!(active = active - 1, "scaled down idle worker pool");
      }
    }
  }
}

fn cooled(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
  last.map_or(true, |last| now.duration_since(last) >= cooldown)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_window_under_one_percent() {
    let mut window = RequestWindow::new();
    window.observe(200, 1);
    assert!(!window.over_limit());
  }

  #[test]
  fn test_window_over_one_percent() {
    let mut window = RequestWindow::new();
    window.observe(20, 0);
    window.observe(25, 5);
    assert!(window.over_limit());
  }

  #[test]
  fn test_window_recovers_with_successes() {
    let mut window = RequestWindow::new();
    window.observe(20, 0);
    window.observe(25, 5);
    assert!(window.over_limit());

    // A run of successful requests dilutes the throttled share below 1%.
    window.observe(625, 5);
    assert!(!window.over_limit());
  }

  #[test]
  fn test_window_prunes_old_outcomes() {
    let mut window = RequestWindow::new();
    window.observe(10, 10);
    for i in 1..=20u64 {
      window.observe(10 + i * 100, 10);
    }
    assert!(window.requests <= REQUEST_WINDOW + 100);
    // The throttled burst fell out of the window.
    assert_eq!(window.throttled, 0);
  }

  #[test]
  fn test_empty_window_not_over_limit() {
    let window = RequestWindow::new();
    assert!(!window.over_limit());
  }

  #[test]
  fn test_cooldown() {
    let now = Instant::now();
    assert!(cooled(None, Duration::from_secs(60), now));
    assert!(!cooled(Some(now), Duration::from_secs(60), now));
    assert!(cooled(Some(now - Duration::from_secs(61)), Duration::from_secs(60), now));
  }
}
