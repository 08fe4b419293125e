//! Indexer configuration.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Compression applied to bulk payloads on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
  /// No compression; payloads are sent as raw newline-delimited JSON.
  None,
  BestSpeed,
  #[default]
  Default,
  BestCompression,
}

impl CompressionLevel {
  pub(crate) fn enabled(self) -> bool {
    !matches!(self, Self::None)
  }

  pub(crate) fn gzip(self) -> Option<flate2::Compression> {
    match self {
      Self::None => None,
      Self::BestSpeed => Some(flate2::Compression::fast()),
      Self::Default => Some(flate2::Compression::default()),
      Self::BestCompression => Some(flate2::Compression::best()),
    }
  }
}

/// Threshold and cooldown for one scaling direction.
#[derive(Debug, Clone, Copy)]
pub struct ScaleTrigger {
  /// Consecutive qualifying ticks before the action fires.
  pub threshold: u32,
  /// Minimum elapsed time between two actions in this direction.
  pub cooldown: Duration,
}

/// Autoscaling configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
  /// Disables the controller entirely; the pool stays at one worker.
  pub disabled: bool,
  /// Tick interval of the control loop.
  pub idle_interval: Duration,
  pub scale_up: ScaleTrigger,
  pub scale_down: ScaleTrigger,
  /// Overrides the CPU count behind the worker limit `max(1, cpus / 4)`.
  /// The value is read on every tick, so callers tracking a cgroup quota can
  /// update it at runtime. Defaults to `std::thread::available_parallelism()`.
  pub available_cpus: Option<Arc<AtomicUsize>>,
}

impl Default for ScalingConfig {
  fn default() -> Self {
    Self {
      disabled: false,
      idle_interval: Duration::from_secs(30),
      scale_up: ScaleTrigger {
        threshold: 60,
        cooldown: Duration::from_secs(60),
      },
      scale_down: ScaleTrigger {
        threshold: 30,
        cooldown: Duration::from_secs(60),
      },
      available_cpus: None,
    }
  }
}

impl ScalingConfig {
  /// Upper bound on concurrently running workers.
  pub(crate) fn active_limit(&self) -> usize {
    let cpus = match &self.available_cpus {
      Some(cpus) => cpus.load(Ordering::Relaxed),
      None => std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
    };
    (cpus / 4).max(1)
  }
}

/// Indexer configuration. Validated by `Indexer::new`.
#[derive(Debug, Clone)]
pub struct Config {
  /// Flush once the framed (compressed) buffer reaches this many bytes.
  pub flush_bytes: usize,
  /// Flush once the oldest buffered item is this old.
  pub flush_interval: Duration,
  /// Number of pooled bulk buffers; caps concurrent in-flight bulk requests.
  pub max_bulk_requests: usize,
  /// Capacity of the shared items queue feeding the workers.
  pub event_buffer_size: usize,
  pub compression: CompressionLevel,
  pub scaling: ScalingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      flush_bytes: 5 * 1024 * 1024,
      flush_interval: Duration::from_secs(30),
      max_bulk_requests: 10,
      event_buffer_size: 100,
      compression: CompressionLevel::default(),
      scaling: ScalingConfig::default(),
    }
  }
}

impl Config {
  pub(crate) fn validate(&self) -> Result<(), String> {
    if self.flush_bytes == 0 {
      return Err("flush_bytes must be positive".into());
    }
    if self.flush_interval.is_zero() {
      return Err("flush_interval must be positive".into());
    }
    if self.max_bulk_requests == 0 {
      return Err("max_bulk_requests must be positive".into());
    }
    if self.event_buffer_size == 0 {
      return Err("event_buffer_size must be positive".into());
    }
    if !self.scaling.disabled {
      if self.scaling.idle_interval.is_zero() {
        return Err("scaling.idle_interval must be positive".into());
      }
      if self.scaling.scale_up.threshold == 0 || self.scaling.scale_down.threshold == 0 {
        return Err("scaling thresholds must be positive".into());
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.flush_bytes, 5 * 1024 * 1024);
    assert_eq!(config.flush_interval, Duration::from_secs(30));
    assert_eq!(config.max_bulk_requests, 10);
    assert_eq!(config.event_buffer_size, 100);
    assert_eq!(config.compression, CompressionLevel::Default);
    assert!(!config.scaling.disabled);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_validation_rejects_zeroes() {
    let mut config = Config::default();
    config.flush_bytes = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.max_bulk_requests = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.event_buffer_size = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.scaling.idle_interval = Duration::ZERO;
    assert!(config.validate().is_err());

    // A zero idle interval is fine when scaling never runs.
    config.scaling.disabled = true;
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_active_limit_from_override() {
    let cpus = Arc::new(AtomicUsize::new(12));
    let scaling = ScalingConfig {
      available_cpus: Some(Arc::clone(&cpus)),
      ..ScalingConfig::default()
    };
    assert_eq!(scaling.active_limit(), 3);

    cpus.store(4, Ordering::Relaxed);
    assert_eq!(scaling.active_limit(), 1);

    cpus.store(0, Ordering::Relaxed);
    assert_eq!(scaling.active_limit(), 1);
  }
}
