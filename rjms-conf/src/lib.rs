#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rjms_utils::deserialize_duration;

use self::logging::Log;

pub mod logging;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub broker: Broker,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    #[inline]
    fn default() -> Self {
        Self::from_inner(Inner::default())
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rjms/rjms").required(false))
            .add_source(File::with_name("rjms").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("rjms").separator("__").try_parsing(true));

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("gc_interval is {:?}", self.broker.gc_interval);
        log::info!("gc_aggressive is {}", self.broker.gc_aggressive);
        log::info!("auto_create_destinations is {}", self.broker.auto_create_destinations);
        log::info!("lease_check_interval is {:?}", self.broker.lease_check_interval);
        log::info!("message_cache_max is {}", self.broker.message_cache_max);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, layered after the default locations.
    pub cfg_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    //Interval between garbage collection sweeps of destination caches.
    #[serde(default = "Broker::gc_interval_default", deserialize_with = "deserialize_duration")]
    pub gc_interval: Duration,

    //Aggressive sweeps also evict persistent messages from memory.
    #[serde(default)]
    pub gc_aggressive: bool,

    //Create unknown destinations on first use instead of rejecting them.
    #[serde(default = "Broker::auto_create_destinations_default")]
    pub auto_create_destinations: bool,

    //Longest the lease timer sleeps before re-checking its queue.
    #[serde(default = "Broker::lease_check_interval_default", deserialize_with = "deserialize_duration")]
    pub lease_check_interval: Duration,

    //Soft cap of cached messages; above it a sweep runs aggressively.
    #[serde(default = "Broker::message_cache_max_default")]
    pub message_cache_max: usize,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self {
            gc_interval: Self::gc_interval_default(),
            gc_aggressive: false,
            auto_create_destinations: Self::auto_create_destinations_default(),
            lease_check_interval: Self::lease_check_interval_default(),
            message_cache_max: Self::message_cache_max_default(),
        }
    }
}

impl Broker {
    fn gc_interval_default() -> Duration {
        Duration::from_secs(30)
    }
    fn auto_create_destinations_default() -> bool {
        true
    }
    fn lease_check_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn message_cache_max_default() -> usize {
        100_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.broker.gc_interval, Duration::from_secs(30));
        assert!(s.broker.auto_create_destinations);
        assert!(!s.broker.gc_aggressive);
        assert_eq!(s.broker.lease_check_interval, Duration::from_secs(1));
        assert_eq!(s.broker.message_cache_max, 100_000);
    }

    #[test]
    fn test_deserialize_from_toml() {
        let cfg = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [log]
                to = "file"
                level = "debug"

                [broker]
                gc_interval = "5s"
                gc_aggressive = true
                auto_create_destinations = false
                lease_check_interval = "200ms"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let inner: Inner = cfg.try_deserialize().unwrap();
        assert_eq!(inner.log.to, logging::To::File);
        assert_eq!(inner.log.level.inner(), slog::Level::Debug);
        assert_eq!(inner.broker.gc_interval, Duration::from_secs(5));
        assert!(inner.broker.gc_aggressive);
        assert!(!inner.broker.auto_create_destinations);
        assert_eq!(inner.broker.lease_check_interval, Duration::from_millis(200));
        assert_eq!(inner.broker.message_cache_max, 100_000);
    }
}
