//! Explicit log configuration for the driver and the engine.

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

/// Target prefix of the driver's events.
pub const DRIVER_TARGET: &str = env!("CARGO_CRATE_NAME");

/// Target prefix of the built-in engine's events.
pub const ENGINE_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::engine");

#[derive(Debug, Error, PartialEq)]
#[error("verbosity must be one of 1=debug, 2=info, 3=warning, 4=error but got {0}")]
pub struct InvalidVerbosity(pub u8);

/// Command-line verbosity level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl TryFrom<u8> for Verbosity {
    type Error = InvalidVerbosity;

    fn try_from(level: u8) -> Result<Self, InvalidVerbosity> {
        match level {
            1 => Ok(Self::Debug),
            2 => Ok(Self::Info),
            3 => Ok(Self::Warning),
            4 => Ok(Self::Error),
            other => Err(InvalidVerbosity(other)),
        }
    }
}

impl From<Verbosity> for LevelFilter {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Error => LevelFilter::ERROR,
        }
    }
}

/// Per-component log levels.
///
/// Built once from the command line and handed to the driver and the engine
/// when they are constructed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogConfig {
    pub driver: LevelFilter,
    pub engine: LevelFilter,
}

impl LogConfig {
    pub fn new(driver: LevelFilter, engine: LevelFilter) -> Self {
        Self { driver, engine }
    }

    /// Returns true if the engine should produce debug diagnostics.
    pub fn engine_debug(&self) -> bool {
        self.engine >= LevelFilter::DEBUG
    }

    pub fn driver_debug(&self) -> bool {
        self.driver >= LevelFilter::DEBUG
    }

    /// Filter that applies `self` to this crate's targets only.
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_target(ENGINE_TARGET, self.engine)
            .with_target(DRIVER_TARGET, self.driver)
    }

    /// Install a global formatting subscriber filtered by `self`.
    ///
    /// Does nothing if a global subscriber is already installed.
    pub fn init(&self) {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(self.targets())
            .try_init();
    }
}

impl From<Verbosity> for LogConfig {
    fn from(verbosity: Verbosity) -> Self {
        let level = LevelFilter::from(verbosity);
        Self::new(level, level)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Verbosity::default().into()
    }
}
