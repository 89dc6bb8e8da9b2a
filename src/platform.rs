//! Platform selection.
//!
//! Two strategies decide which platform (and which device class) a run gets
//! its context from:
//!
//! - [`SelectionStrategy::FirstMatching`] walks every platform and takes the
//!   first one that can create a context of the preferred class. No class
//!   fallback.
//! - [`SelectionStrategy::FirstPlatformFallback`] always uses platform #0 and
//!   walks the class fallback chain (`ACCELERATOR → GPU → CPU`, starting at
//!   the preferred class), trying each class exactly once.
//!
//! Every failed attempt is kept and returned in
//! [`Error::ContextCreationFailed`] when nothing succeeds. There are no
//! retries beyond that bounded walk.

use crate::context::{Context, ErrorPolicy};
use crate::diagnostics;
use crate::diagnostics::Status;
use crate::driver::{DeviceClass, Driver, PlatformId};
use crate::error::{ContextAttempt, Error, Result};
use core::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a platform is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectionStrategy {
    /// Enumerate every platform; first one offering the preferred class wins.
    FirstMatching,
    /// Platform #0 only, falling back across device classes.
    #[default]
    FirstPlatformFallback,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstMatching => write!(f, "first-matching"),
            Self::FirstPlatformFallback => write!(f, "first-platform-fallback"),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "first-matching" | "matching" | "all" => Ok(Self::FirstMatching),
            "first-platform-fallback" | "fallback" | "first" => Ok(Self::FirstPlatformFallback),
            other => Err(format!("unknown selection strategy `{other}`")),
        }
    }
}

/// Chooses a platform and creates the run's [`Context`].
#[derive(Debug, Clone)]
pub struct PlatformSelector {
    driver: Arc<dyn Driver>,
    strategy: SelectionStrategy,
    policy: ErrorPolicy,
}

impl PlatformSelector {
    /// A selector using the default strategy and error policy.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            strategy: SelectionStrategy::default(),
            policy: ErrorPolicy::default(),
        }
    }

    /// Sets the selection strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the error policy installed on the created context.
    #[must_use]
    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Creates a context, preferring devices of class `preferred`.
    ///
    /// # Errors
    ///
    /// [`Error::NoPlatformFound`] when the driver reports no platforms, and
    /// [`Error::ContextCreationFailed`] listing every attempt when none
    /// succeeded.
    pub fn select(&self, preferred: DeviceClass) -> Result<Context> {
        let platforms = diagnostics::check(self.driver.platform_ids(), "failed to enumerate platforms")
            .map_err(Error::NoPlatformFound)?;
        if platforms.is_empty() {
            return Err(Error::NoPlatformFound(Status::PLATFORM_NOT_FOUND_KHR));
        }
        debug!(count = platforms.len(), strategy = %self.strategy, "platforms enumerated");

        let mut attempts = Vec::new();
        let context = match self.strategy {
            SelectionStrategy::FirstMatching => platforms
                .iter()
                .find_map(|&platform| self.attempt(platform, preferred, &mut attempts)),
            SelectionStrategy::FirstPlatformFallback => {
                let platform = platforms[0];
                preferred.fallback_chain().iter().find_map(|&class| {
                    let context = self.attempt(platform, class, &mut attempts);
                    if context.is_none() {
                        warn!(%class, "context unavailable, trying next device class");
                    }
                    context
                })
            }
        };

        match context {
            Some(context) => {
                info!(
                    platform = context.platform_name(),
                    class = %context.class(),
                    "selected platform `{}`",
                    context.platform_name()
                );
                Ok(context)
            }
            None => Err(Error::ContextCreationFailed {
                requested: preferred,
                attempts,
            }),
        }
    }

    fn attempt(
        &self,
        platform: PlatformId,
        class: DeviceClass,
        attempts: &mut Vec<ContextAttempt>,
    ) -> Option<Context> {
        match Context::from_type(&self.driver, platform, class, &self.policy) {
            Ok(context) => Some(context),
            Err(status) => {
                let name = self
                    .driver
                    .platform_name(platform)
                    .unwrap_or_else(|_| platform.to_string());
                debug!(platform = %name, %class, %status, "context creation failed");
                attempts.push(ContextAttempt {
                    platform: name,
                    class,
                    status,
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_round_trip() {
        for strategy in [SelectionStrategy::FirstMatching, SelectionStrategy::FirstPlatformFallback] {
            assert_eq!(strategy.to_string().parse::<SelectionStrategy>(), Ok(strategy));
        }
        assert_eq!("FIRST_MATCHING".parse(), Ok(SelectionStrategy::FirstMatching));
        assert_eq!("fallback".parse(), Ok(SelectionStrategy::FirstPlatformFallback));
        assert!("random".parse::<SelectionStrategy>().is_err());
    }
}
