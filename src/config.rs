//! Harness configuration.
//!
//! ```
//! use briny_cl::{HarnessConfig, SelectionStrategy};
//! use briny_cl::driver::DeviceClass;
//!
//! let config = HarnessConfig::builder()
//!     .device_class(DeviceClass::Cpu)
//!     .strategy(SelectionStrategy::FirstMatching)
//!     .build_options("-DBLOCK=4")
//!     .build()
//!     .unwrap();
//! assert_eq!(config.device_class, DeviceClass::Cpu);
//! ```

use crate::context::ErrorPolicy;
use crate::driver::{DeviceClass, QueueProperties};
use crate::error::{Error, Result};
use crate::platform::SelectionStrategy;
use std::path::PathBuf;

/// Device class override.
pub const ENV_DEVICE: &str = "BRINY_CL_DEVICE";
/// Selection strategy override.
pub const ENV_STRATEGY: &str = "BRINY_CL_STRATEGY";
/// Compiler options override.
pub const ENV_OPTIONS: &str = "BRINY_CL_OPTIONS";
/// Kernel source directory override.
pub const ENV_KERNEL_DIR: &str = "BRINY_CL_KERNEL_DIR";

/// Everything a [`Session`](crate::Session) needs to know up front.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// How the platform is chosen.
    pub strategy: SelectionStrategy,
    /// Preferred device class.
    pub device_class: DeviceClass,
    /// Behaviour of the context error hook.
    pub error_policy: ErrorPolicy,
    /// Compiler options passed verbatim to every build.
    pub build_options: String,
    /// Directory kernel sources are loaded from.
    pub kernel_dir: PathBuf,
    /// Properties of the run's command queue.
    pub queue_properties: QueueProperties,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            device_class: DeviceClass::Gpu,
            error_policy: ErrorPolicy::default(),
            build_options: String::new(),
            kernel_dir: PathBuf::from("kernels"),
            queue_properties: QueueProperties::default(),
        }
    }
}

impl HarnessConfig {
    /// Starts from the defaults.
    #[must_use]
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::new()
    }

    /// Defaults overridden by the `BRINY_CL_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(device) = lookup(ENV_DEVICE) {
            builder = builder.device_class(device.parse().map_err(|e| Error::Config(format!("{ENV_DEVICE}: {e}")))?);
        }
        if let Some(strategy) = lookup(ENV_STRATEGY) {
            builder = builder.strategy(strategy.parse().map_err(|e| Error::Config(format!("{ENV_STRATEGY}: {e}")))?);
        }
        if let Some(options) = lookup(ENV_OPTIONS) {
            builder = builder.build_options(options);
        }
        if let Some(dir) = lookup(ENV_KERNEL_DIR) {
            builder = builder.kernel_dir(dir);
        }
        builder.build()
    }

    /// Checks the configuration for values no driver can accept.
    ///
    /// # Errors
    ///
    /// [`Error::Config`].
    pub fn validate(&self) -> Result<()> {
        if self.build_options.contains('\0') {
            return Err(Error::Config("build options contain a NUL byte".into()));
        }
        if self.kernel_dir.as_os_str().is_empty() {
            return Err(Error::Config("kernel directory is empty".into()));
        }
        Ok(())
    }
}

/// Builder for [`HarnessConfig`].
#[derive(Debug, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    /// Starts from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the selection strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Sets the preferred device class.
    #[must_use]
    pub fn device_class(mut self, class: DeviceClass) -> Self {
        self.config.device_class = class;
        self
    }

    /// Sets the context error policy.
    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    /// Sets the compiler options.
    #[must_use]
    pub fn build_options(mut self, options: impl Into<String>) -> Self {
        self.config.build_options = options.into();
        self
    }

    /// Sets the kernel source directory.
    #[must_use]
    pub fn kernel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.kernel_dir = dir.into();
        self
    }

    /// Sets the queue properties.
    #[must_use]
    pub fn queue_properties(mut self, properties: QueueProperties) -> Self {
        self.config.queue_properties = properties;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`].
    pub fn build(self) -> Result<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.device_class, DeviceClass::Gpu);
        assert_eq!(config.strategy, SelectionStrategy::FirstPlatformFallback);
        assert!(config.error_policy.is_fatal());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[
            (ENV_DEVICE, "cpu"),
            (ENV_STRATEGY, "first-matching"),
            (ENV_OPTIONS, "-cl-fast-relaxed-math"),
            (ENV_KERNEL_DIR, "/opt/kernels"),
        ]))
        .unwrap();
        assert_eq!(config.device_class, DeviceClass::Cpu);
        assert_eq!(config.strategy, SelectionStrategy::FirstMatching);
        assert_eq!(config.build_options, "-cl-fast-relaxed-math");
        assert_eq!(config.kernel_dir, PathBuf::from("/opt/kernels"));
    }

    #[test]
    fn bad_environment_values() {
        let err = HarnessConfig::from_lookup(lookup(&[(ENV_DEVICE, "fpga")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains(ENV_DEVICE));
    }

    #[test]
    fn validation() {
        assert!(HarnessConfig::builder().build_options("-D\0X").build().is_err());
        assert!(HarnessConfig::builder().kernel_dir("").build().is_err());
    }
}
