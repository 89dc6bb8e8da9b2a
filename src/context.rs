//! Execution contexts and their error hook.
//!
//! A [`Context`] owns one driver context for its lifetime. The driver may
//! report runtime errors asynchronously; those go to the single hook
//! installed when the context was created, whose behaviour is chosen by an
//! [`ErrorPolicy`]. There is no process-wide callback state: every context
//! carries its own.
//!
//! `Context` is a cheap handle. Queues, programs and buffers keep a clone,
//! so the driver context is released only after everything created from it.

use crate::diagnostics::{self, Status};
use crate::driver::{ContextId, ContextNotify, DeviceClass, DeviceId, DeviceInfo, Driver, PlatformId};
use crate::error::{Error, Result};
use core::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happens when the driver reports an asynchronous context error.
#[derive(Clone, Default)]
pub enum ErrorPolicy {
    /// Log the error and terminate the process with a failure status.
    #[default]
    Fatal,
    /// Log the error and continue.
    LogOnly,
    /// Log the error and hand it to an observer.
    Report(Arc<dyn Fn(&str) + Send + Sync>),
}

impl ErrorPolicy {
    /// A [`Report`](ErrorPolicy::Report) policy calling `observer`.
    pub fn report(observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self::Report(Arc::new(observer))
    }

    /// Whether a reported error terminates the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }

    pub(crate) fn notifier(&self) -> ContextNotify {
        match self.clone() {
            Self::Fatal => Arc::new(|message: &str| {
                error!("context error: {message}");
                eprintln!("context error: {message}");
                std::process::exit(1);
            }),
            Self::LogOnly => Arc::new(|message: &str| {
                warn!("context error: {message}");
            }),
            Self::Report(observer) => Arc::new(move |message: &str| {
                warn!("context error: {message}");
                observer(message);
            }),
        }
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => f.write_str("Fatal"),
            Self::LogOnly => f.write_str("LogOnly"),
            Self::Report(_) => f.write_str("Report(..)"),
        }
    }
}

struct ContextInner {
    driver: Arc<dyn Driver>,
    id: ContextId,
    platform: PlatformId,
    platform_name: String,
    class: DeviceClass,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Err(status) = self.driver.release_context(self.id) {
            warn!(context = %self.id, %status, "failed to release context");
        } else {
            debug!(context = %self.id, "context released");
        }
    }
}

/// A live driver context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a context of `class` on `platform` with the policy's error
    /// hook installed.
    ///
    /// Most callers go through [`PlatformSelector`](crate::PlatformSelector)
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns the driver's status when it refuses the context.
    pub fn from_type(
        driver: &Arc<dyn Driver>,
        platform: PlatformId,
        class: DeviceClass,
        policy: &ErrorPolicy,
    ) -> core::result::Result<Self, Status> {
        let platform_name = driver
            .platform_name(platform)
            .unwrap_or_else(|_| platform.to_string());
        let id = driver.create_context_from_type(platform, class, Some(policy.notifier()))?;
        debug!(context = %id, platform = %platform_name, %class, ?policy, "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                driver: Arc::clone(driver),
                id,
                platform,
                platform_name,
                class,
            }),
        })
    }

    /// The driver this context belongs to.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    /// Driver handle.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Platform the context was created on.
    #[must_use]
    pub fn platform(&self) -> PlatformId {
        self.inner.platform
    }

    /// Display name of the platform.
    #[must_use]
    pub fn platform_name(&self) -> &str {
        &self.inner.platform_name
    }

    /// Device class the context was created for.
    #[must_use]
    pub fn class(&self) -> DeviceClass {
        self.inner.class
    }

    /// Number of devices in the context.
    ///
    /// # Errors
    ///
    /// [`Error::ContextQueryFailed`].
    pub fn num_devices(&self) -> Result<usize> {
        diagnostics::check(
            self.driver().context_num_devices(self.id()),
            "failed to query context device count",
        )
        .map_err(Error::ContextQueryFailed)
    }

    /// Devices in the context, in driver order.
    ///
    /// # Errors
    ///
    /// [`Error::ContextQueryFailed`].
    pub fn devices(&self) -> Result<Vec<DeviceId>> {
        diagnostics::check(self.driver().context_devices(self.id()), "failed to list context devices")
            .map_err(Error::ContextQueryFailed)
    }

    /// Describes one device.
    ///
    /// # Errors
    ///
    /// [`Error::ContextQueryFailed`].
    pub fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        diagnostics::check(self.driver().device_info(device), "failed to query device info")
            .map_err(Error::ContextQueryFailed)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("platform", &self.inner.platform_name)
            .field("class", &self.inner.class)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::reference::{DeviceSpec, PlatformSpec, ReferenceDriver};
    use parking_lot::Mutex;

    fn driver() -> (Arc<ReferenceDriver>, Arc<dyn Driver>) {
        let reference = Arc::new(
            ReferenceDriver::builder()
                .platform(PlatformSpec::new("P").device(DeviceSpec::cpu("C")))
                .build(),
        );
        let driver: Arc<dyn Driver> = reference.clone();
        (reference, driver)
    }

    #[test]
    fn release_on_last_drop() {
        let (reference, driver) = driver();
        let platform = driver.platform_ids().unwrap()[0];
        let ctx = Context::from_type(&driver, platform, DeviceClass::Cpu, &ErrorPolicy::LogOnly).unwrap();
        let copy = ctx.clone();
        assert_eq!(ctx.platform_name(), "P");
        assert_eq!(copy.num_devices().unwrap(), 1);
        drop(ctx);
        assert!(!reference.ledger().is_balanced());
        drop(copy);
        assert!(reference.ledger().is_balanced());
    }

    #[test]
    fn hook_is_installed() {
        let (reference, driver) = driver();
        let platform = driver.platform_ids().unwrap()[0];
        let _ctx = Context::from_type(&driver, platform, DeviceClass::Cpu, &ErrorPolicy::LogOnly).unwrap();
        assert!(reference.context_requests().iter().all(|r| r.with_notify));
    }

    #[test]
    fn report_policy_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let policy = ErrorPolicy::report(move |m| sink.lock().push(m.to_owned()));
        assert!(!policy.is_fatal());
        (policy.notifier())("boom");
        assert_eq!(*seen.lock(), vec!["boom".to_owned()]);
        assert_eq!(format!("{policy:?}"), "Report(..)");
    }

    #[test]
    fn refused_context_reports_status() {
        let (_, driver) = driver();
        let platform = driver.platform_ids().unwrap()[0];
        let err = Context::from_type(&driver, platform, DeviceClass::Gpu, &ErrorPolicy::LogOnly).unwrap_err();
        assert_eq!(err, Status::DEVICE_NOT_FOUND);
    }
}
