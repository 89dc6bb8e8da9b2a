//! Command queues.

use crate::context::Context;
use crate::diagnostics;
use crate::diagnostics::Status;
use crate::driver::{DeviceId, DeviceInfo, QueueId, QueueProperties};
use crate::error::{Error, Result};
use core::fmt;
use tracing::{debug, info, warn};

/// An in-order command queue bound to one device of a [`Context`].
///
/// Dropping the queue releases it; the context outlives it.
pub struct CommandQueue {
    id: QueueId,
    device: DeviceId,
    info: DeviceInfo,
    properties: QueueProperties,
    context: Context,
}

impl CommandQueue {
    /// Creates a default (in-order) queue on the first device of the context
    /// that accepts one.
    ///
    /// # Errors
    ///
    /// - [`Error::NoDevicesAvailable`] if the context holds no devices.
    /// - [`Error::QueueCreationFailed`] if every device refused, carrying the
    ///   last status.
    /// - [`Error::ContextQueryFailed`] if the device list cannot be read.
    pub fn provision(context: &Context) -> Result<Self> {
        Self::with_properties(context, QueueProperties::default())
    }

    /// Like [`provision`](CommandQueue::provision) with explicit properties.
    ///
    /// # Errors
    ///
    /// See [`provision`](CommandQueue::provision).
    pub fn with_properties(context: &Context, properties: QueueProperties) -> Result<Self> {
        if context.num_devices()? == 0 {
            return Err(Error::NoDevicesAvailable);
        }
        let devices = context.devices()?;
        let driver = context.driver();

        let mut last = Status::DEVICE_NOT_AVAILABLE;
        for &device in &devices {
            let info = context.device_info(device)?;
            match diagnostics::check_quiet(
                driver.create_command_queue(context.id(), device, properties),
                "device refused a command queue",
            ) {
                Ok(id) => {
                    info!(device = %info.name, class = %info.class, "command queue created");
                    return Ok(Self {
                        id,
                        device,
                        info,
                        properties,
                        context: context.clone(),
                    });
                }
                Err(status) => {
                    debug!(device = %info.name, %status, "skipping device");
                    last = status;
                }
            }
        }
        Err(Error::QueueCreationFailed {
            devices: devices.len(),
            status: last,
        })
    }

    /// Blocks until every enqueued command has completed.
    ///
    /// # Errors
    ///
    /// [`Error::SyncFailed`].
    pub fn finish(&self) -> Result<()> {
        diagnostics::check(self.context.driver().finish(self.id), "failed to finish command queue")
            .map_err(Error::SyncFailed)
    }

    /// Submits enqueued commands without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::SyncFailed`].
    pub fn flush(&self) -> Result<()> {
        diagnostics::check(self.context.driver().flush(self.id), "failed to flush command queue")
            .map_err(Error::SyncFailed)
    }

    /// Driver handle.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// The device commands run on.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Description of [`device`](CommandQueue::device).
    #[must_use]
    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Properties the queue was created with.
    #[must_use]
    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    /// The owning context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(status) = self.context.driver().release_command_queue(self.id) {
            warn!(queue = %self.id, %status, "failed to release command queue");
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("device", &self.info.name)
            .field("properties", &self.properties)
            .finish()
    }
}
