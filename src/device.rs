use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::clock::{Clock, SystemClock};

/// Apple's USB vendor id, shared by DFU mode and the booted PongoOS.
pub const APPLE_VID: u16 = 0x05ac;
/// Product id the device reports while in DFU mode.
pub const DFU_PID: u16 = 0x1227;
/// Product id the device re-enumerates with once the combined image is executing.
pub const PONGO_PID: u16 = 0x4141;

/// Class request, host to device, recipient interface.
pub const DFU_REQUEST_TYPE: u8 = 0x21;
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_CLRSTATUS: u8 = 4;

/// Substring of the serial number string once the bootrom has been exploited.
pub const PWNED_DFU_MARKER: &str = "PWND:[";

const TIMEOUT_DURATION: Duration = Duration::from_secs(4);
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to iterate over USB devices: {0}")]
    Enumerate(rusb::Error),
    #[error("Failed to reset USB device: {0}")]
    Reset(rusb::Error),
    #[error("Device {vendor_id:04x}:{product_id:04x} did not become ready within {waited:.1?}")]
    NotReady {
        vendor_id: u16,
        product_id: u16,
        waited: Duration,
    },
    #[error("Failed to reopen USB session as {vendor_id:04x}:{product_id:04x}: {source}")]
    Reopen {
        vendor_id: u16,
        product_id: u16,
        source: rusb::Error,
    },
}

/// A control-transfer session with a single device, addressed by vendor/product id.
pub trait Transport {
    /// Issues a host-to-device control request and returns how many bytes the device accepted.
    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, rusb::Error>;

    fn reset(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    /// Rebinds the session to a new identity. The device does not need to be present yet.
    fn reopen(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError>;

    /// Blocks until the device bound by the last open/reopen can be talked to.
    fn wait_ready(&mut self) -> Result<(), TransportError>;
}

pub trait IdentityReader {
    /// Returns the device's serial number string, or `None` if it does not answer.
    fn identity(&mut self) -> Option<String>;
}

pub fn is_pwned_dfu(identity: &str) -> bool {
    identity.contains(PWNED_DFU_MARKER)
}

/// Returns `product_id` if a device reporting `vendor_id:product_id` is one of the wanted ids.
fn matching_product(
    wanted_vendor: u16,
    wanted_products: &[u16],
    vendor_id: u16,
    product_id: u16,
) -> Option<u16> {
    (vendor_id == wanted_vendor && wanted_products.contains(&product_id)).then_some(product_id)
}

/// Calls `try_open` every [`OPEN_RETRY_INTERVAL`] until it yields a handle.
///
/// Enumeration errors are logged and retried. On timeout the time waited is returned.
fn poll_open<H, C: Clock>(
    clock: &C,
    timeout: Option<Duration>,
    mut try_open: impl FnMut() -> Result<Option<H>, TransportError>,
) -> Result<H, Duration> {
    let start = clock.now();

    loop {
        match try_open() {
            Ok(Some(handle)) => return Ok(handle),
            Ok(None) => {}
            Err(why) => tracing::debug!("{why}, retrying"),
        }

        let waited = clock.now() - start;
        if let Some(timeout) = timeout
            && waited > timeout
        {
            return Err(waited);
        }

        clock.sleep(OPEN_RETRY_INTERVAL);
    }
}

pub struct UsbSession {
    handle: Option<DeviceHandle<GlobalContext>>,
    vendor_id: u16,
    /// Product ids accepted by the next open.
    wanted_products: Vec<u16>,
    /// Product id of the open device, or the first wanted one before it opens.
    product_id: u16,
    ready_timeout: Option<Duration>,
}

impl UsbSession {
    /// Waits for a device with `vendor_id` and any of `product_ids` to enumerate and opens it.
    /// [`UsbSession::product_id`] tells which one was found.
    ///
    /// `timeout` of `None` waits forever.
    pub fn wait_for(
        vendor_id: u16,
        product_ids: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let mut session = Self {
            handle: None,
            vendor_id,
            wanted_products: product_ids.to_vec(),
            product_id: product_ids.first().copied().unwrap_or_default(),
            ready_timeout: timeout,
        };
        session.wait_ready()?;
        Ok(session)
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Bounds every later [`Transport::wait_ready`] call. `None` waits forever.
    pub fn set_ready_timeout(&mut self, timeout: Option<Duration>) {
        self.ready_timeout = timeout;
    }

    fn try_open(&self) -> Result<Option<(DeviceHandle<GlobalContext>, u16)>, TransportError> {
        let raw_devices = rusb::devices().map_err(TransportError::Enumerate)?;

        for device in raw_devices.iter() {
            let device_descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(why) => {
                    tracing::trace!("Failed to fetch USB device descriptor: {why}");
                    continue;
                }
            };

            let Some(product_id) = matching_product(
                self.vendor_id,
                &self.wanted_products,
                device_descriptor.vendor_id(),
                device_descriptor.product_id(),
            ) else {
                continue;
            };

            tracing::debug!(
                "Found device: Bus {:03} Device {:03} ID {:04x}:{:04x}",
                device.bus_number(),
                device.address(),
                device_descriptor.vendor_id(),
                product_id,
            );

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(why) => {
                    tracing::debug!("Failed to open USB device: {why}");
                    continue;
                }
            };

            if let Err(why) = handle.claim_interface(0) {
                tracing::debug!("Failed to claim interface 0, continuing unclaimed: {why}");
            }

            return Ok(Some((handle, product_id)));
        }

        Ok(None)
    }
}

impl Transport for UsbSession {
    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, rusb::Error> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(rusb::Error::NoDevice);
        };

        tracing::trace!(
            "Control out: type={request_type:#04x} request={request} value={value} index={index} len={:#x}",
            data.len()
        );

        handle.write_control(request_type, request, value, index, data, TIMEOUT_DURATION)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        match self.handle.as_ref() {
            Some(handle) => handle.reset().map_err(TransportError::Reset),
            None => Err(TransportError::Reset(rusb::Error::NoDevice)),
        }
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            tracing::debug!(
                "Closed USB session {:04x}:{:04x}",
                self.vendor_id,
                self.product_id
            );
        }
    }

    fn reopen(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError> {
        self.close();
        self.vendor_id = vendor_id;
        self.wanted_products = vec![product_id];
        self.product_id = product_id;

        match self.try_open() {
            Ok(opened) => {
                self.handle = opened.map(|(handle, _)| handle);
                Ok(())
            }
            Err(TransportError::Enumerate(source)) => Err(TransportError::Reopen {
                vendor_id,
                product_id,
                source,
            }),
            Err(why) => Err(why),
        }
    }

    fn wait_ready(&mut self) -> Result<(), TransportError> {
        if self.handle.is_none() {
            let clock = SystemClock::new();
            match poll_open(&clock, self.ready_timeout, || self.try_open()) {
                Ok((handle, product_id)) => {
                    self.handle = Some(handle);
                    self.product_id = product_id;
                    tracing::debug!(
                        "USB session {:04x}:{:04x} ready after {:.2}s",
                        self.vendor_id,
                        self.product_id,
                        clock.now().as_secs_f64()
                    );
                }
                Err(waited) => {
                    return Err(TransportError::NotReady {
                        vendor_id: self.vendor_id,
                        product_id: self.product_id,
                        waited,
                    });
                }
            }
        }

        Ok(())
    }
}

impl IdentityReader for UsbSession {
    fn identity(&mut self) -> Option<String> {
        let handle = self.handle.as_ref()?;

        let device_descriptor = match handle.device().device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(why) => {
                tracing::trace!("Failed to fetch USB device descriptor: {why}");
                return None;
            }
        };

        match handle.read_serial_number_string_ascii(&device_descriptor) {
            Ok(serial) => {
                tracing::trace!("Read serial number: '{serial}'");
                Some(serial)
            }
            Err(why) => {
                tracing::trace!("Failed to read serial number string: {why}");
                None
            }
        }
    }
}
