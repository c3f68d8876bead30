//! nusb-based USB transport implementation.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use nusb::transfer::{Bulk, In, Out};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{GOODIX_VENDOR_ID, SUPPORTED_PIDS};

const SENSOR_INTERFACE: u8 = 0;

/// nusb-based USB transport.
///
/// The interface is claimed lazily through [`UsbTransport::claim_interface`],
/// matching the device init/deinit lifecycle of the session layer.
pub struct NusbTransport {
    device: Device,
    interface: Mutex<Option<Interface>>,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open any matching Goodix sensor (tries all supported PIDs).
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == GOODIX_VENDOR_ID
                && SUPPORTED_PIDS.contains(&device_info.product_id())
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: GOODIX_VENDOR_ID,
            pid: 0,
        })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found sensor"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == SENSOR_INTERFACE {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Sensor opened"
        );

        Ok(Self {
            device,
            interface: Mutex::new(None),
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }
}

/// Map a blocking-IO failure to the transport taxonomy. nusb reports an
/// expired transfer deadline as `ErrorKind::TimedOut`.
fn transfer_error(
    err: std::io::Error,
    timeout: Duration,
    failure: fn(String) -> TransportError,
) -> TransportError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        failure(err.to_string())
    }
}

impl UsbTransport for NusbTransport {
    fn claim_interface(&self) -> Result<(), TransportError> {
        let mut guard = self.interface.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let interface = self
            .device
            .claim_interface(SENSOR_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: SENSOR_INTERFACE,
                message: e.to_string(),
            })?;
        *guard = Some(interface);
        debug!(interface = SENSOR_INTERFACE, "Interface claimed");
        Ok(())
    }

    fn release_interface(&self) -> Result<(), TransportError> {
        // Dropping the Interface releases the claim.
        let released = self.interface.lock().unwrap().take();
        debug!(released = released.is_some(), "Interface released");
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn bulk_out(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let guard = self.interface.lock().unwrap();
        let iface = guard.as_ref().ok_or(TransportError::InterfaceNotClaimed)?;
        let ep = iface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096).with_write_timeout(timeout);
        writer
            .write_all(data)
            .map_err(|e| transfer_error(e, timeout, TransportError::WriteFailed))?;
        writer
            .flush()
            .map_err(|e| transfer_error(e, timeout, TransportError::WriteFailed))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn bulk_in(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let guard = self.interface.lock().unwrap();
        let iface = guard.as_ref().ok_or(TransportError::InterfaceNotClaimed)?;
        let ep = iface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(4096).with_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];

        let n = reader
            .read(&mut buf)
            .map_err(|e| transfer_error(e, timeout, TransportError::ReadFailed))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // nusb doesn't provide a direct "is connected" check.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
