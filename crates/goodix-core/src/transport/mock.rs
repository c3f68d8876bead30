//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{GF5395_PRODUCT_ID, GOODIX_VENDOR_ID};

/// Mock transport for unit testing protocol and session logic.
pub struct MockTransport {
    /// Queued IN packets to return on read, one bulk transfer each.
    packet_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured OUT packets.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
    /// Whether the interface has been claimed.
    claimed: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            packet_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid: GOODIX_VENDOR_ID,
            pid: GF5395_PRODUCT_ID,
            connected: Arc::new(Mutex::new(true)),
            claimed: Arc::new(Mutex::new(false)),
        }
    }

    /// Queue one IN packet to be returned on the next read.
    pub fn queue_packet(&self, packet: &[u8]) {
        self.packet_queue.lock().unwrap().push_back(packet.to_vec());
    }

    /// Queue several IN packets.
    pub fn queue_packets<I: IntoIterator<Item = Vec<u8>>>(&self, packets: I) {
        let mut queue = self.packet_queue.lock().unwrap();
        queue.extend(packets);
    }

    /// Get all captured OUT packets.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Whether the interface is currently claimed.
    pub fn is_claimed(&self) -> bool {
        *self.claimed.lock().unwrap()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn claim_interface(&self) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        *self.claimed.lock().unwrap() = true;
        Ok(())
    }

    fn release_interface(&self) -> Result<(), TransportError> {
        *self.claimed.lock().unwrap() = false;
        Ok(())
    }

    fn bulk_out(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn bulk_in(&self, _max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.packet_queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
