//! In-process transport.
//!
//! Devices are plain values the host (or a test) creates, registers with a
//! [`MemoryTransport`] and feeds with reports. Useful for simulators and for
//! exercising the session without hardware.

use crate::protocol;
use crate::transport::{Advertisement, NodeLink, NodeRole, Transport};
use crate::types::{Chirality, NodeInfo, NodeSample, NodeType, ScannerType};
use crate::{FinchError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct DeviceState {
    advertisement: Advertisement,
    connected: bool,
    suspended: bool,
    dropped: bool,
    fail_writes: bool,
    written: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct DeviceShared {
    info: NodeInfo,
    reports_tx: Sender<Vec<u8>>,
    reports_rx: Receiver<Vec<u8>>,
    state: Mutex<DeviceState>,
}

/// Handle to a simulated node. Clones share the same device.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    shared: Arc<DeviceShared>,
}

impl MemoryDevice {
    /// A bonded device with no RSSI reading.
    pub fn new(address: &str, role: NodeRole, preferred: Option<NodeType>) -> Self {
        let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
        let name = match role {
            NodeRole::Controller => "Finch Controller",
            NodeRole::UpperArm => "Finch UpperArm",
        };
        let info = NodeInfo {
            name: name.to_string(),
            address: address.to_string(),
            manufacturer_name: "Finch Technologies".to_string(),
            model_number: name.to_string(),
            serial_number: address.replace(':', ""),
            hardware_revision: "1.0".to_string(),
            firmware_revision: "1.0".to_string(),
            software_revision: "1.0".to_string(),
            vendor_id_source: 1,
            vendor_id: 0,
            product_id: 0,
            product_version: 1,
        };
        let advertisement = Advertisement {
            address: address.to_string(),
            name: name.to_string(),
            rssi: None,
            bonded: true,
            role,
            preferred,
        };
        MemoryDevice {
            shared: Arc::new(DeviceShared {
                info,
                reports_tx,
                reports_rx,
                state: Mutex::new(DeviceState {
                    advertisement,
                    connected: false,
                    suspended: false,
                    dropped: false,
                    fail_writes: false,
                    written: Vec::new(),
                }),
            }),
        }
    }

    /// A controller that declares its hand.
    pub fn controller(address: &str, side: Chirality) -> Self {
        Self::new(address, NodeRole::Controller, NodeType::hand(side))
    }

    /// An upper-arm node that declares its side.
    pub fn upper_arm(address: &str, side: Chirality) -> Self {
        Self::new(address, NodeRole::UpperArm, NodeType::upper_arm(side))
    }

    pub fn with_rssi(self, rssi: i8) -> Self {
        self.state().advertisement.rssi = Some(rssi);
        self
    }

    /// Make the device advertise instead of being bonded.
    pub fn advertising(self) -> Self {
        self.state().advertisement.bonded = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.info.address
    }

    /// Queue a raw report for the next poll.
    pub fn push_report(&self, report: &[u8]) {
        let _ = self.shared.reports_tx.send(report.to_vec());
    }

    /// Queue an encoded sample for the next poll.
    pub fn push_sample(&self, sample: &NodeSample) {
        self.push_report(&protocol::encode_report(sample));
    }

    /// Everything the session has written to this device.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    pub fn is_bonded(&self) -> bool {
        self.state().advertisement.bonded
    }

    /// Make writes time out.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Simulate the radio link dropping.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.dropped = true;
        state.connected = false;
    }
}

/// Registry of simulated devices.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    devices: Mutex<Vec<MemoryDevice>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: MemoryDevice) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.push(device);
        }
    }

    fn find(&self, address: &str) -> Option<MemoryDevice> {
        self.devices
            .lock()
            .ok()?
            .iter()
            .find(|d| d.address() == address)
            .cloned()
    }
}

impl Transport for MemoryTransport {
    fn discover(&self, scanner: ScannerType) -> Result<Vec<Advertisement>> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| FinchError::transport("device registry poisoned"))?;
        Ok(devices
            .iter()
            .filter_map(|d| {
                let state = d.state();
                if !state.connected && state.advertisement.visible_to(scanner) {
                    Some(state.advertisement.clone())
                } else {
                    None
                }
            })
            .collect())
    }

    fn connect(&self, address: &str) -> Result<Box<dyn NodeLink>> {
        let device = self
            .find(address)
            .ok_or_else(|| FinchError::transport(format!("unknown device {}", address)))?;
        {
            let mut state = device.state();
            if state.connected {
                return Err(FinchError::transport(format!("{} already connected", address)));
            }
            state.connected = true;
            state.dropped = false;
            state.suspended = false;
        }
        // Stale reports from a previous connection are not delivered.
        while device.shared.reports_rx.try_recv().is_ok() {}
        Ok(Box::new(MemoryLink { device }))
    }
}

struct MemoryLink {
    device: MemoryDevice,
}

impl NodeLink for MemoryLink {
    fn info(&self) -> &NodeInfo {
        &self.device.shared.info
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        {
            let state = self.device.state();
            if state.dropped {
                return Err(FinchError::Disconnected);
            }
            if state.suspended {
                return Ok(None);
            }
        }
        let mut latest = None;
        while let Ok(report) = self.device.shared.reports_rx.try_recv() {
            latest = Some(report);
        }
        Ok(latest)
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        let mut state = self.device.state();
        if state.dropped {
            return Err(FinchError::Disconnected);
        }
        if state.fail_writes {
            return Err(FinchError::Timeout);
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn set_suspended(&mut self, suspended: bool) -> Result<()> {
        let mut state = self.device.state();
        if state.dropped {
            return Err(FinchError::Disconnected);
        }
        state.suspended = suspended;
        Ok(())
    }

    fn close(&mut self, unpair: bool) {
        let mut state = self.device.state();
        state.connected = false;
        state.suspended = false;
        if unpair {
            state.advertisement.bonded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_and_connect() {
        let transport = MemoryTransport::new();
        let right = MemoryDevice::controller("AA:01", Chirality::Right);
        let stranger = MemoryDevice::controller("AA:02", Chirality::Left).advertising();
        transport.add(right.clone());
        transport.add(stranger);

        let bonded = transport.discover(ScannerType::Bonded).unwrap();
        assert_eq!(bonded.len(), 1);
        assert_eq!(bonded[0].preferred, Some(NodeType::RightHand));

        let mut link = transport.connect("AA:01").unwrap();
        assert!(right.is_connected());
        assert!(transport.connect("AA:01").is_err());
        assert_eq!(transport.discover(ScannerType::AB).unwrap().len(), 1);

        right.push_report(&[1u8; 4]);
        right.push_report(&[2u8; 4]);
        assert_eq!(link.poll().unwrap(), Some(vec![2u8; 4]));
        assert_eq!(link.poll().unwrap(), None);

        link.close(true);
        assert!(!right.is_connected());
        assert!(!right.is_bonded());
    }

    #[test]
    fn test_suspend_and_drop() {
        let transport = MemoryTransport::new();
        let dev = MemoryDevice::upper_arm("BB:01", Chirality::Left);
        transport.add(dev.clone());
        let mut link = transport.connect("BB:01").unwrap();

        link.set_suspended(true).unwrap();
        dev.push_report(&[9u8; 2]);
        assert_eq!(link.poll().unwrap(), None);
        link.set_suspended(false).unwrap();
        assert_eq!(link.poll().unwrap(), Some(vec![9u8; 2]));

        dev.set_fail_writes(true);
        assert!(matches!(
            link.write(&[1], Duration::from_millis(5)),
            Err(FinchError::Timeout)
        ));

        dev.drop_link();
        assert!(matches!(link.poll(), Err(FinchError::Disconnected)));
    }
}
