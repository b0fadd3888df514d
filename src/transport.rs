//! Device transport seam.
//!
//! A [`Transport`] discovers nodes and opens [`NodeLink`]s to them. The
//! session owns the links and polls them once per update; the scan worker
//! only ever calls [`Transport::discover`].

use crate::types::{NodeInfo, NodeType, ScannerType};
use crate::{FinchError, Result};
use std::time::Duration;

/// What kind of slot a discovered device can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Controller,
    UpperArm,
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: String,
    pub name: String,
    /// Signal strength in dBm, when the transport reports one.
    pub rssi: Option<i8>,
    /// Already paired with this host.
    pub bonded: bool,
    pub role: NodeRole,
    /// Slot the device declares for itself, if any.
    pub preferred: Option<NodeType>,
}

impl Advertisement {
    /// True when the advertisement clears the scan's RSSI threshold.
    /// Devices without a reading are not filtered.
    pub fn passes_rssi(&self, threshold: i8) -> bool {
        self.rssi.map_or(true, |rssi| rssi >= threshold)
    }

    /// True when the scanner kind looks at this device at all.
    pub fn visible_to(&self, scanner: ScannerType) -> bool {
        match scanner {
            ScannerType::None => false,
            ScannerType::Bonded => self.bonded,
            ScannerType::BA | ScannerType::AB => true,
        }
    }

    /// Ordering key: lower sorts first.
    pub fn priority(&self, scanner: ScannerType) -> u8 {
        match (scanner, self.bonded) {
            (ScannerType::AB, false) | (ScannerType::BA, true) => 0,
            _ => 1,
        }
    }
}

/// An open connection to one node.
pub trait NodeLink: Send {
    fn info(&self) -> &NodeInfo;

    /// Latest report received since the last poll, if any. Must not block.
    fn poll(&mut self) -> Result<Option<Vec<u8>>>;

    /// Write and wait for the node to accept the data.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Pause or resume data flow without dropping the link.
    fn set_suspended(&mut self, suspended: bool) -> Result<()>;

    /// Drop the link; `unpair` also forgets the bond.
    fn close(&mut self, unpair: bool);
}

/// Discovery and connection backend.
pub trait Transport: Send + Sync {
    /// One discovery pass. Called repeatedly from the scan worker thread.
    fn discover(&self, scanner: ScannerType) -> Result<Vec<Advertisement>>;

    fn connect(&self, address: &str) -> Result<Box<dyn NodeLink>>;
}

/// Transport for hosts that feed node data through the extern updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn discover(&self, _scanner: ScannerType) -> Result<Vec<Advertisement>> {
        Ok(Vec::new())
    }

    fn connect(&self, address: &str) -> Result<Box<dyn NodeLink>> {
        Err(FinchError::transport(format!(
            "no transport available to connect {}",
            address
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(bonded: bool, rssi: Option<i8>) -> Advertisement {
        Advertisement {
            address: "00:11".into(),
            name: "node".into(),
            rssi,
            bonded,
            role: NodeRole::Controller,
            preferred: None,
        }
    }

    #[test]
    fn test_rssi_filter() {
        assert!(adv(true, Some(-60)).passes_rssi(-70));
        assert!(adv(true, Some(-70)).passes_rssi(-70));
        assert!(!adv(true, Some(-80)).passes_rssi(-70));
        assert!(adv(true, None).passes_rssi(-70));
    }

    #[test]
    fn test_scanner_visibility_and_priority() {
        let bonded = adv(true, None);
        let advertising = adv(false, Some(-50));
        assert!(bonded.visible_to(ScannerType::Bonded));
        assert!(!advertising.visible_to(ScannerType::Bonded));
        assert!(!bonded.visible_to(ScannerType::None));
        assert!(bonded.priority(ScannerType::BA) < advertising.priority(ScannerType::BA));
        assert!(advertising.priority(ScannerType::AB) < bonded.priority(ScannerType::AB));
    }

    #[test]
    fn test_null_transport() {
        let t = NullTransport;
        assert!(t.discover(ScannerType::AB).unwrap().is_empty());
        assert!(t.connect("x").is_err());
    }
}
