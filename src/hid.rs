use crate::config::Settings;
use crate::protocol::REPORT_SIZE;
use crate::transport::{Advertisement, NodeLink, NodeRole, Transport};
use crate::types::{NodeInfo, NodeType, ScannerType};
use crate::{FinchError, Result};
use hidapi::{BusType, HidApi, HidDevice};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Device-id source values of the Device Information service.
const VENDOR_ID_SOURCE_BLUETOOTH: u8 = 1;
const VENDOR_ID_SOURCE_USB: u8 = 2;

fn create_hid_api() -> Result<HidApi> {
    let api = HidApi::new()?;
    #[cfg(target_os = "macos")]
    {
        // Keep HID opens shared on macOS to avoid seizing the interface.
        api.set_open_exclusive(false);
    }
    Ok(api)
}

/// Check if a hidapi DeviceInfo looks like a Finch node.
fn is_finch_node(d: &hidapi::DeviceInfo, vendor_id: Option<u16>) -> bool {
    match vendor_id {
        Some(vid) => d.vendor_id() == vid,
        None => d
            .product_string()
            .map(|p| p.contains("Finch"))
            .unwrap_or(false),
    }
}

/// Role and declared slot from the product string, e.g. "Finch Dash Left".
fn classify(product: &str) -> (NodeRole, Option<NodeType>) {
    let lower = product.to_ascii_lowercase();
    let role = if lower.contains("arm") {
        NodeRole::UpperArm
    } else {
        NodeRole::Controller
    };
    let preferred = match (role, lower.contains("left"), lower.contains("right")) {
        (NodeRole::Controller, true, false) => Some(NodeType::LeftHand),
        (NodeRole::Controller, false, true) => Some(NodeType::RightHand),
        (NodeRole::UpperArm, true, false) => Some(NodeType::LeftUpperArm),
        (NodeRole::UpperArm, false, true) => Some(NodeType::RightUpperArm),
        _ => None,
    };
    (role, preferred)
}

fn node_info(d: &hidapi::DeviceInfo) -> NodeInfo {
    let product = d.product_string().unwrap_or("").to_string();
    let release = d.release_number();
    NodeInfo {
        name: product.clone(),
        address: d.path().to_str().unwrap_or("").to_string(),
        manufacturer_name: d.manufacturer_string().unwrap_or("").to_string(),
        model_number: product,
        serial_number: d.serial_number().unwrap_or("").to_string(),
        hardware_revision: String::new(),
        firmware_revision: format!("{}.{}", release >> 8, release & 0xff),
        software_revision: String::new(),
        vendor_id_source: match d.bus_type() {
            BusType::Bluetooth => VENDOR_ID_SOURCE_BLUETOOTH,
            _ => VENDOR_ID_SOURCE_USB,
        },
        vendor_id: d.vendor_id(),
        product_id: d.product_id(),
        product_version: release,
    }
}

fn is_disconnect(e: &hidapi::HidError) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("disconnected") || msg.contains("no such device") || msg.contains("not found")
}

/// Node transport over the OS HID stack.
///
/// Nodes paired with the host show up as HID devices, so every device the
/// OS lists counts as bonded and carries no RSSI.
pub struct HidTransport {
    api: Mutex<HidApi>,
    vendor_id: Option<u16>,
}

impl HidTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            api: Mutex::new(create_hid_api()?),
            vendor_id: settings.hid_vendor_id,
        })
    }
}

impl Transport for HidTransport {
    fn discover(&self, scanner: ScannerType) -> Result<Vec<Advertisement>> {
        let mut api = self
            .api
            .lock()
            .map_err(|_| FinchError::transport("HID context poisoned"))?;
        api.refresh_devices()?;

        let mut found = Vec::new();
        for d in api.device_list() {
            if !is_finch_node(d, self.vendor_id) {
                continue;
            }
            let name = d.product_string().unwrap_or("").to_string();
            let (role, preferred) = classify(&name);
            let adv = Advertisement {
                address: d.path().to_str().unwrap_or("").to_string(),
                name,
                rssi: None,
                bonded: true,
                role,
                preferred,
            };
            if adv.visible_to(scanner) {
                found.push(adv);
            }
        }
        Ok(found)
    }

    fn connect(&self, address: &str) -> Result<Box<dyn NodeLink>> {
        let api = self
            .api
            .lock()
            .map_err(|_| FinchError::transport("HID context poisoned"))?;
        let hid_info = api
            .device_list()
            .find(|d| d.path().to_str().unwrap_or("") == address)
            .ok_or_else(|| FinchError::transport(format!("HID device {} not found", address)))?;

        let info = node_info(hid_info);
        let device = api.open_path(hid_info.path())?;
        device.set_blocking_mode(false)?;

        log::info!(
            "Opened HID node {} ({:04x}:{:04x})",
            info.name,
            info.vendor_id,
            info.product_id
        );

        Ok(Box::new(HidLink {
            device,
            info,
            suspended: false,
        }))
    }
}

struct HidLink {
    device: HidDevice,
    info: NodeInfo,
    suspended: bool,
}

impl NodeLink for HidLink {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; REPORT_SIZE + 1];
        let mut latest = None;
        loop {
            let len = match self.device.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => return Err(FinchError::Disconnected),
                Err(e) => return Err(e.into()),
            };
            // Some backends prepend the report id.
            let report = match len {
                REPORT_SIZE => &buf[..REPORT_SIZE],
                n if n == REPORT_SIZE + 1 => &buf[1..],
                n => {
                    log::trace!("Skipping {}-byte HID report from {}", n, self.info.name);
                    continue;
                }
            };
            latest = Some(report.to_vec());
        }
        // Drained either way so the OS buffer does not back up while suspended.
        if self.suspended {
            return Ok(None);
        }
        Ok(latest)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let started = Instant::now();
        // Report id 0 followed by the payload.
        let mut send_buf = Vec::with_capacity(data.len() + 1);
        send_buf.push(0u8);
        send_buf.extend_from_slice(data);

        match self.device.write(&send_buf) {
            Ok(_) => {}
            Err(e) if is_disconnect(&e) => return Err(FinchError::Disconnected),
            Err(e) => return Err(e.into()),
        }
        if started.elapsed() > timeout {
            log::warn!(
                "HID write to {} took {:?} (timeout {:?})",
                self.info.name,
                started.elapsed(),
                timeout
            );
            return Err(FinchError::Timeout);
        }
        Ok(())
    }

    fn set_suspended(&mut self, suspended: bool) -> Result<()> {
        self.suspended = suspended;
        Ok(())
    }

    fn close(&mut self, unpair: bool) {
        if unpair {
            log::info!(
                "Unpair of {} requested; HID nodes stay bonded at the OS level",
                self.info.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_product_strings() {
        assert_eq!(
            classify("Finch Dash Left"),
            (NodeRole::Controller, Some(NodeType::LeftHand))
        );
        assert_eq!(
            classify("Finch UpperArm Right"),
            (NodeRole::UpperArm, Some(NodeType::RightUpperArm))
        );
        assert_eq!(classify("Finch Shift"), (NodeRole::Controller, None));
    }
}
