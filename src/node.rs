use crate::protocol;
use crate::transport::NodeLink;
use crate::types::{
    ControllerElement, EventType, Events, NodeInfo, NodeSample, NodeType, NodesState,
    NodesStateType,
};
use crate::{FinchError, Result};
use glam::Vec2;
use std::time::Duration;

/// Result of polling one slot's link.
#[derive(Debug)]
pub(crate) enum Poll {
    Idle,
    Report(Vec<u8>),
    Lost,
}

/// One of the four body-relative node positions.
#[derive(Default)]
pub(crate) struct NodeSlot {
    link: Option<Box<dyn NodeLink>>,
    /// Fed by the host through the extern updates.
    external: bool,
    suspended: bool,
    /// Address of the last device that occupied the slot.
    remembered: Option<String>,
    info: NodeInfo,
    sample: Option<NodeSample>,
    raw: Vec<u8>,
    correct: bool,
    held: Events,
    begin: Events,
    end: Events,
    hold_time: [f32; ControllerElement::LAST as usize],
    /// Touch axes when the pad was touched, and the last held value.
    touch_down: Vec2,
    touch_last: Vec2,
    touch_elapsed: f32,
    swipe: Option<(Vec2, f32)>,
}

impl NodeSlot {
    pub fn is_connected(&self) -> bool {
        self.link.is_some() || self.external
    }

    pub fn is_correct(&self) -> bool {
        self.is_connected() && self.correct
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn address(&self) -> Option<&str> {
        if self.is_connected() {
            Some(self.info.address.as_str())
        } else {
            None
        }
    }

    pub fn remembered(&self) -> Option<&str> {
        self.remembered.as_deref()
    }

    /// Latest sample, only while the data is valid.
    pub fn sample(&self) -> Option<&NodeSample> {
        if self.is_correct() {
            self.sample.as_ref()
        } else {
            None
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn charge(&self) -> u8 {
        self.sample.map(|s| s.charge).unwrap_or(0)
    }

    pub fn time_ms(&self) -> u64 {
        self.sample.map(|s| s.time_ms).unwrap_or(0)
    }

    pub fn events(&self, kind: EventType) -> Events {
        match kind {
            EventType::Begin => self.begin,
            EventType::Process => self.held,
            EventType::End => self.end,
        }
    }

    pub fn hold_time(&self, element: ControllerElement) -> f32 {
        self.hold_time[element as usize]
    }

    /// Swipe vector and duration in seconds, on the frame the pad is released.
    pub fn swipe(&self) -> Option<(Vec2, f32)> {
        self.swipe
    }

    fn reset_data(&mut self) {
        self.sample = None;
        self.raw.clear();
        self.correct = false;
    }
}

/// The four node slots, indexed by [`NodeType`].
#[derive(Default)]
pub(crate) struct NodeTable {
    slots: [NodeSlot; NodeType::COUNT],
}

impl NodeTable {
    pub fn get(&self, node: NodeType) -> &NodeSlot {
        &self.slots[node.index()]
    }

    pub fn state(&self) -> NodesState {
        let mut flags = NodesState::empty();
        for node in NodeType::ALL {
            let slot = self.get(*node);
            if slot.is_connected() {
                flags |= NodesState::flag(*node, NodesStateType::Connected);
            }
            if slot.is_correct() {
                flags |= NodesState::flag(*node, NodesStateType::Correctly);
            }
        }
        flags
    }

    /// Slot currently holding `address`.
    pub fn find_address(&self, address: &str) -> Option<NodeType> {
        NodeType::ALL
            .iter()
            .copied()
            .find(|n| self.get(*n).address() == Some(address))
    }

    pub fn attach(&mut self, node: NodeType, link: Box<dyn NodeLink>) {
        let slot = &mut self.slots[node.index()];
        if let Some(mut old) = slot.link.take() {
            old.close(false);
        }
        slot.info = link.info().clone();
        slot.remembered = Some(slot.info.address.clone());
        slot.link = Some(link);
        slot.external = false;
        slot.suspended = false;
        slot.reset_data();
        log::info!("Node {:?} connected: {} ({})", node, slot.info.name, slot.info.address);
    }

    /// Mark a slot as fed through the extern updates.
    pub fn attach_external(&mut self, node: NodeType) {
        let slot = &mut self.slots[node.index()];
        if !slot.is_connected() {
            slot.external = true;
            slot.info = NodeInfo::default();
            log::info!("Node {:?} fed externally", node);
        }
    }

    pub fn detach(&mut self, node: NodeType, unpair: bool) {
        let slot = &mut self.slots[node.index()];
        if let Some(mut link) = slot.link.take() {
            link.close(unpair);
            log::info!("Node {:?} disconnected (unpair={})", node, unpair);
        }
        if unpair {
            slot.remembered = None;
        }
        slot.external = false;
        slot.suspended = false;
        slot.reset_data();
    }

    /// Link went away underneath us.
    pub fn mark_lost(&mut self, node: NodeType) {
        let slot = &mut self.slots[node.index()];
        if slot.link.take().is_some() {
            log::warn!("Node {:?} ({}) lost its link", node, slot.info.address);
        }
        slot.suspended = false;
        slot.reset_data();
    }

    pub fn close_all(&mut self) {
        for node in NodeType::ALL {
            if self.get(*node).link.is_some() {
                self.detach(*node, false);
            }
        }
    }

    pub fn swap(&mut self, first: NodeType, second: NodeType) {
        self.slots.swap(first.index(), second.index());
    }

    pub fn set_suspended(&mut self, node: NodeType, suspended: bool) -> Result<()> {
        let slot = &mut self.slots[node.index()];
        let link = slot
            .link
            .as_mut()
            .ok_or_else(|| FinchError::transport(format!("node {:?} not connected", node)))?;
        link.set_suspended(suspended)?;
        slot.suspended = suspended;
        Ok(())
    }

    pub fn write(&mut self, node: NodeType, data: &[u8], timeout: Duration) -> Result<()> {
        let link = self.slots[node.index()]
            .link
            .as_mut()
            .ok_or_else(|| FinchError::transport(format!("node {:?} not connected", node)))?;
        link.write(data, timeout)
    }

    /// Poll every linked slot. A fault other than a lost link aborts the
    /// whole poll so the caller can leave its state untouched.
    pub fn poll(&mut self) -> Result<[Poll; NodeType::COUNT]> {
        let mut out = [Poll::Idle, Poll::Idle, Poll::Idle, Poll::Idle];
        for node in NodeType::ALL {
            let slot = &mut self.slots[node.index()];
            if slot.suspended {
                continue;
            }
            let Some(link) = slot.link.as_mut() else {
                continue;
            };
            out[node.index()] = match link.poll() {
                Ok(Some(report)) => Poll::Report(report),
                Ok(None) => Poll::Idle,
                Err(FinchError::Disconnected) => Poll::Lost,
                Err(e) => return Err(e),
            };
        }
        Ok(out)
    }

    /// Store a decoded report.
    pub fn ingest(&mut self, node: NodeType, raw: Vec<u8>, sample: NodeSample) {
        let slot = &mut self.slots[node.index()];
        slot.correct = protocol::is_sample_correct(&sample);
        if !slot.correct {
            log::debug!("Node {:?} reported an invalid orientation", node);
        }
        slot.sample = Some(sample);
        slot.raw = raw;
    }

    /// Recompute begin/process/end flags and hold timers after ingestion.
    pub fn advance_events(&mut self, dt: f32) {
        for slot in self.slots.iter_mut() {
            let (now, touch) = match (&slot.sample, slot.is_connected()) {
                (Some(sample), true) => (sample.elements, sample.touch),
                _ => (Events::empty(), Vec2::ZERO),
            };
            let prev = slot.held;
            slot.begin = now & !prev;
            slot.end = prev & !now;
            slot.held = now;
            for element in ControllerElement::ALL {
                let t = &mut slot.hold_time[*element as usize];
                *t = if now.contains(element.bit()) { *t + dt } else { 0.0 };
            }

            slot.swipe = if slot.end.contains(Events::TOUCH) {
                Some((slot.touch_last - slot.touch_down, slot.touch_elapsed + dt))
            } else {
                None
            };
            if slot.begin.contains(Events::TOUCH) {
                slot.touch_down = touch;
                slot.touch_elapsed = 0.0;
            } else if now.contains(Events::TOUCH) {
                slot.touch_elapsed += dt;
            }
            if now.contains(Events::TOUCH) {
                slot.touch_last = touch;
            }
        }
    }

    /// Drop the edge events; used when a frame is recomputed without input.
    pub fn clear_edges(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.begin = Events::empty();
            slot.end = Events::empty();
            slot.swipe = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDevice, MemoryTransport};
    use crate::transport::Transport;
    use crate::types::Chirality;
    use glam::{Quat, Vec3};

    fn sample(elements: Events) -> NodeSample {
        touched(elements, Vec2::ZERO)
    }

    fn touched(elements: Events, touch: Vec2) -> NodeSample {
        NodeSample {
            time_ms: 10,
            rotation: Quat::IDENTITY,
            acceleration: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            elements,
            touch,
            trigger: 0.0,
            charge: 80,
        }
    }

    #[test]
    fn test_event_edges() {
        let mut table = NodeTable::default();
        table.attach_external(NodeType::RightHand);

        table.ingest(NodeType::RightHand, vec![], sample(Events::BUTTON_ZERO));
        table.advance_events(0.1);
        let slot = table.get(NodeType::RightHand);
        assert_eq!(slot.events(EventType::Begin), Events::BUTTON_ZERO);
        assert_eq!(slot.events(EventType::Process), Events::BUTTON_ZERO);
        assert!(slot.events(EventType::End).is_empty());

        table.ingest(NodeType::RightHand, vec![], sample(Events::BUTTON_ZERO));
        table.advance_events(0.1);
        let slot = table.get(NodeType::RightHand);
        assert!(slot.events(EventType::Begin).is_empty());
        assert!((slot.hold_time(ControllerElement::ButtonZero) - 0.2).abs() < 1e-6);

        table.ingest(NodeType::RightHand, vec![], sample(Events::empty()));
        table.advance_events(0.1);
        let slot = table.get(NodeType::RightHand);
        assert_eq!(slot.events(EventType::End), Events::BUTTON_ZERO);
        assert_eq!(slot.hold_time(ControllerElement::ButtonZero), 0.0);
    }

    #[test]
    fn test_swipe_on_release() {
        let mut table = NodeTable::default();
        table.attach_external(NodeType::LeftHand);
        let frames = [
            (Events::TOUCH, Vec2::new(-0.5, 0.0)),
            (Events::TOUCH, Vec2::new(0.0, 0.1)),
            (Events::TOUCH, Vec2::new(0.6, 0.2)),
            // Axes read zero once the finger is up.
            (Events::empty(), Vec2::ZERO),
        ];
        for (i, (elements, touch)) in frames.iter().enumerate() {
            table.ingest(NodeType::LeftHand, vec![], touched(*elements, *touch));
            table.advance_events(0.1);
            if i < frames.len() - 1 {
                assert_eq!(table.get(NodeType::LeftHand).swipe(), None);
            }
        }
        let (swipe, time) = table.get(NodeType::LeftHand).swipe().unwrap();
        assert!((swipe - Vec2::new(1.1, 0.2)).length() < 1e-6);
        assert!((time - 0.3).abs() < 1e-6);

        table.ingest(NodeType::LeftHand, vec![], sample(Events::empty()));
        table.advance_events(0.1);
        assert_eq!(table.get(NodeType::LeftHand).swipe(), None);
    }

    #[test]
    fn test_state_flags_and_swap() {
        let transport = MemoryTransport::new();
        transport.add(MemoryDevice::controller("AA:01", Chirality::Right));
        let mut table = NodeTable::default();
        table.attach(NodeType::RightHand, transport.connect("AA:01").unwrap());
        assert_eq!(table.state(), NodesState::RIGHT_HAND_CONNECTED);

        table.ingest(NodeType::RightHand, vec![1], sample(Events::empty()));
        assert_eq!(
            table.state(),
            NodesState::RIGHT_HAND_CONNECTED | NodesState::RIGHT_HAND_CORRECTLY
        );

        table.swap(NodeType::RightHand, NodeType::LeftHand);
        assert_eq!(
            table.state(),
            NodesState::LEFT_HAND_CONNECTED | NodesState::LEFT_HAND_CORRECTLY
        );
        assert_eq!(table.find_address("AA:01"), Some(NodeType::LeftHand));

        table.detach(NodeType::LeftHand, false);
        assert!(table.state().is_empty());
        assert_eq!(table.get(NodeType::LeftHand).remembered(), Some("AA:01"));
    }

    #[test]
    fn test_poll_reports_lost_link() {
        let transport = MemoryTransport::new();
        let dev = MemoryDevice::controller("AA:01", Chirality::Left);
        transport.add(dev.clone());
        let mut table = NodeTable::default();
        table.attach(NodeType::LeftHand, transport.connect("AA:01").unwrap());

        dev.push_report(&[7u8; 3]);
        let polled = table.poll().unwrap();
        assert!(matches!(&polled[NodeType::LeftHand.index()], Poll::Report(r) if r == &vec![7u8; 3]));

        dev.drop_link();
        let polled = table.poll().unwrap();
        assert!(matches!(polled[NodeType::LeftHand.index()], Poll::Lost));
    }
}
