use crate::calibration::Calibration;
use crate::config::Settings;
use crate::math::Basis;
use crate::node::{NodeTable, Poll};
use crate::protocol::{self, VibrationStep};
use crate::scan::{Scan, ScanRequest};
use crate::skeleton::{BodyModel, BoneState, Frame, PoseInput};
use crate::transport::{Advertisement, NodeRole, NullTransport, Transport};
use crate::types::{
    AxisCalibrationStep, BodyRotationMode, Bone, Chirality, ControllerElement, ControllerType,
    EventType, Events, NodeInfo, NodeSample, NodeType, NodesState, Platform, RecenterMode,
    ScanResult, ScannerType,
};
use crate::{FinchError, Result};
use glam::{Quat, Vec2, Vec3};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Build the transport a platform uses when the host does not supply one.
fn default_transport(platform: Platform, settings: &Settings) -> Result<Arc<dyn Transport>> {
    if platform == Platform::External {
        return Ok(Arc::new(NullTransport));
    }
    device_transport(settings)
}

#[cfg(feature = "hid")]
fn device_transport(settings: &Settings) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::hid::HidTransport::new(settings)?))
}

#[cfg(not(feature = "hid"))]
fn device_transport(_settings: &Settings) -> Result<Arc<dyn Transport>> {
    log::warn!("Built without the `hid` feature; nodes can only be fed externally");
    Ok(Arc::new(NullTransport))
}

fn check_rotation(what: &str, q: Quat) -> Result<Quat> {
    if q.is_finite() && q.length() > crate::math::EPSILON {
        Ok(q.normalize())
    } else {
        Err(FinchError::illegal(format!("{} is not a valid rotation", what)))
    }
}

fn check_vector(what: &str, v: Vec3) -> Result<Vec3> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(FinchError::illegal(format!("{} is not finite", what)))
    }
}

/// Where the node data of an update comes from.
enum Feed<'a> {
    Links,
    Extern(&'a [Option<&'a [u8]>; NodeType::COUNT]),
}

/// Staged result of reading node data, applied only on success.
struct Ingest {
    lost: Vec<NodeType>,
    samples: Vec<(NodeType, Vec<u8>, NodeSample)>,
    external: bool,
}

/// A live Finch core session.
///
/// Owns the node links, calibration, body model and the last committed
/// pose frame. All outputs are expressed in the configured coordinate
/// system with the root offset applied.
pub struct Session {
    controller: ControllerType,
    platform: Platform,
    settings: Settings,
    transport: Arc<dyn Transport>,
    nodes: NodeTable,
    calibration: Calibration,
    body: BodyModel,
    basis: Basis,
    root_offset: Vec3,
    frame: Frame,
    previous: Frame,
    /// HMD pose of the last update, internal frame.
    hmd_rotation: Option<Quat>,
    hmd_position: Option<Vec3>,
    scan: Option<Scan>,
    /// Discovered devices not yet connected, most recent last.
    candidates: Vec<Advertisement>,
    last_update: Option<Instant>,
}

impl Session {
    /// Start a session with the platform's default transport and settings
    /// from the environment.
    pub fn new(controller: ControllerType, platform: Platform) -> Result<Session> {
        let settings = Settings::from_env();
        Self::validate(controller, platform)?;
        let transport = default_transport(platform, &settings)?;
        Self::with_transport(controller, platform, transport, settings)
    }

    pub fn with_transport(
        controller: ControllerType,
        platform: Platform,
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Result<Session> {
        Self::validate(controller, platform)?;
        log::info!("Finch session started: {:?} on {:?}", controller, platform);
        Ok(Session {
            controller,
            platform,
            settings,
            transport,
            nodes: NodeTable::default(),
            calibration: Calibration::default(),
            body: BodyModel::default(),
            basis: Basis::IDENTITY,
            root_offset: Vec3::ZERO,
            frame: Frame::default(),
            previous: Frame::default(),
            hmd_rotation: None,
            hmd_position: None,
            scan: None,
            candidates: Vec::new(),
            last_update: None,
        })
    }

    fn validate(controller: ControllerType, platform: Platform) -> Result<()> {
        if controller == ControllerType::WaveVRDash && platform != Platform::WaveVR {
            return Err(FinchError::illegal(format!(
                "{:?} requires the WaveVR platform, got {:?}",
                controller, platform
            )));
        }
        Ok(())
    }

    pub fn controller_type(&self) -> ControllerType {
        self.controller
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn supports_upper_arms(&self) -> bool {
        matches!(self.controller, ControllerType::Hand | ControllerType::Shift)
    }

    // ---- pose and telemetry ----

    pub fn is_bone_available(&self, bone: Bone) -> bool {
        self.frame.bone(bone).available
    }

    fn output_position(&self, v: Vec3) -> Vec3 {
        self.basis.vector(v) + self.root_offset
    }

    pub fn bone_rotation(&self, bone: Bone, filtered: bool) -> Quat {
        let state = self.frame.bone(bone);
        if !state.available {
            return Quat::IDENTITY;
        }
        let q = if filtered { state.filtered_rotation } else { state.rotation };
        self.basis.rotation(q)
    }

    pub fn controller_rotation(&self, side: Chirality, filtered: bool) -> Quat {
        match self.frame.controller(side) {
            Some(c) if c.available => {
                self.basis.rotation(if filtered { c.filtered_rotation } else { c.rotation })
            }
            _ => Quat::IDENTITY,
        }
    }

    pub fn bone_position(&self, bone: Bone) -> Vec3 {
        let state = self.frame.bone(bone);
        if !state.available {
            return Vec3::ZERO;
        }
        self.output_position(state.position)
    }

    pub fn controller_position(&self, side: Chirality, smooth: bool) -> Vec3 {
        match self.frame.controller(side) {
            Some(c) if c.available => {
                self.output_position(if smooth { c.smooth_position } else { c.position })
            }
            _ => Vec3::ZERO,
        }
    }

    /// A bone's derivative in the output axes, either as is or expressed in
    /// the bone's own frame.
    fn bone_vector(
        &self,
        bone: Bone,
        global: bool,
        axial: bool,
        pick: fn(&BoneState) -> Vec3,
    ) -> Vec3 {
        let state = self.frame.bone(bone);
        if !state.available {
            return Vec3::ZERO;
        }
        let v = pick(state);
        let v = if global { v } else { state.rotation.inverse() * v };
        if axial {
            self.basis.axial(v)
        } else {
            self.basis.vector(v)
        }
    }

    pub fn bone_angular_acceleration(&self, bone: Bone, global: bool) -> Vec3 {
        self.bone_vector(bone, global, true, |s| s.angular_acceleration)
    }

    pub fn bone_linear_acceleration(&self, bone: Bone, global: bool) -> Vec3 {
        self.bone_vector(bone, global, false, |s| s.linear_acceleration)
    }

    pub fn bone_angular_velocity(&self, bone: Bone, global: bool) -> Vec3 {
        self.bone_vector(bone, global, true, |s| s.angular_velocity)
    }

    pub fn bone_linear_velocity(&self, bone: Bone, global: bool) -> Vec3 {
        self.bone_vector(bone, global, false, |s| s.linear_velocity)
    }

    fn hand_sample(&self, side: Chirality) -> Option<&NodeSample> {
        NodeType::hand(side).and_then(|n| self.nodes.get(n).sample())
    }

    pub fn touch_axes(&self, side: Chirality) -> Vec2 {
        self.hand_sample(side).map(|s| s.touch).unwrap_or_default()
    }

    /// Touchpad swipe vector and its duration in seconds. Only reported on
    /// the update the pad is released.
    pub fn swipe(&self, side: Chirality) -> Option<(Vec2, f32)> {
        NodeType::hand(side).and_then(|n| self.nodes.get(n).swipe())
    }

    pub fn index_trigger(&self, side: Chirality) -> f32 {
        self.hand_sample(side).map(|s| s.trigger).unwrap_or(0.0)
    }

    pub fn events(&self, node: NodeType, kind: EventType) -> Events {
        self.nodes.get(node).events(kind)
    }

    /// Seconds the element has been held down continuously.
    pub fn element_hold_time(&self, node: NodeType, element: ControllerElement) -> f32 {
        self.nodes.get(node).hold_time(element)
    }

    /// Which proximity sensors currently detect a hand.
    pub fn capacity_sensor(&self, node: NodeType) -> Option<Chirality> {
        let held = self.events(node, EventType::Process);
        let left = held.contains(Events::LEFT_PROXIMITY);
        let right = held.contains(Events::RIGHT_PROXIMITY);
        match (left, right) {
            (true, true) => Some(Chirality::Both),
            (true, false) => Some(Chirality::Left),
            (false, true) => Some(Chirality::Right),
            (false, false) => None,
        }
    }

    pub fn led_state(&self, node: NodeType) -> bool {
        self.events(node, EventType::Process).contains(Events::IS_LED_ON)
    }

    pub fn led_chirality(&self, node: NodeType) -> Chirality {
        if self.events(node, EventType::Process).contains(Events::LED_CHIRALITY) {
            Chirality::Left
        } else {
            Chirality::Right
        }
    }

    // ---- coordinate system and calibration ----

    /// Set the output axes. A degenerate basis is ignored.
    pub fn set_cs(&mut self, x: Vec3, y: Vec3, z: Vec3) -> Result<()> {
        let Some(basis) = Basis::new(x, y, z) else {
            log::warn!("Ignoring degenerate coordinate system {:?} {:?} {:?}", x, y, z);
            return Err(FinchError::illegal("degenerate coordinate system"));
        };
        self.basis = basis;
        log::debug!("Coordinate system set, det={}", basis.determinant());
        Ok(())
    }

    pub fn set_default_cs(&mut self) {
        self.basis = Basis::IDENTITY;
    }

    pub fn set_root_offset(&mut self, offset: Vec3) -> Result<()> {
        self.root_offset = check_vector("root offset", offset)?;
        Ok(())
    }

    fn raw_rotations(&self) -> [Option<Quat>; NodeType::COUNT] {
        let mut raws = [None; NodeType::COUNT];
        for node in NodeType::ALL {
            raws[node.index()] = self.nodes.get(*node).sample().map(|s| s.rotation);
        }
        raws
    }

    fn hmd_or_forward(&self) -> Quat {
        self.hmd_rotation.unwrap_or(Quat::IDENTITY)
    }

    pub fn recenter(&mut self, chirality: Chirality, mode: RecenterMode) {
        let target = match mode {
            RecenterMode::Forward => Quat::IDENTITY,
            RecenterMode::HmdRotation => self.hmd_or_forward(),
        };
        let raws = self.raw_rotations();
        self.calibration.recenter(chirality, target, &raws);
    }

    pub fn recenter_by_direction(&mut self, chirality: Chirality, target: Quat) -> Result<()> {
        let target = check_rotation("target orientation", target)?;
        let target = self.basis.inverse_rotation(target);
        let raws = self.raw_rotations();
        self.calibration.recenter(chirality, target, &raws);
        Ok(())
    }

    /// Recenter both sides so forward is perpendicular to the line from
    /// the left to the right controller.
    pub fn recenter_by_controllers_positions(&mut self, left: Vec3, right: Vec3) -> Result<()> {
        let left = self.basis.inverse_vector(check_vector("left position", left)?);
        let right = self.basis.inverse_vector(check_vector("right position", right)?);
        let across = right - left;
        let Some(across) = Vec3::new(across.x, 0.0, across.z).try_normalize() else {
            return Err(FinchError::illegal("controller positions do not span a horizontal direction"));
        };
        let forward = across.cross(Vec3::Y);
        let target = Quat::from_rotation_y(forward.x.atan2(forward.z));
        let raws = self.raw_rotations();
        self.calibration.recenter(Chirality::Both, target, &raws);
        Ok(())
    }

    pub fn calibrate(&mut self, chirality: Chirality, mode: RecenterMode) {
        let raws = self.raw_rotations();
        let hmd = self.hmd_or_forward();
        self.calibration.calibrate(chirality, mode, hmd, &raws);
    }

    pub fn reset_calibration(&mut self, chirality: Chirality) {
        self.calibration.reset(chirality);
    }

    pub fn raw_rotation(&self, node: NodeType) -> Quat {
        self.nodes
            .get(node)
            .sample()
            .map(|s| self.basis.rotation(s.rotation))
            .unwrap_or(Quat::IDENTITY)
    }

    /// `use_default_cs` reads the adjust in the internal axes rather than
    /// the configured output axes.
    pub fn calibration_adjust(&self, node: NodeType, is_pre: bool, use_default_cs: bool) -> Quat {
        let q = self.calibration.adjust(node, is_pre);
        if use_default_cs {
            q
        } else {
            self.basis.rotation(q)
        }
    }

    pub fn set_calibration_adjust(
        &mut self,
        node: NodeType,
        q: Quat,
        is_pre: bool,
        use_default_cs: bool,
    ) -> Result<()> {
        let q = check_rotation("calibration adjust", q)?;
        let q = if use_default_cs { q } else { self.basis.inverse_rotation(q) };
        self.calibration.set_adjust(node, q, is_pre);
        Ok(())
    }

    pub fn is_upper_arm_reverted(&self, side: Chirality) -> bool {
        self.calibration.is_upper_arm_reverted(side)
    }

    pub fn revert_upper_arm(&mut self, chirality: Chirality) {
        self.calibration.revert_upper_arm(chirality);
    }

    pub fn swap_calibrations(&mut self, hands: bool, upper_arms: bool) {
        self.calibration.swap(hands, upper_arms);
    }

    pub fn morph_calibrations_to_outer(&mut self) {
        self.calibration.morph_to_outer();
    }

    /// Returns true when the final step committed new adjusts.
    pub fn axis_calibration(&mut self, chirality: Chirality, step: AxisCalibrationStep) -> bool {
        let raws = self.raw_rotations();
        self.calibration.axis_step(chirality, step, &raws)
    }

    // ---- body model ----

    pub fn body(&self) -> &BodyModel {
        &self.body
    }

    pub fn bone_length(&self, bone: Bone) -> f32 {
        self.body.bone_length(bone)
    }

    pub fn set_bone_length(&mut self, bone: Bone, length: f32) -> Result<()> {
        self.body.set_bone_length(bone, length)
    }

    pub fn eyes_forward_distance(&self) -> f32 {
        self.body.eyes_forward_distance()
    }

    pub fn set_eyes_forward_distance(&mut self, distance: f32) -> Result<()> {
        self.body.set_eyes_forward_distance(distance)
    }

    pub fn controller_width(&self) -> f32 {
        self.body.controller_width()
    }

    pub fn set_controller_width(&mut self, width: f32) -> Result<()> {
        self.body.set_controller_width(width)
    }

    pub fn controller_offset(&self, side: Chirality) -> Vec3 {
        self.body.controller_offset(side).unwrap_or_default()
    }

    pub fn set_controller_offset(&mut self, offset: Vec3, side: Chirality) -> Result<()> {
        self.body.set_controller_offset(offset, side)
    }

    pub fn neck_lean_angle(&self) -> f32 {
        self.body.neck_lean_angle()
    }

    pub fn set_neck_lean_angle(&mut self, angle: f32) -> Result<()> {
        self.body.set_neck_lean_angle(angle)
    }

    pub fn body_rotation_mode(&self) -> BodyRotationMode {
        self.body.body_rotation_mode()
    }

    pub fn set_body_rotation_mode(&mut self, mode: BodyRotationMode) {
        self.body.set_body_rotation_mode(mode);
    }

    // ---- per-frame update ----

    /// Recompute the current frame from the data already ingested, e.g.
    /// after a calibration change.
    pub fn apply(&mut self) -> Result<()> {
        self.nodes.clear_edges();
        let now = self.frame.time().unwrap_or_else(Instant::now);
        let input = self.pose_input();
        self.frame = self
            .body
            .solve(&input, &self.previous, now, self.settings.smoothing);
        Ok(())
    }

    pub fn update(&mut self) -> Result<()> {
        self.step(Feed::Links, None, None)
    }

    pub fn hmd_rotation_update(&mut self, hmd: Quat) -> Result<()> {
        self.step(Feed::Links, Some(hmd), None)
    }

    pub fn hmd_transform_update(&mut self, hmd: Quat, position: Vec3) -> Result<()> {
        self.step(Feed::Links, Some(hmd), Some(position))
    }

    /// Update from host-supplied reports, one optional buffer per node in
    /// [`NodeType`] order.
    pub fn extern_update(&mut self, reports: &[Option<&[u8]>; NodeType::COUNT]) -> Result<()> {
        self.step(Feed::Extern(reports), None, None)
    }

    pub fn extern_hmd_rotation_update(
        &mut self,
        reports: &[Option<&[u8]>; NodeType::COUNT],
        hmd: Quat,
    ) -> Result<()> {
        self.step(Feed::Extern(reports), Some(hmd), None)
    }

    pub fn extern_hmd_transform_update(
        &mut self,
        reports: &[Option<&[u8]>; NodeType::COUNT],
        hmd: Quat,
        position: Vec3,
    ) -> Result<()> {
        self.step(Feed::Extern(reports), Some(hmd), Some(position))
    }

    fn read_links(&mut self) -> Result<Ingest> {
        let polled = self.nodes.poll()?;
        let mut ingest = Ingest {
            lost: Vec::new(),
            samples: Vec::new(),
            external: false,
        };
        for (node, poll) in NodeType::ALL.iter().zip(polled) {
            match poll {
                Poll::Idle => {}
                Poll::Lost => ingest.lost.push(*node),
                Poll::Report(raw) => match protocol::parse_report(&raw) {
                    Ok(sample) => ingest.samples.push((*node, raw, sample)),
                    Err(e) => log::warn!("Dropping report from {:?}: {}", node, e),
                },
            }
        }
        Ok(ingest)
    }

    fn read_extern(reports: &[Option<&[u8]>; NodeType::COUNT]) -> Result<Ingest> {
        let mut ingest = Ingest {
            lost: Vec::new(),
            samples: Vec::new(),
            external: true,
        };
        for (node, report) in NodeType::ALL.iter().zip(reports.iter()) {
            if let Some(raw) = report {
                let sample = protocol::parse_report(raw)?;
                ingest.samples.push((*node, raw.to_vec(), sample));
            }
        }
        Ok(ingest)
    }

    fn step(&mut self, feed: Feed<'_>, hmd: Option<Quat>, position: Option<Vec3>) -> Result<()> {
        // Everything fallible happens before the first mutation.
        let hmd = hmd
            .map(|q| check_rotation("HMD rotation", q).map(|q| self.basis.inverse_rotation(q)))
            .transpose()?;
        let position = position
            .map(|p| check_vector("HMD position", p).map(|p| self.basis.inverse_vector(p - self.root_offset)))
            .transpose()?;
        let ingest = match feed {
            Feed::Links => self.read_links()?,
            Feed::Extern(reports) => Self::read_extern(reports)?,
        };

        let now = Instant::now();
        let dt = self
            .last_update
            .map(|t| now.saturating_duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.last_update = Some(now);

        for node in ingest.lost {
            self.nodes.mark_lost(node);
        }
        for (node, raw, sample) in ingest.samples {
            if ingest.external {
                self.nodes.attach_external(node);
            }
            self.nodes.ingest(node, raw, sample);
        }
        self.nodes.advance_events(dt);

        // HMD data lives for one update; a plain update drops it.
        self.hmd_rotation = hmd;
        self.hmd_position = position;

        let input = self.pose_input();
        let next = self.body.solve(&input, &self.frame, now, self.settings.smoothing);
        self.previous = std::mem::replace(&mut self.frame, next);

        self.pump_scan();
        Ok(())
    }

    fn pose_input(&self) -> PoseInput {
        let mut input = PoseInput {
            hmd_rotation: self.hmd_rotation,
            hmd_position: self.hmd_position,
            ..PoseInput::default()
        };
        for node in NodeType::ALL {
            let Some(sample) = self.nodes.get(*node).sample() else {
                continue;
            };
            let q = self.calibration.apply(*node, sample.rotation);
            let side = node.chirality().index().unwrap_or(0);
            if node.is_upper_arm() {
                if self.supports_upper_arms() {
                    input.upper_arms[side] = Some(q);
                }
            } else {
                input.hands[side] = Some(q);
            }
        }
        input
    }

    // ---- scanning and connections ----

    /// Start a time-bounded scan. Returns false for `ScannerType::None` or
    /// while another scan is still running.
    pub fn start_scan(
        &mut self,
        scanner: ScannerType,
        duration: Duration,
        rssi_threshold: i8,
        auto_connect: bool,
    ) -> bool {
        if scanner == ScannerType::None {
            return false;
        }
        if self.scan.as_ref().is_some_and(|s| !s.is_finished()) {
            log::warn!("Scan already running");
            return false;
        }
        // Fold in whatever a finished scan left behind.
        self.pump_scan();
        let request = ScanRequest {
            scanner,
            duration,
            rssi_threshold,
            interval: self.settings.scan_interval,
        };
        match Scan::start(self.transport.clone(), request, auto_connect) {
            Ok(scan) => {
                self.scan = Some(scan);
                true
            }
            Err(e) => {
                log::warn!("Failed to start scan: {}", e);
                false
            }
        }
    }

    /// Stop the scan and report the slots it filled. Empty when no scan ran.
    pub fn stop_scan(&mut self, auto_connect: bool) -> ScanResult {
        let Some(mut scan) = self.scan.take() else {
            return ScanResult::empty();
        };
        scan.stop();
        scan.auto_connect = auto_connect;
        self.fold_candidates(&mut scan);
        log::info!("Scan stopped, filled {:?}", scan.filled);
        scan.filled
    }

    fn pump_scan(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            self.fold_candidates(&mut scan);
            self.scan = Some(scan);
        }
    }

    fn fold_candidates(&mut self, scan: &mut Scan) {
        for adv in scan.drain() {
            if self.nodes.find_address(&adv.address).is_some() {
                continue;
            }
            self.candidates.retain(|c| c.address != adv.address);
            if scan.auto_connect {
                if let Some(node) = self.free_slot_for(&adv) {
                    match self.connect_to(node, &adv.address) {
                        Ok(()) => {
                            scan.filled |= ScanResult::node(node);
                            continue;
                        }
                        Err(e) => log::warn!("Auto-connect of {} failed: {}", adv.address, e),
                    }
                }
            }
            self.candidates.push(adv);
        }
    }

    fn role_slots(&self, role: NodeRole) -> &'static [NodeType] {
        match role {
            NodeRole::Controller => &[NodeType::RightHand, NodeType::LeftHand],
            NodeRole::UpperArm if self.supports_upper_arms() => {
                &[NodeType::RightUpperArm, NodeType::LeftUpperArm]
            }
            NodeRole::UpperArm => &[],
        }
    }

    /// Slot an auto-connected device goes to: the one that last held it,
    /// then the one it declares, then the first free slot of its role.
    fn free_slot_for(&self, adv: &Advertisement) -> Option<NodeType> {
        let slots = self.role_slots(adv.role);
        let free = |n: NodeType| !self.nodes.get(n).is_connected();
        let remembered = slots.iter().copied().find(|&n| {
            free(n) && self.nodes.get(n).remembered() == Some(adv.address.as_str())
        });
        let preferred = adv.preferred.filter(|&p| slots.contains(&p) && free(p));
        remembered
            .or(preferred)
            .or_else(|| slots.iter().copied().find(|&n| free(n)))
    }

    fn connect_to(&mut self, node: NodeType, address: &str) -> Result<()> {
        let link = self.transport.connect(address)?;
        self.nodes.attach(node, link);
        self.candidates.retain(|c| c.address != address);
        Ok(())
    }

    fn role_of(node: NodeType) -> NodeRole {
        if node.is_upper_arm() {
            NodeRole::UpperArm
        } else {
            NodeRole::Controller
        }
    }

    /// Best discovered device for a slot: the one it held last, then one
    /// declaring the slot, then any of the right role declaring nothing.
    fn pick_candidate(&self, node: NodeType) -> Option<String> {
        let role = Self::role_of(node);
        let remembered = self.nodes.get(node).remembered();
        self.candidates
            .iter()
            .find(|c| remembered == Some(c.address.as_str()))
            .or_else(|| self.candidates.iter().find(|c| c.role == role && c.preferred == Some(node)))
            .or_else(|| self.candidates.iter().find(|c| c.role == role && c.preferred.is_none()))
            .map(|c| c.address.clone())
    }

    /// One synchronous pass over bonded devices.
    fn refresh_candidates(&mut self) -> Result<()> {
        for adv in self.transport.discover(ScannerType::Bonded)? {
            if self.nodes.find_address(&adv.address).is_none() {
                self.candidates.retain(|c| c.address != adv.address);
                self.candidates.push(adv);
            }
        }
        Ok(())
    }

    /// Connect a slot to a discovered device, the device it held last, or
    /// failing both, a bonded device found by a fresh discovery pass.
    pub fn connect_node(&mut self, node: NodeType) -> Result<()> {
        if node.is_upper_arm() && !self.supports_upper_arms() {
            return Err(FinchError::illegal(format!(
                "{:?} has no upper-arm nodes",
                self.controller
            )));
        }
        if self.nodes.get(node).is_connected() {
            return Ok(());
        }
        self.pump_scan();

        let known = self
            .pick_candidate(node)
            .or_else(|| self.nodes.get(node).remembered().map(str::to_string));
        let address = match known {
            Some(address) => address,
            None => {
                self.refresh_candidates()?;
                self.pick_candidate(node).ok_or_else(|| {
                    FinchError::transport(format!("no known device for {:?}", node))
                })?
            }
        };
        self.connect_to(node, &address)
    }

    pub fn disconnect_node(&mut self, node: NodeType, unpair: bool) {
        self.nodes.detach(node, unpair);
    }

    pub fn suspend_node(&mut self, node: NodeType) -> bool {
        match self.nodes.set_suspended(node, true) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Suspend of {:?} failed: {}", node, e);
                false
            }
        }
    }

    pub fn resume_node(&mut self, node: NodeType) -> bool {
        match self.nodes.set_suspended(node, false) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Resume of {:?} failed: {}", node, e);
                false
            }
        }
    }

    pub fn is_node_suspended(&self, node: NodeType) -> bool {
        self.nodes.get(node).is_suspended()
    }

    pub fn nodes_state(&self) -> NodesState {
        self.nodes.state()
    }

    pub fn is_node_connected(&self, node: NodeType) -> bool {
        self.nodes.get(node).is_connected()
    }

    pub fn is_node_data_correct(&self, node: NodeType) -> bool {
        self.nodes.get(node).is_correct()
    }

    /// Identity of the node in a slot, while it is connected.
    pub fn node_info(&self, node: NodeType) -> Option<&NodeInfo> {
        let slot = self.nodes.get(node);
        if slot.is_connected() {
            Some(slot.info())
        } else {
            None
        }
    }

    pub fn node_charge(&self, node: NodeType) -> u8 {
        self.nodes.get(node).charge()
    }

    pub fn node_time(&self, node: NodeType) -> u64 {
        self.nodes.get(node).time_ms()
    }

    pub fn node_raw_data(&self, node: NodeType) -> &[u8] {
        self.nodes.get(node).raw()
    }

    pub fn swap_nodes(&mut self, first: NodeType, second: NodeType) {
        self.nodes.swap(first, second);
    }

    /// Move the controllers to the hands that hold them, going by the
    /// proximity sensors. Returns true when the sides were swapped.
    pub fn bind_controllers(&mut self) -> bool {
        let left = self.is_node_connected(NodeType::LeftHand);
        let right = self.is_node_connected(NodeType::RightHand);
        let left_wrong = !left || self.capacity_sensor(NodeType::LeftHand) == Some(Chirality::Right);
        let right_wrong = !right || self.capacity_sensor(NodeType::RightHand) == Some(Chirality::Left);
        if !(left_wrong && right_wrong && (left || right)) {
            return false;
        }
        self.swap_calibrations(true, false);
        self.swap_nodes(NodeType::LeftHand, NodeType::RightHand);
        log::info!("Controllers rebound to the opposite hands");
        true
    }

    /// Blocking write bounded by the configured send timeout.
    pub fn send_data_to_node(&mut self, node: NodeType, data: &[u8]) -> Result<()> {
        let timeout = self.settings.send_timeout;
        self.nodes.write(node, data, timeout)
    }

    pub fn haptic_pulse(&mut self, node: NodeType, ms: u16) -> Result<()> {
        self.send_data_to_node(node, &protocol::build_haptic_pulse(ms))
    }

    pub fn haptic_pattern(&mut self, node: NodeType, pattern: &[VibrationStep]) -> Result<()> {
        let package = protocol::build_haptic_pattern(pattern)?;
        self.send_data_to_node(node, &package)
    }

    pub fn set_led_state(&mut self, node: NodeType, on: bool) -> Result<()> {
        self.send_data_to_node(node, &protocol::build_led_state(on))
    }

    pub fn set_led_chirality(&mut self, node: NodeType, side: Chirality) -> Result<()> {
        self.send_data_to_node(node, &protocol::build_led_chirality(side == Chirality::Left))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            scan.stop();
        }
        self.nodes.close_all();
        log::info!("Finch session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::QuatExt;
    use crate::memory::{MemoryDevice, MemoryTransport};
    use std::f32::consts::FRAC_PI_2;

    fn sample(rotation: Quat, elements: Events) -> NodeSample {
        NodeSample {
            time_ms: 100,
            rotation,
            acceleration: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            elements,
            touch: Vec2::new(0.5, -0.5),
            trigger: 0.25,
            charge: 90,
        }
    }

    fn report(rotation: Quat, elements: Events) -> [u8; protocol::REPORT_SIZE] {
        protocol::encode_report(&sample(rotation, elements))
    }

    fn session(transport: Arc<MemoryTransport>) -> Session {
        Session::with_transport(ControllerType::Hand, Platform::Internal, transport, Settings::default())
            .unwrap()
    }

    fn wait_scan(session: &Session) {
        let started = Instant::now();
        while session.scan.as_ref().is_some_and(|s| !s.is_finished())
            && started.elapsed() < Duration::from_secs(5)
        {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_wavevr_dash_requires_wavevr() {
        let t: Arc<dyn Transport> = Arc::new(NullTransport);
        let err = Session::with_transport(
            ControllerType::WaveVRDash,
            Platform::Unity3D,
            t.clone(),
            Settings::default(),
        );
        assert!(matches!(err, Err(FinchError::IllegalArgument(_))));
        assert!(Session::with_transport(
            ControllerType::WaveVRDash,
            Platform::WaveVR,
            t,
            Settings::default()
        )
        .is_ok());
    }

    #[test]
    fn test_extern_update_drives_pose_and_events() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        assert!(!s.is_bone_available(Bone::RightHand));

        let right = report(Quat::IDENTITY, Events::BUTTON_ONE);
        s.extern_update(&[Some(&right[..]), None, None, None]).unwrap();

        assert!(s.is_node_connected(NodeType::RightHand));
        assert!(s.is_node_data_correct(NodeType::RightHand));
        assert!(!s.is_node_connected(NodeType::LeftHand));
        assert!(s.is_bone_available(Bone::RightHand));
        assert!(!s.is_bone_available(Bone::LeftHand));
        assert_eq!(s.events(NodeType::RightHand, EventType::Begin), Events::BUTTON_ONE);
        assert!((s.index_trigger(Chirality::Right) - 0.25).abs() < 0.01);
        assert_eq!(s.index_trigger(Chirality::Left), 0.0);
        assert_eq!(s.node_raw_data(NodeType::RightHand), &right[..]);
    }

    #[test]
    fn test_failed_update_keeps_previous_frame() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let right = report(Quat::from_rotation_y(0.3), Events::empty());
        s.extern_update(&[Some(&right[..]), None, None, None]).unwrap();
        let before = s.controller_rotation(Chirality::Right, false);
        let state = s.nodes_state();

        let short = [0u8; 5];
        let other = report(Quat::from_rotation_y(1.0), Events::BUTTON_TWO);
        let err = s.extern_update(&[Some(&other[..]), Some(&short[..]), None, None]);
        assert!(matches!(err, Err(FinchError::IllegalArgument(_))));
        assert_eq!(s.controller_rotation(Chirality::Right, false), before);
        assert_eq!(s.nodes_state(), state);
        assert!(s.events(NodeType::RightHand, EventType::Process).is_empty());

        let nan = Quat::from_xyzw(f32::NAN, 0.0, 0.0, 1.0);
        assert!(s.hmd_rotation_update(nan).is_err());
    }

    #[test]
    fn test_calibration_and_cs() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let raw = Quat::from_rotation_y(0.8);
        let right = report(raw, Events::empty());
        s.extern_update(&[Some(&right[..]), None, None, None]).unwrap();

        s.calibrate(Chirality::Right, RecenterMode::Forward);
        s.apply().unwrap();
        let q = s.controller_rotation(Chirality::Right, false);
        assert!(q.angle_to(Quat::IDENTITY) < 1e-3);

        // Unity-style axes: internal x -> (0,-1,0), y -> (0,0,1), z -> (1,0,0).
        s.set_cs(Vec3::new(0.0, -1.0, 0.0), Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 0.0))
            .unwrap();
        let p = s.bone_position(Bone::RightUpperArm);
        let shoulder = s.bone_length(Bone::RightShoulder);
        assert!((p - Vec3::new(0.0, -shoulder, 0.0)).length() < 1e-4);
        assert!(s.set_cs(Vec3::X, Vec3::X, Vec3::Y).is_err());

        s.set_default_cs();
        s.set_root_offset(Vec3::new(0.0, 1.0, 0.0)).unwrap();
        let p = s.bone_position(Bone::RightUpperArm);
        assert!((p - Vec3::new(shoulder, 1.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn test_calibration_adjust_in_both_frames() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        s.set_cs(Vec3::new(-1.0, 0.0, 0.0), Vec3::Y, Vec3::Z).unwrap();
        let q = Quat::from_rotation_y(FRAC_PI_2);
        s.set_calibration_adjust(NodeType::LeftHand, q, true, false).unwrap();
        assert!(s.calibration_adjust(NodeType::LeftHand, true, false).angle_to(q) < 1e-5);
        // Mirrored x flips the sense of a yaw.
        let internal = s.calibration_adjust(NodeType::LeftHand, true, true);
        assert!((internal.heading() + FRAC_PI_2).abs() < 1e-4);
    }

    #[test]
    fn test_recenter_by_controllers_positions() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let right = report(Quat::IDENTITY, Events::empty());
        let left = report(Quat::IDENTITY, Events::empty());
        s.extern_update(&[Some(&right[..]), Some(&left[..]), None, None]).unwrap();

        // Right controller towards -z, left towards +z: the body faces +x.
        s.recenter_by_controllers_positions(Vec3::new(0.0, 0.0, 0.3), Vec3::new(0.0, 0.0, -0.3))
            .unwrap();
        s.apply().unwrap();
        let heading = s.controller_rotation(Chirality::Left, false).heading();
        assert!((heading - FRAC_PI_2).abs() < 1e-3);
        assert!(s
            .recenter_by_controllers_positions(Vec3::Y, Vec3::Y * 2.0)
            .is_err());
    }

    #[test]
    fn test_scan_auto_connects_and_reports() {
        let transport = Arc::new(MemoryTransport::new());
        let right = MemoryDevice::controller("AA:01", Chirality::Right);
        let arm = MemoryDevice::upper_arm("BB:02", Chirality::Left);
        transport.add(right.clone());
        transport.add(arm.clone());
        let mut s = session(transport);

        assert!(!s.start_scan(ScannerType::None, Duration::from_millis(10), -70, true));
        assert!(s.start_scan(ScannerType::Bonded, Duration::from_millis(30), -70, true));
        assert!(!s.start_scan(ScannerType::Bonded, Duration::from_millis(30), -70, true));
        wait_scan(&s);
        s.update().unwrap();
        assert!(s.is_node_connected(NodeType::RightHand));
        assert!(s.is_node_connected(NodeType::LeftUpperArm));
        assert!(right.is_connected());

        let filled = s.stop_scan(true);
        assert_eq!(filled, ScanResult::RIGHT_HAND | ScanResult::LEFT_UPPER_ARM);
        assert_eq!(s.stop_scan(true), ScanResult::empty());

        right.push_sample(&sample(Quat::IDENTITY, Events::BUTTON_GRIP));
        s.update().unwrap();
        assert!(s.is_node_data_correct(NodeType::RightHand));
        assert_eq!(s.events(NodeType::RightHand, EventType::Begin), Events::BUTTON_GRIP);
        assert_eq!(s.node_charge(NodeType::RightHand), 90);
        assert_eq!(
            s.node_info(NodeType::RightHand).map(|i| i.address.as_str()),
            Some("AA:01")
        );
    }

    #[test]
    fn test_dash_has_no_upper_arms() {
        let transport = Arc::new(MemoryTransport::new());
        transport.add(MemoryDevice::upper_arm("BB:02", Chirality::Left));
        let mut s = Session::with_transport(
            ControllerType::Dash,
            Platform::Internal,
            transport,
            Settings::default(),
        )
        .unwrap();
        assert!(matches!(
            s.connect_node(NodeType::LeftUpperArm),
            Err(FinchError::IllegalArgument(_))
        ));
        assert!(s.start_scan(ScannerType::Bonded, Duration::from_millis(20), -70, true));
        wait_scan(&s);
        assert_eq!(s.stop_scan(true), ScanResult::empty());
        assert!(matches!(
            s.connect_node(NodeType::RightHand),
            Err(FinchError::Transport(_))
        ));
    }

    #[test]
    fn test_manual_connect_and_io() {
        let transport = Arc::new(MemoryTransport::new());
        let left = MemoryDevice::controller("AA:03", Chirality::Left);
        transport.add(left.clone());
        let mut s = session(transport);

        assert!(s.start_scan(ScannerType::AB, Duration::from_millis(20), -70, false));
        wait_scan(&s);
        assert_eq!(s.stop_scan(false), ScanResult::empty());
        assert!(!s.is_node_connected(NodeType::LeftHand));

        s.connect_node(NodeType::LeftHand).unwrap();
        assert!(left.is_connected());

        s.set_led_state(NodeType::LeftHand, true).unwrap();
        s.haptic_pulse(NodeType::LeftHand, 100).unwrap();
        assert_eq!(left.written(), vec![vec![0, 7, 6], vec![10, 50]]);

        left.set_fail_writes(true);
        assert!(matches!(
            s.send_data_to_node(NodeType::LeftHand, &[1]),
            Err(FinchError::Timeout)
        ));
        assert!(s.send_data_to_node(NodeType::RightHand, &[1]).is_err());

        assert!(s.suspend_node(NodeType::LeftHand));
        assert!(left.is_suspended());
        assert!(s.resume_node(NodeType::LeftHand));
        assert!(!s.suspend_node(NodeType::RightHand));

        s.disconnect_node(NodeType::LeftHand, false);
        assert!(!left.is_connected());
        // The slot remembers the device and reconnects it directly.
        s.connect_node(NodeType::LeftHand).unwrap();
        assert!(left.is_connected());
    }

    #[test]
    fn test_lost_link_clears_slot_without_failing() {
        let transport = Arc::new(MemoryTransport::new());
        let right = MemoryDevice::controller("AA:01", Chirality::Right);
        transport.add(right.clone());
        let mut s = session(transport);
        s.connect_node(NodeType::RightHand).unwrap();

        right.push_sample(&sample(Quat::IDENTITY, Events::BUTTON_ONE));
        s.update().unwrap();
        assert!(s.is_node_data_correct(NodeType::RightHand));

        right.drop_link();
        s.update().unwrap();
        assert!(!s.is_node_connected(NodeType::RightHand));
        assert_eq!(s.events(NodeType::RightHand, EventType::End), Events::BUTTON_ONE);
    }

    #[test]
    fn test_supplemented_element_queries() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let flags = Events::LEFT_PROXIMITY | Events::IS_LED_ON | Events::LED_CHIRALITY;
        let left = report(Quat::IDENTITY, flags);
        s.extern_update(&[None, Some(&left[..]), None, None]).unwrap();
        assert_eq!(s.capacity_sensor(NodeType::LeftHand), Some(Chirality::Left));
        assert_eq!(s.capacity_sensor(NodeType::RightHand), None);
        assert!(s.led_state(NodeType::LeftHand));
        assert_eq!(s.led_chirality(NodeType::LeftHand), Chirality::Left);
        assert_eq!(s.led_chirality(NodeType::RightHand), Chirality::Right);

        std::thread::sleep(Duration::from_millis(10));
        s.extern_update(&[None, Some(&left[..]), None, None]).unwrap();
        assert!(s.element_hold_time(NodeType::LeftHand, ControllerElement::IsLedOn) > 0.0);
    }

    #[test]
    fn test_low_rssi_bonded_device_is_not_connected() {
        let transport = Arc::new(MemoryTransport::new());
        let far = MemoryDevice::controller("AA:09", Chirality::Right).with_rssi(-90);
        transport.add(far.clone());
        let mut s = session(transport);

        assert!(s.start_scan(ScannerType::Bonded, Duration::from_millis(30), -70, true));
        wait_scan(&s);
        s.update().unwrap();
        assert!(!s.is_node_connected(NodeType::RightHand));
        assert!(!s.is_node_connected(NodeType::LeftHand));
        assert!(!far.is_connected());
        assert_eq!(s.stop_scan(true), ScanResult::empty());
    }

    #[test]
    fn test_plain_update_drops_hmd_rotation() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let right = report(Quat::IDENTITY, Events::empty());
        let reports = [Some(&right[..]), None, None, None];

        s.extern_hmd_rotation_update(&reports, Quat::from_rotation_y(0.6)).unwrap();
        assert!((s.bone_rotation(Bone::Head, false).heading() - 0.6).abs() < 1e-4);

        s.extern_update(&reports).unwrap();
        assert!(s.bone_rotation(Bone::Head, false).heading().abs() < 1e-4);
        // Recentering to the HMD now has nothing to follow.
        s.recenter(Chirality::Right, RecenterMode::HmdRotation);
        s.apply().unwrap();
        assert!(s.controller_rotation(Chirality::Right, false).heading().abs() < 1e-3);
    }

    #[test]
    fn test_swipe_reported_on_release() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let touch = |x: f32, elements: Events| {
            let mut data = sample(Quat::IDENTITY, elements);
            data.touch = Vec2::new(x, 0.0);
            protocol::encode_report(&data)
        };
        let frames = [
            touch(-0.5, Events::TOUCH),
            touch(0.0, Events::TOUCH),
            touch(0.5, Events::TOUCH),
            touch(0.0, Events::empty()),
        ];
        for (i, frame) in frames.iter().enumerate() {
            std::thread::sleep(Duration::from_millis(5));
            s.extern_update(&[None, Some(&frame[..]), None, None]).unwrap();
            if i < frames.len() - 1 {
                assert_eq!(s.swipe(Chirality::Left), None);
            }
        }
        let (swipe, time) = s.swipe(Chirality::Left).unwrap();
        assert!((swipe.x - 1.0).abs() < 0.01);
        assert!(swipe.y.abs() < 1e-6);
        assert!(time >= 0.014);
        assert_eq!(s.swipe(Chirality::Right), None);
        assert_eq!(s.swipe(Chirality::Both), None);

        s.extern_update(&[None, Some(&frames[3][..]), None, None]).unwrap();
        assert_eq!(s.swipe(Chirality::Left), None);
    }

    #[test]
    fn test_bind_controllers_follows_proximity() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let held_right = report(Quat::IDENTITY, Events::RIGHT_PROXIMITY);
        s.extern_update(&[Some(&held_right[..]), None, None, None]).unwrap();
        assert!(!s.bind_controllers());
        assert!(s.is_node_connected(NodeType::RightHand));

        // The right slot's controller is held in the left hand.
        let adjust = Quat::from_rotation_y(0.4);
        s.set_calibration_adjust(NodeType::RightHand, adjust, true, true).unwrap();
        let held_left = report(Quat::IDENTITY, Events::LEFT_PROXIMITY);
        s.extern_update(&[Some(&held_left[..]), None, None, None]).unwrap();
        assert!(s.bind_controllers());
        assert!(s.is_node_connected(NodeType::LeftHand));
        assert!(!s.is_node_connected(NodeType::RightHand));
        assert!(s.calibration_adjust(NodeType::LeftHand, true, true).angle_to(adjust) < 1e-5);
        assert_eq!(s.calibration_adjust(NodeType::RightHand, true, true), Quat::IDENTITY);
    }

    #[test]
    fn test_bind_controllers_needs_a_controller() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        assert!(!s.bind_controllers());
        assert_eq!(s.nodes_state(), NodesState::empty());
    }

    #[test]
    fn test_swap_nodes_moves_state() {
        let mut s = session(Arc::new(MemoryTransport::new()));
        let right = report(Quat::IDENTITY, Events::BUTTON_ONE);
        s.extern_update(&[Some(&right[..]), None, None, None]).unwrap();
        s.swap_nodes(NodeType::RightHand, NodeType::LeftHand);
        assert_eq!(s.nodes_state(), NodesState::LEFT_HAND_CONNECTED | NodesState::LEFT_HAND_CORRECTLY);
        assert_eq!(s.events(NodeType::LeftHand, EventType::Begin), Events::BUTTON_ONE);
    }
}
