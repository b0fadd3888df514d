//! Body proportions and the arm-model pose solver.
//!
//! Internal frame: x right, y up, z forward, metres, origin at the
//! shoulder midpoint (the base of the neck). Limb segments extend along
//! their local +z. Root placement from the HMD is folded into the solved
//! positions; the host root offset and output basis are applied at query
//! time by the session.

use crate::math::{average_rotation, QuatExt};
use crate::types::{Bone, BodyRotationMode, Chirality};
use crate::{FinchError, Result};
use glam::{Quat, Vec3};
use std::time::Instant;

/// Half the interpupillary distance.
const HALF_IPD: f32 = 0.032;
/// Weight towards the controllers per frame in `HandMotion` mode.
const HAND_MOTION_FOLLOW: f32 = 0.1;
/// How far the clavicle turns towards the arm in the reach-out mode.
const REACHOUT_FACTOR: f32 = 0.3;

fn default_length(bone: Bone) -> f32 {
    match bone {
        Bone::Hips => 0.1,
        Bone::Spine => 0.2,
        Bone::Chest => 0.2,
        Bone::Neck => 0.1,
        Bone::Head => 0.12,
        Bone::LeftShoulder | Bone::RightShoulder => 0.17,
        Bone::LeftUpperArm | Bone::RightUpperArm => 0.29,
        Bone::LeftLowerArm | Bone::RightLowerArm => 0.26,
        Bone::LeftHand | Bone::RightHand => 0.08,
        Bone::LeftUpperLeg | Bone::RightUpperLeg => 0.45,
        Bone::LeftLowerLeg | Bone::RightLowerLeg => 0.43,
        Bone::LeftFoot | Bone::RightFoot => 0.15,
        _ => 0.0,
    }
}

fn check_distance(what: &str, value: f32) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FinchError::illegal(format!("{} must be finite and non-negative, got {}", what, value)))
    }
}

fn mirror_x(v: Vec3) -> Vec3 {
    v * Vec3::new(-1.0, 1.0, 1.0)
}

/// Adjustable body proportions and solver options.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyModel {
    lengths: [f32; Bone::COUNT],
    eyes_forward: f32,
    controller_width: f32,
    /// Right, then left.
    controller_offset: [Vec3; 2],
    /// Forward neck tilt in radians.
    neck_lean: f32,
    rotation_mode: BodyRotationMode,
}

impl Default for BodyModel {
    fn default() -> Self {
        let mut lengths = [0.0; Bone::COUNT];
        for bone in Bone::ALL {
            lengths[bone.index()] = default_length(*bone);
        }
        let right_offset = Vec3::new(0.0, -0.03, 0.05);
        Self {
            lengths,
            eyes_forward: 0.1,
            controller_width: 0.04,
            controller_offset: [right_offset, mirror_x(right_offset)],
            neck_lean: 0.0,
            rotation_mode: BodyRotationMode::ShoulderRotation,
        }
    }
}

impl BodyModel {
    pub fn bone_length(&self, bone: Bone) -> f32 {
        self.lengths[bone.index()]
    }

    pub fn set_bone_length(&mut self, bone: Bone, length: f32) -> Result<()> {
        check_distance("bone length", length)?;
        self.lengths[bone.index()] = length;
        Ok(())
    }

    pub fn eyes_forward_distance(&self) -> f32 {
        self.eyes_forward
    }

    pub fn set_eyes_forward_distance(&mut self, distance: f32) -> Result<()> {
        check_distance("eyes forward distance", distance)?;
        self.eyes_forward = distance;
        Ok(())
    }

    pub fn controller_width(&self) -> f32 {
        self.controller_width
    }

    pub fn set_controller_width(&mut self, width: f32) -> Result<()> {
        check_distance("controller width", width)?;
        self.controller_width = width;
        Ok(())
    }

    /// Offset of the controller centre from the hand; `Both` has none.
    pub fn controller_offset(&self, side: Chirality) -> Option<Vec3> {
        side.index().map(|i| self.controller_offset[i])
    }

    /// Set one side's offset; the other side receives the x-mirrored value.
    /// `Both` sets the right side and mirrors it.
    pub fn set_controller_offset(&mut self, offset: Vec3, side: Chirality) -> Result<()> {
        if !offset.is_finite() {
            return Err(FinchError::illegal("controller offset must be finite"));
        }
        let (i, o) = match side {
            Chirality::Left => (1, 0),
            Chirality::Right | Chirality::Both => (0, 1),
        };
        self.controller_offset[i] = offset;
        self.controller_offset[o] = mirror_x(offset);
        Ok(())
    }

    pub fn neck_lean_angle(&self) -> f32 {
        self.neck_lean
    }

    pub fn set_neck_lean_angle(&mut self, radians: f32) -> Result<()> {
        if !radians.is_finite() {
            return Err(FinchError::illegal("neck lean angle must be finite"));
        }
        self.neck_lean = radians;
        Ok(())
    }

    pub fn body_rotation_mode(&self) -> BodyRotationMode {
        self.rotation_mode
    }

    pub fn set_body_rotation_mode(&mut self, mode: BodyRotationMode) {
        self.rotation_mode = mode;
    }
}

/// Calibrated inputs for one solve, per side indexed right then left.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PoseInput {
    pub hands: [Option<Quat>; 2],
    pub upper_arms: [Option<Quat>; 2],
    pub hmd_rotation: Option<Quat>,
    pub hmd_position: Option<Vec3>,
}

impl PoseInput {
    fn has_body(&self) -> bool {
        self.hands.iter().chain(self.upper_arms.iter()).any(Option::is_some)
    }
}

/// Solved state of one bone, internal frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoneState {
    pub available: bool,
    pub rotation: Quat,
    pub filtered_rotation: Quat,
    pub position: Vec3,
    pub linear_velocity: Vec3,
    pub linear_acceleration: Vec3,
    pub angular_velocity: Vec3,
    pub angular_acceleration: Vec3,
}

/// Solved controller pose, internal frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerState {
    pub available: bool,
    pub rotation: Quat,
    pub filtered_rotation: Quat,
    pub position: Vec3,
    pub smooth_position: Vec3,
}

/// One committed pose snapshot.
#[derive(Debug, Clone)]
pub struct Frame {
    bones: [BoneState; Bone::COUNT],
    controllers: [ControllerState; 2],
    chest: Quat,
    /// Translation that anchors the body to the HMD.
    root: Vec3,
    time: Option<Instant>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            bones: [BoneState::default(); Bone::COUNT],
            controllers: [ControllerState::default(); 2],
            chest: Quat::IDENTITY,
            root: Vec3::ZERO,
            time: None,
        }
    }
}

impl Frame {
    pub fn bone(&self, bone: Bone) -> &BoneState {
        &self.bones[bone.index()]
    }

    /// `None` for `Both`.
    pub fn controller(&self, side: Chirality) -> Option<&ControllerState> {
        side.index().map(|i| &self.controllers[i])
    }

    pub(crate) fn time(&self) -> Option<Instant> {
        self.time
    }
}

struct ArmBones {
    clavicle_base: Bone,
    clavicle_offset: Bone,
    shoulder: Bone,
    upper: Bone,
    lower: Bone,
    hand: Bone,
    center: Bone,
}

fn arm_bones(side: Chirality) -> ArmBones {
    match side {
        Chirality::Left => ArmBones {
            clavicle_base: Bone::LeftClavicleBase,
            clavicle_offset: Bone::LeftClavicleOffset,
            shoulder: Bone::LeftShoulder,
            upper: Bone::LeftUpperArm,
            lower: Bone::LeftLowerArm,
            hand: Bone::LeftHand,
            center: Bone::LeftHandCenter,
        },
        _ => ArmBones {
            clavicle_base: Bone::RightClavicleBase,
            clavicle_offset: Bone::RightClavicleOffset,
            shoulder: Bone::RightShoulder,
            upper: Bone::RightUpperArm,
            lower: Bone::RightLowerArm,
            hand: Bone::RightHand,
            center: Bone::RightHandCenter,
        },
    }
}

fn yaw_average(rotations: impl Iterator<Item = Quat>) -> Option<Quat> {
    let yaws: Vec<Quat> = rotations.map(QuatExt::yaw_only).collect();
    if yaws.is_empty() {
        None
    } else {
        Some(average_rotation(&yaws))
    }
}

/// Rotation and position of every solved bone before smoothing.
type RawPose = [Option<(Quat, Vec3)>; Bone::COUNT];

impl BodyModel {
    fn len(&self, bone: Bone) -> f32 {
        self.lengths[bone.index()]
    }

    fn chest_rotation(&self, input: &PoseInput, prev: &Frame) -> Quat {
        let hands = || yaw_average(input.hands.iter().flatten().copied());
        let shoulders = || {
            yaw_average(input.upper_arms.iter().flatten().copied()).or_else(hands)
        };
        let hmd = || input.hmd_rotation.map(QuatExt::yaw_only);
        let chest = match self.rotation_mode {
            BodyRotationMode::None => None,
            BodyRotationMode::ShoulderRotation
            | BodyRotationMode::ShoulderRotationWithReachout => shoulders(),
            BodyRotationMode::HandRotation => hands(),
            BodyRotationMode::HandMotion => {
                hands().map(|target| prev.chest.slerp(target, HAND_MOTION_FOLLOW))
            }
            BodyRotationMode::HmdRotation => hmd(),
            BodyRotationMode::FullBodyRotation => {
                let parts: Vec<Quat> = [hmd(), shoulders()].into_iter().flatten().collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(average_rotation(&parts))
                }
            }
        };
        chest.unwrap_or(Quat::IDENTITY).unit()
    }

    fn solve_torso(&self, pose: &mut RawPose, chest: Quat, hmd: Option<Quat>) {
        let down = Vec3::NEG_Y;
        let neck_pos = Vec3::ZERO;
        let chest_pos = neck_pos + chest * (down * self.len(Bone::Chest));
        let spine_pos = chest_pos + chest * (down * self.len(Bone::Spine));
        let hips_pos = spine_pos + chest * (down * self.len(Bone::Hips));
        pose[Bone::Hips.index()] = Some((chest, hips_pos));
        pose[Bone::Spine.index()] = Some((chest, spine_pos));
        pose[Bone::Chest.index()] = Some((chest, chest_pos));

        let lean = Quat::from_rotation_x(self.neck_lean);
        let neck = (chest * lean).normalize();
        pose[Bone::Neck.index()] = Some((neck, neck_pos));

        let head_pos = neck_pos + neck * (Vec3::Y * self.len(Bone::Neck));
        let head = hmd.map(|q| (q * lean).unit()).unwrap_or(neck);
        pose[Bone::Head.index()] = Some((head, head_pos));

        let eyes = head_pos + head * Vec3::new(0.0, self.len(Bone::Head), self.eyes_forward);
        pose[Bone::LeftEye.index()] = Some((head, eyes + head * Vec3::new(-HALF_IPD, 0.0, 0.0)));
        pose[Bone::RightEye.index()] = Some((head, eyes + head * Vec3::new(HALF_IPD, 0.0, 0.0)));
    }

    /// Returns the solved controller pose of the side, if its hand is live.
    fn solve_arm(
        &self,
        pose: &mut RawPose,
        side: Chirality,
        chest: Quat,
        hand: Option<Quat>,
        upper: Option<Quat>,
    ) -> Option<(Quat, Vec3)> {
        let bones = arm_bones(side);
        let sign = side.sign();

        let arm_yaw = upper.or(hand).map(QuatExt::yaw_only);
        let clavicle = match (self.rotation_mode, arm_yaw) {
            (BodyRotationMode::ShoulderRotationWithReachout, Some(yaw)) => {
                chest.slerp(yaw, REACHOUT_FACTOR).normalize()
            }
            _ => chest,
        };
        let base = Vec3::ZERO;
        let joint = base + clavicle * Vec3::new(sign * self.len(bones.shoulder), 0.0, 0.0);
        pose[bones.clavicle_base.index()] = Some((clavicle, base));
        pose[bones.shoulder.index()] = Some((clavicle, base));
        pose[bones.clavicle_offset.index()] = Some((clavicle, joint));

        if let Some(q) = upper {
            pose[bones.upper.index()] = Some((q, joint));
        }
        let hand = hand?;
        let upper = upper.unwrap_or_else(|| chest.slerp(hand, 0.5).normalize());
        pose[bones.upper.index()] = Some((upper, joint));

        let elbow = joint + upper * (Vec3::Z * self.len(bones.upper));
        pose[bones.lower.index()] = Some((hand, elbow));
        let wrist = elbow + hand * (Vec3::Z * self.len(bones.lower));
        pose[bones.hand.index()] = Some((hand, wrist));
        let center = wrist + hand * (Vec3::Z * (self.len(bones.hand) * 0.5));
        pose[bones.center.index()] = Some((hand, center));

        let i = side.index().unwrap_or(0);
        // Grip centre sits half the controller width towards the body midline.
        let grip = Vec3::new(-sign * self.controller_width * 0.5, 0.0, 0.0);
        let controller = wrist + hand * (self.controller_offset[i] + grip);
        Some((hand, controller))
    }

    /// Solve a new frame from calibrated inputs. `keep` is the weight the
    /// filtered outputs retain from the previous frame.
    pub(crate) fn solve(&self, input: &PoseInput, prev: &Frame, now: Instant, keep: f32) -> Frame {
        let mut frame = Frame {
            root: prev.root,
            time: Some(now),
            ..Frame::default()
        };
        if !input.has_body() {
            return frame;
        }

        let chest = self.chest_rotation(input, prev);
        frame.chest = chest;

        let mut pose: RawPose = [None; Bone::COUNT];
        self.solve_torso(&mut pose, chest, input.hmd_rotation);
        let mut controllers = [None; 2];
        for side in [Chirality::Right, Chirality::Left] {
            let i = side.index().unwrap_or(0);
            controllers[i] =
                self.solve_arm(&mut pose, side, chest, input.hands[i], input.upper_arms[i]);
        }

        if let Some(hmd_position) = input.hmd_position {
            let eye_mid = match (pose[Bone::LeftEye.index()], pose[Bone::RightEye.index()]) {
                (Some((_, l)), Some((_, r))) => l.lerp(r, 0.5),
                _ => Vec3::ZERO,
            };
            frame.root = hmd_position - eye_mid;
        }

        let dt = prev
            .time
            .map(|t| now.saturating_duration_since(t).as_secs_f32())
            .filter(|dt| *dt > 0.0);
        let follow = (1.0 - keep).clamp(0.0, 1.0);

        for bone in Bone::ALL {
            let i = bone.index();
            if let Some((rotation, position)) = pose[i] {
                frame.bones[i] =
                    finish_bone(rotation, position + frame.root, &prev.bones[i], dt, follow);
            }
        }
        for (i, solved) in controllers.iter().enumerate() {
            if let Some((rotation, position)) = *solved {
                let position = position + frame.root;
                let last = &prev.controllers[i];
                frame.controllers[i] = if last.available {
                    ControllerState {
                        available: true,
                        rotation,
                        filtered_rotation: last.filtered_rotation.slerp(rotation, follow).normalize(),
                        position,
                        smooth_position: last.smooth_position.lerp(position, follow),
                    }
                } else {
                    ControllerState {
                        available: true,
                        rotation,
                        filtered_rotation: rotation,
                        position,
                        smooth_position: position,
                    }
                };
            }
        }
        frame
    }
}

fn finish_bone(
    rotation: Quat,
    position: Vec3,
    last: &BoneState,
    dt: Option<f32>,
    follow: f32,
) -> BoneState {
    let mut state = BoneState {
        available: true,
        rotation,
        filtered_rotation: rotation,
        position,
        ..BoneState::default()
    };
    if !last.available {
        return state;
    }
    state.filtered_rotation = last.filtered_rotation.slerp(rotation, follow).normalize();
    if let Some(dt) = dt {
        state.linear_velocity = (position - last.position) / dt;
        state.linear_acceleration = (state.linear_velocity - last.linear_velocity) / dt;
        state.angular_velocity = (rotation * last.rotation.inverse()).rotation_vector() / dt;
        state.angular_acceleration = (state.angular_velocity - last.angular_velocity) / dt;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    fn forward_hands() -> PoseInput {
        PoseInput {
            hands: [Some(Quat::IDENTITY), Some(Quat::IDENTITY)],
            ..PoseInput::default()
        }
    }

    #[test]
    fn test_setters_store_exact_values() {
        let mut model = BodyModel::default();
        model.set_bone_length(Bone::LeftUpperArm, 0.3125).unwrap();
        assert_eq!(model.bone_length(Bone::LeftUpperArm), 0.3125);
        assert!(model.set_bone_length(Bone::LeftUpperArm, -1.0).is_err());
        assert!(model.set_eyes_forward_distance(f32::NAN).is_err());
        assert_eq!(model.bone_length(Bone::LeftUpperArm), 0.3125);

        model.set_neck_lean_angle(-7.5).unwrap();
        assert_eq!(model.neck_lean_angle(), -7.5);
    }

    #[test]
    fn test_neck_lean_is_radians() {
        let mut model = BodyModel::default();
        model.set_body_rotation_mode(BodyRotationMode::HandRotation);
        model.set_neck_lean_angle(0.3).unwrap();
        let mut input = forward_hands();
        input.hands = [Some(Quat::from_rotation_y(0.4)); 2];
        let frame = model.solve(&input, &Frame::default(), Instant::now(), 0.5);

        let chest = frame.bone(Bone::Chest).rotation;
        let neck = frame.bone(Bone::Neck).rotation;
        assert!((chest.angle_to(neck) - 0.3).abs() < 1e-3);
        // Tilted forward about the chest's own right axis.
        let tilt = chest.inverse() * neck;
        assert!((tilt * Vec3::Y - Vec3::new(0.0, 0.3f32.cos(), 0.3f32.sin())).length() < 1e-4);
    }

    #[test]
    fn test_controller_offset_mirrors() {
        let mut model = BodyModel::default();
        model.set_controller_offset(Vec3::new(0.02, -0.01, 0.04), Chirality::Left).unwrap();
        assert_eq!(model.controller_offset(Chirality::Left), Some(Vec3::new(0.02, -0.01, 0.04)));
        assert_eq!(model.controller_offset(Chirality::Right), Some(Vec3::new(-0.02, -0.01, 0.04)));
        assert_eq!(model.controller_offset(Chirality::Both), None);
    }

    #[test]
    fn test_arms_forward_pose() {
        let model = BodyModel::default();
        let frame = model.solve(&forward_hands(), &Frame::default(), Instant::now(), 0.5);

        let shoulder = model.bone_length(Bone::RightShoulder);
        let reach = model.bone_length(Bone::RightUpperArm) + model.bone_length(Bone::RightLowerArm);
        let wrist = frame.bone(Bone::RightHand);
        assert!(wrist.available);
        assert!(close(wrist.position, Vec3::new(shoulder, 0.0, reach)));
        let left = frame.bone(Bone::LeftHand).position;
        assert!(close(left, Vec3::new(-shoulder, 0.0, reach)));

        assert!(frame.bone(Bone::Head).available);
        assert!(!frame.bone(Bone::LeftIndexTip).available);
        assert!(frame.controller(Chirality::Right).is_some_and(|c| c.available));
    }

    #[test]
    fn test_missing_hand_leaves_arm_unavailable() {
        let model = BodyModel::default();
        let input = PoseInput {
            hands: [Some(Quat::IDENTITY), None],
            ..PoseInput::default()
        };
        let frame = model.solve(&input, &Frame::default(), Instant::now(), 0.5);
        assert!(frame.bone(Bone::RightLowerArm).available);
        assert!(!frame.bone(Bone::LeftLowerArm).available);
        assert!(!frame.controller(Chirality::Left).is_some_and(|c| c.available));

        let empty = model.solve(&PoseInput::default(), &frame, Instant::now(), 0.5);
        assert!(!empty.bone(Bone::Chest).available);
    }

    #[test]
    fn test_hmd_transform_anchors_eyes() {
        let model = BodyModel::default();
        let mut input = forward_hands();
        input.hmd_rotation = Some(Quat::IDENTITY);
        input.hmd_position = Some(Vec3::new(0.5, 1.6, -0.2));
        let frame = model.solve(&input, &Frame::default(), Instant::now(), 0.5);
        let mid = frame
            .bone(Bone::LeftEye)
            .position
            .lerp(frame.bone(Bone::RightEye).position, 0.5);
        assert!(close(mid, Vec3::new(0.5, 1.6, -0.2)));
    }

    #[test]
    fn test_velocity_and_filtering() {
        let model = BodyModel::default();
        let t0 = Instant::now();
        let first = model.solve(&forward_hands(), &Frame::default(), t0, 0.5);

        let turned = Quat::from_rotation_y(0.2);
        let mut input = forward_hands();
        input.hands[0] = Some(turned);
        let mut body = model.clone();
        body.set_body_rotation_mode(BodyRotationMode::None);
        let second = body.solve(&input, &first, t0 + Duration::from_millis(100), 0.5);

        let hand = second.bone(Bone::RightHand);
        assert!((hand.angular_velocity.y - 2.0).abs() < 1e-2);
        // Half-way between the previous and the new orientation.
        assert!((hand.filtered_rotation.heading() - 0.1).abs() < 1e-3);
        let c = second.controller(Chirality::Right).map(|c| c.filtered_rotation.heading());
        assert!(c.is_some_and(|h| (h - 0.1).abs() < 1e-3));
    }

    #[test]
    fn test_chest_follows_hmd() {
        let mut model = BodyModel::default();
        model.set_body_rotation_mode(BodyRotationMode::HmdRotation);
        let mut input = forward_hands();
        input.hmd_rotation = Some(Quat::from_rotation_y(0.7));
        let frame = model.solve(&input, &Frame::default(), Instant::now(), 0.5);
        assert!((frame.bone(Bone::Chest).rotation.heading() - 0.7).abs() < 1e-4);
    }
}
