//! Orientation calibration.
//!
//! The calibrated orientation of a node is
//! `recenter[side] * post[node] * raw * revert[node] * pre[node]`, where
//! `revert` is a half turn about the upper arm's own axis while the arm
//! is flagged as reverted and identity otherwise. All quaternions here are
//! in the internal frame; the session converts at the boundary.

use crate::math::{average_rotation, QuatExt};
use crate::types::{AxisCalibrationStep, Chirality, NodeType, RecenterMode};
use glam::Quat;
use std::f32::consts::{FRAC_PI_2, PI};

const SIDES: usize = 2;

/// Orientation the arm is held in at each axis-calibration step, for the
/// right side. The left side mirrors the sideways step.
fn expected_pose(step: AxisCalibrationStep, side: Chirality) -> Quat {
    match step {
        AxisCalibrationStep::One => Quat::IDENTITY,
        AxisCalibrationStep::Two => Quat::from_rotation_x(-FRAC_PI_2),
        AxisCalibrationStep::Three => Quat::from_rotation_y(FRAC_PI_2 * side.sign()),
        AxisCalibrationStep::Four => Quat::from_rotation_x(FRAC_PI_2),
    }
}

fn next_step(step: AxisCalibrationStep) -> Option<AxisCalibrationStep> {
    match step {
        AxisCalibrationStep::One => Some(AxisCalibrationStep::Two),
        AxisCalibrationStep::Two => Some(AxisCalibrationStep::Three),
        AxisCalibrationStep::Three => Some(AxisCalibrationStep::Four),
        AxisCalibrationStep::Four => None,
    }
}

fn revert_turn() -> Quat {
    Quat::from_rotation_z(PI)
}

fn side_nodes(side: Chirality) -> impl Iterator<Item = NodeType> {
    [NodeType::hand(side), NodeType::upper_arm(side)]
        .into_iter()
        .flatten()
}

/// Progress of one side's four-step sequence.
#[derive(Debug, Clone, Default)]
struct AxisProgress {
    expected: Option<AxisCalibrationStep>,
    captures: Vec<(NodeType, Quat)>,
}

impl AxisProgress {
    fn reset(&mut self) {
        self.expected = None;
        self.captures.clear();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Calibration {
    pre: [Quat; NodeType::COUNT],
    post: [Quat; NodeType::COUNT],
    reverted: [bool; NodeType::COUNT],
    recenter: [Quat; SIDES],
    axis: [AxisProgress; SIDES],
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            pre: [Quat::IDENTITY; NodeType::COUNT],
            post: [Quat::IDENTITY; NodeType::COUNT],
            reverted: [false; NodeType::COUNT],
            recenter: [Quat::IDENTITY; SIDES],
            axis: Default::default(),
        }
    }
}

impl Calibration {
    fn revert(&self, node: NodeType) -> Quat {
        if self.reverted[node.index()] {
            revert_turn()
        } else {
            Quat::IDENTITY
        }
    }

    /// Raw orientation with the sensor-side adjusts applied.
    fn mounted(&self, node: NodeType, raw: Quat) -> Quat {
        raw.unit() * self.revert(node) * self.pre[node.index()]
    }

    /// Orientation before the per-side heading offset.
    fn aligned(&self, node: NodeType, raw: Quat) -> Quat {
        self.post[node.index()] * self.mounted(node, raw)
    }

    pub fn apply(&self, node: NodeType, raw: Quat) -> Quat {
        let side = node.chirality().index().unwrap_or(0);
        (self.recenter[side] * self.aligned(node, raw)).unit()
    }

    pub fn adjust(&self, node: NodeType, is_pre: bool) -> Quat {
        if is_pre {
            self.pre[node.index()]
        } else {
            self.post[node.index()]
        }
    }

    pub fn set_adjust(&mut self, node: NodeType, q: Quat, is_pre: bool) {
        let q = q.unit();
        if is_pre {
            self.pre[node.index()] = q;
        } else {
            self.post[node.index()] = q;
        }
    }

    pub fn recenter_heading(&self, side: Chirality) -> Quat {
        side.index()
            .map(|i| self.recenter[i])
            .unwrap_or(Quat::IDENTITY)
    }

    /// Rotate a side's heading so its controller faces `target`'s heading.
    /// Sides without raw data keep their offset.
    pub fn recenter(
        &mut self,
        chirality: Chirality,
        target: Quat,
        raws: &[Option<Quat>; NodeType::COUNT],
    ) {
        for side in chirality.sides() {
            let Some(hand) = NodeType::hand(*side) else {
                continue;
            };
            let Some(raw) = raws[hand.index()] else {
                log::warn!("Recenter of {:?} skipped, controller has no data", side);
                continue;
            };
            let current = self.aligned(hand, raw).heading();
            if let Some(i) = side.index() {
                self.recenter[i] = Quat::from_rotation_y(target.heading() - current);
            }
        }
    }

    /// Choose `post` so the current pose maps to the target orientation.
    pub fn calibrate(
        &mut self,
        chirality: Chirality,
        mode: RecenterMode,
        hmd: Quat,
        raws: &[Option<Quat>; NodeType::COUNT],
    ) {
        let target = match mode {
            RecenterMode::Forward => Quat::IDENTITY,
            RecenterMode::HmdRotation => hmd.yaw_only(),
        };
        for side in chirality.sides() {
            for node in side_nodes(*side) {
                if let Some(raw) = raws[node.index()] {
                    self.post[node.index()] = (target * self.mounted(node, raw).inverse()).unit();
                }
            }
            if let Some(i) = side.index() {
                self.recenter[i] = Quat::IDENTITY;
            }
        }
        log::info!("Calibrated {:?} ({:?})", chirality, mode);
    }

    pub fn reset(&mut self, chirality: Chirality) {
        for side in chirality.sides() {
            for node in side_nodes(*side) {
                self.pre[node.index()] = Quat::IDENTITY;
                self.post[node.index()] = Quat::IDENTITY;
                self.reverted[node.index()] = false;
            }
            if let Some(i) = side.index() {
                self.recenter[i] = Quat::IDENTITY;
                self.axis[i].reset();
            }
        }
    }

    pub fn is_upper_arm_reverted(&self, side: Chirality) -> bool {
        NodeType::upper_arm(side).is_some_and(|n| self.reverted[n.index()])
    }

    /// Toggle the reversal of the chirality's upper-arm nodes.
    pub fn revert_upper_arm(&mut self, chirality: Chirality) {
        for side in chirality.sides() {
            if let Some(node) = NodeType::upper_arm(*side) {
                self.reverted[node.index()] = !self.reverted[node.index()];
                log::debug!("Upper arm {:?} reverted={}", side, self.reverted[node.index()]);
            }
        }
    }

    /// Fold every reversal into the pre adjust so the output is unchanged
    /// and no arm reports as reverted.
    pub fn morph_to_outer(&mut self) {
        for node in [NodeType::RightUpperArm, NodeType::LeftUpperArm] {
            let i = node.index();
            if self.reverted[i] {
                self.pre[i] = (revert_turn() * self.pre[i]).unit();
                self.reverted[i] = false;
            }
        }
    }

    pub fn swap(&mut self, hands: bool, upper_arms: bool) {
        let mut pairs = Vec::new();
        if hands {
            pairs.push((NodeType::RightHand, NodeType::LeftHand));
            self.recenter.swap(0, 1);
        }
        if upper_arms {
            pairs.push((NodeType::RightUpperArm, NodeType::LeftUpperArm));
        }
        for (a, b) in pairs {
            self.pre.swap(a.index(), b.index());
            self.post.swap(a.index(), b.index());
            self.reverted.swap(a.index(), b.index());
        }
    }

    /// Feed one step of the four-step axis calibration. Returns true when
    /// step Four committed new `post` adjusts.
    pub fn axis_step(
        &mut self,
        chirality: Chirality,
        step: AxisCalibrationStep,
        raws: &[Option<Quat>; NodeType::COUNT],
    ) -> bool {
        let mut committed = false;
        for side in chirality.sides() {
            let Some(i) = side.index() else {
                continue;
            };
            if step == AxisCalibrationStep::One {
                self.axis[i].reset();
            } else if self.axis[i].expected != Some(step) {
                log::warn!(
                    "Axis calibration step {:?} out of order for {:?} (expected {:?}), sequence discarded",
                    step,
                    side,
                    self.axis[i].expected
                );
                self.axis[i].reset();
                continue;
            }

            let expected = expected_pose(step, *side);
            for node in side_nodes(*side) {
                if let Some(raw) = raws[node.index()] {
                    let capture = expected * self.mounted(node, raw).inverse();
                    self.axis[i].captures.push((node, capture));
                }
            }

            match next_step(step) {
                Some(next) => self.axis[i].expected = Some(next),
                None => {
                    committed |= self.commit_axis(*side, i);
                    self.axis[i].reset();
                }
            }
        }
        committed
    }

    fn commit_axis(&mut self, side: Chirality, i: usize) -> bool {
        let mut committed = false;
        for node in side_nodes(side) {
            let captures: Vec<Quat> = self.axis[i]
                .captures
                .iter()
                .filter(|(n, _)| *n == node)
                .map(|(_, q)| *q)
                .collect();
            if captures.len() == AxisCalibrationStep::LAST as usize {
                self.post[node.index()] = average_rotation(&captures);
                committed = true;
            } else if !captures.is_empty() {
                log::warn!("Axis calibration of {:?} incomplete, node data missing", node);
            }
        }
        if committed {
            self.recenter[i] = Quat::IDENTITY;
            log::info!("Axis calibration committed for {:?}", side);
        }
        committed
    }
}
