//! Flat C ABI over a process-wide [`Session`].
//!
//! Enumerations cross the boundary as their raw `u8` values and are decoded
//! with `from_raw`; unknown values are rejected with `IllegalArgument` or the
//! documented default. Calls are serialised on the session mutex. The
//! generated C header is written to `include/finch.h` by cbindgen.
#![allow(non_snake_case)]

use crate::error::LastError;
use crate::protocol::REPORT_SIZE;
use crate::session::Session;
use crate::transport::Transport;
use crate::types::{
    to_finch_bool, AxisCalibrationStep, BodyRotationMode, Bone, Chirality, ControllerElement,
    ControllerType, EventType, FinchBool, InitError, IoError, NodeInfo, NodeType, Platform,
    Quaternion, RecenterMode, ScannerType, UpdateError, Vector2, Vector3,
};
use crate::{FinchError, Result};
use std::ffi::c_char;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

/// Transport used by the next `FinchInit` instead of the platform default.
static TRANSPORT_OVERRIDE: Mutex<Option<Arc<dyn Transport>>> = Mutex::new(None);

/// Make the next `FinchInit` use `transport`, e.g. a
/// [`MemoryTransport`](crate::MemoryTransport) in a simulator. `None`
/// restores the platform default.
pub fn set_transport(transport: Option<Arc<dyn Transport>>) {
    let mut slot = match TRANSPORT_OVERRIDE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *slot = transport;
}

fn lock_session() -> MutexGuard<'static, Option<Session>> {
    match SESSION.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn decode<T>(decoded: Option<T>, what: &str, raw: u8) -> Result<T> {
    decoded.ok_or_else(|| FinchError::illegal(format!("unknown {} value {}", what, raw)))
}

fn record(err: FinchError) -> FinchError {
    log::debug!("Finch call failed: {}", err);
    LAST_ERROR.set(&err);
    err
}

/// Run a read-only query; `default` when no session is live.
fn query<T>(default: T, f: impl FnOnce(&Session) -> T) -> T {
    match lock_session().as_ref() {
        Some(session) => f(session),
        None => default,
    }
}

/// Query taking one enum argument; `default` when it does not decode.
fn query_arg<A, T>(
    raw: u8,
    decoder: fn(u8) -> Option<A>,
    what: &str,
    default: T,
    f: impl FnOnce(&Session, A) -> T,
) -> T {
    match decode(decoder(raw), what, raw) {
        Ok(arg) => query(default, |s| f(s, arg)),
        Err(e) => {
            record(e);
            default
        }
    }
}

/// Run a mutating call, failing with `NotInitialized` when no session is live.
fn with_session<T>(f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
    let mut guard = lock_session();
    let result = match guard.as_mut() {
        Some(session) => f(session),
        None => Err(FinchError::NotInitialized),
    };
    drop(guard);
    result.map_err(record)
}

/// Mutating call of a `void` export; failures only reach the last error.
fn command(f: impl FnOnce(&mut Session) -> Result<()>) {
    let _ = with_session(f);
}

fn update_status(result: Result<()>) -> u8 {
    match result {
        Ok(()) => UpdateError::None.as_raw(),
        Err(e) => e.update_code().as_raw(),
    }
}

fn io_status(result: Result<()>) -> u8 {
    match result {
        Ok(()) => IoError::None.as_raw(),
        Err(e) => e.io_code().as_raw(),
    }
}

/// Copy `bytes` into a caller buffer.
///
/// Always returns the required length (without terminator). Nothing is
/// written for a null buffer, zero length or a buffer that is too small.
/// A NUL follows string data only when there is room for it.
///
/// # Safety
/// `buf` must be null or valid for `length` bytes of writes.
unsafe fn write_buffer(bytes: &[u8], buf: *mut u8, length: u32, terminate: bool) -> u32 {
    let required = bytes.len();
    let length = length as usize;
    if buf.is_null() || length == 0 || length < required {
        return required as u32;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, required);
    if terminate && length > required {
        *buf.add(required) = 0;
    }
    required as u32
}

/// One node report from a host pointer; null means no data for that node.
///
/// # Safety
/// `ptr` must be null or valid for `REPORT_SIZE` bytes of reads.
unsafe fn report_slice<'a>(ptr: *const u8) -> Option<&'a [u8]> {
    if ptr.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(ptr, REPORT_SIZE))
    }
}

// ---- lifecycle ----

/// Copy the core version string into `f`, following the buffer convention.
///
/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetCoreVersion(f: *mut c_char, length: u32) -> u32 {
    write_buffer(env!("CARGO_PKG_VERSION").as_bytes(), f as *mut u8, length, true)
}

/// Create the session. Returns an `InitError` value.
#[no_mangle]
pub extern "C" fn FinchInit(controller: u8, platform: u8) -> u8 {
    let mut guard = lock_session();
    if guard.is_some() {
        record(FinchError::AlreadyInitialized);
        return InitError::AlreadyInitialized.as_raw();
    }
    let override_transport = match TRANSPORT_OVERRIDE.lock() {
        Ok(t) => t.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let created = decode(ControllerType::from_raw(controller), "controller type", controller)
        .and_then(|c| {
            let p = decode(Platform::from_raw(platform), "platform", platform)?;
            match override_transport {
                Some(t) => Session::with_transport(c, p, t, crate::Settings::from_env()),
                None => Session::new(c, p),
            }
        });
    match created {
        Ok(session) => {
            *guard = Some(session);
            LAST_ERROR.clear();
            InitError::None.as_raw()
        }
        Err(e) => record(e).init_code().as_raw(),
    }
}

/// Destroy the session. Safe to call without one.
#[no_mangle]
pub extern "C" fn FinchExit() {
    let session = lock_session().take();
    drop(session);
}

/// Controller type chosen at init, or `Unknown` without a session.
#[no_mangle]
pub extern "C" fn FinchGetControllerType() -> u8 {
    query(ControllerType::UNKNOWN, |s| s.controller_type().as_raw())
}

/// Message of the last failed call, or null. Valid until the next call
/// that fails.
#[no_mangle]
pub extern "C" fn FinchGetLastError() -> *const c_char {
    LAST_ERROR.as_ptr()
}

// ---- pose and telemetry ----

#[no_mangle]
pub extern "C" fn FinchIsBoneAvailable(bone: u8) -> FinchBool {
    to_finch_bool(query_arg(bone, Bone::from_raw, "bone", false, |s, b| s.is_bone_available(b)))
}

#[no_mangle]
pub extern "C" fn FinchGetBoneRotation(bone: u8, fPose: FinchBool) -> Quaternion {
    query_arg(bone, Bone::from_raw, "bone", Quaternion::IDENTITY, |s, b| {
        s.bone_rotation(b, fPose != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetControllerRotation(chirality: u8, fPose: FinchBool) -> Quaternion {
    query_arg(chirality, Chirality::from_raw, "chirality", Quaternion::IDENTITY, |s, c| {
        s.controller_rotation(c, fPose != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetBonePosition(bone: u8) -> Vector3 {
    query_arg(bone, Bone::from_raw, "bone", Vector3::ZERO, |s, b| s.bone_position(b).into())
}

#[no_mangle]
pub extern "C" fn FinchGetControllerPosition(chirality: u8, smooth: FinchBool) -> Vector3 {
    query_arg(chirality, Chirality::from_raw, "chirality", Vector3::ZERO, |s, c| {
        s.controller_position(c, smooth != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetBoneAngularAcceleration(bone: u8, globalCS: FinchBool) -> Vector3 {
    query_arg(bone, Bone::from_raw, "bone", Vector3::ZERO, |s, b| {
        s.bone_angular_acceleration(b, globalCS != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetBoneLinearAcceleration(bone: u8, globalCS: FinchBool) -> Vector3 {
    query_arg(bone, Bone::from_raw, "bone", Vector3::ZERO, |s, b| {
        s.bone_linear_acceleration(b, globalCS != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetBoneAngularVelocity(bone: u8, globalCS: FinchBool) -> Vector3 {
    query_arg(bone, Bone::from_raw, "bone", Vector3::ZERO, |s, b| {
        s.bone_angular_velocity(b, globalCS != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetBoneLinearVelocity(bone: u8, globalCS: FinchBool) -> Vector3 {
    query_arg(bone, Bone::from_raw, "bone", Vector3::ZERO, |s, b| {
        s.bone_linear_velocity(b, globalCS != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetTouchAxes(chirality: u8) -> Vector2 {
    query_arg(chirality, Chirality::from_raw, "chirality", Vector2::ZERO, |s, c| {
        s.touch_axes(c).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetEvents(node: u8, eventType: u8) -> u16 {
    query_arg(node, NodeType::from_raw, "node", 0, |s, n| {
        match decode(EventType::from_raw(eventType), "event type", eventType) {
            Ok(kind) => s.events(n, kind).bits(),
            Err(e) => {
                record(e);
                0
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn FinchGetIndexTrigger(chirality: u8) -> f32 {
    query_arg(chirality, Chirality::from_raw, "chirality", 0.0, |s, c| s.index_trigger(c))
}

// ---- coordinate system and calibration ----

#[no_mangle]
pub extern "C" fn FinchSetCs(x: Vector3, y: Vector3, z: Vector3) {
    command(|s| s.set_cs(x.into(), y.into(), z.into()));
}

#[no_mangle]
pub extern "C" fn FinchSetDefaultCs() {
    command(|s| {
        s.set_default_cs();
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchSetRootOffset(v: Vector3) {
    command(|s| s.set_root_offset(v.into()));
}

#[no_mangle]
pub extern "C" fn FinchRecenter(chirality: u8, mode: u8) {
    command(|s| {
        let c = decode(Chirality::from_raw(chirality), "chirality", chirality)?;
        let m = decode(RecenterMode::from_raw(mode), "recenter mode", mode)?;
        s.recenter(c, m);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchRecenterByDirection(chirality: u8, targetOrientation: Quaternion) {
    command(|s| {
        let c = decode(Chirality::from_raw(chirality), "chirality", chirality)?;
        s.recenter_by_direction(c, targetOrientation.into())
    });
}

#[no_mangle]
pub extern "C" fn FinchRecenterByControllersPositions(
    leftControllerPositionRelativelyToHmd: Vector3,
    rightControllerPositionRelativelyToHmd: Vector3,
) {
    command(|s| {
        s.recenter_by_controllers_positions(
            leftControllerPositionRelativelyToHmd.into(),
            rightControllerPositionRelativelyToHmd.into(),
        )
    });
}

#[no_mangle]
pub extern "C" fn FinchCalibration(chirality: u8, mode: u8) {
    command(|s| {
        let c = decode(Chirality::from_raw(chirality), "chirality", chirality)?;
        let m = decode(RecenterMode::from_raw(mode), "recenter mode", mode)?;
        s.calibrate(c, m);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchResetCalibration(chirality: u8) {
    command(|s| {
        s.reset_calibration(decode(Chirality::from_raw(chirality), "chirality", chirality)?);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchGetRawRotation(node: u8) -> Quaternion {
    query_arg(node, NodeType::from_raw, "node", Quaternion::IDENTITY, |s, n| s.raw_rotation(n).into())
}

#[no_mangle]
pub extern "C" fn FinchGetCalibrationAdjust(node: u8, isPre: FinchBool, useDefaultCS: FinchBool) -> Quaternion {
    query_arg(node, NodeType::from_raw, "node", Quaternion::IDENTITY, |s, n| {
        s.calibration_adjust(n, isPre != 0, useDefaultCS != 0).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchSetCalibrationAdjust(
    node: u8,
    calibrationQ: Quaternion,
    isPre: FinchBool,
    useDefaultCS: FinchBool,
) {
    command(|s| {
        let n = decode(NodeType::from_raw(node), "node", node)?;
        s.set_calibration_adjust(n, calibrationQ.into(), isPre != 0, useDefaultCS != 0)
    });
}

#[no_mangle]
pub extern "C" fn FinchIsUpperArmReverted(chirality: u8) -> FinchBool {
    to_finch_bool(query_arg(chirality, Chirality::from_raw, "chirality", false, |s, c| {
        s.is_upper_arm_reverted(c)
    }))
}

#[no_mangle]
pub extern "C" fn FinchRevertUpperArm(chirality: u8) {
    command(|s| {
        s.revert_upper_arm(decode(Chirality::from_raw(chirality), "chirality", chirality)?);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchSwapCalibrations(swapHands: FinchBool, swapUpperArms: FinchBool) {
    command(|s| {
        s.swap_calibrations(swapHands != 0, swapUpperArms != 0);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchMorphCalibrationsToOuter() {
    command(|s| {
        s.morph_calibrations_to_outer();
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchAxisCalibration(chirality: u8, step: u8) {
    command(|s| {
        let c = decode(Chirality::from_raw(chirality), "chirality", chirality)?;
        let st = decode(AxisCalibrationStep::from_raw(step), "axis calibration step", step)?;
        s.axis_calibration(c, st);
        Ok(())
    });
}

// ---- body model ----

#[no_mangle]
pub extern "C" fn FinchGetBoneLength(bone: u8) -> f32 {
    query_arg(bone, Bone::from_raw, "bone", 0.0, |s, b| s.bone_length(b))
}

#[no_mangle]
pub extern "C" fn FinchSetBoneLength(bone: u8, length: f32) {
    command(|s| s.set_bone_length(decode(Bone::from_raw(bone), "bone", bone)?, length));
}

#[no_mangle]
pub extern "C" fn FinchGetEyesForwardDistance() -> f32 {
    query(0.0, |s| s.eyes_forward_distance())
}

#[no_mangle]
pub extern "C" fn FinchSetEyesForwardDistance(distance: f32) {
    command(|s| s.set_eyes_forward_distance(distance));
}

#[no_mangle]
pub extern "C" fn FinchGetControllerWidth() -> f32 {
    query(0.0, |s| s.controller_width())
}

#[no_mangle]
pub extern "C" fn FinchSetControllerWidth(width: f32) {
    command(|s| s.set_controller_width(width));
}

#[no_mangle]
pub extern "C" fn FinchGetControllerOffset(chirality: u8) -> Vector3 {
    query_arg(chirality, Chirality::from_raw, "chirality", Vector3::ZERO, |s, c| {
        s.controller_offset(c).into()
    })
}

#[no_mangle]
pub extern "C" fn FinchSetControllerOffset(offset: Vector3, chirality: u8) {
    command(|s| {
        let c = decode(Chirality::from_raw(chirality), "chirality", chirality)?;
        s.set_controller_offset(offset.into(), c)
    });
}

#[no_mangle]
pub extern "C" fn FinchGetNeckLeanAngle() -> f32 {
    query(0.0, |s| s.neck_lean_angle())
}

#[no_mangle]
pub extern "C" fn FinchSetNeckLeanAngle(angle: f32) {
    command(|s| s.set_neck_lean_angle(angle));
}

#[no_mangle]
pub extern "C" fn FinchGetBodyRotationMode() -> u8 {
    query(BodyRotationMode::UNKNOWN, |s| s.body_rotation_mode().as_raw())
}

#[no_mangle]
pub extern "C" fn FinchSetBodyRotationMode(mode: u8) {
    command(|s| {
        s.set_body_rotation_mode(decode(BodyRotationMode::from_raw(mode), "body rotation mode", mode)?);
        Ok(())
    });
}

// ---- per-frame update ----

#[no_mangle]
pub extern "C" fn FinchApply() -> u8 {
    update_status(with_session(|s| s.apply()))
}

#[no_mangle]
pub extern "C" fn FinchUpdate() -> u8 {
    update_status(with_session(|s| s.update()))
}

#[no_mangle]
pub extern "C" fn FinchHmdRotationUpdate(qhmd: Quaternion) -> u8 {
    update_status(with_session(|s| s.hmd_rotation_update(qhmd.into())))
}

#[no_mangle]
pub extern "C" fn FinchHmdTransformUpdate(qhmd: Quaternion, phmd: Vector3) -> u8 {
    update_status(with_session(|s| s.hmd_transform_update(qhmd.into(), phmd.into())))
}

/// # Safety
/// Each pointer must be null or valid for one node report of reads.
#[no_mangle]
pub unsafe extern "C" fn FinchExternUpdate(
    rightHand: *const u8,
    leftHand: *const u8,
    rightUpperArm: *const u8,
    leftUpperArm: *const u8,
) -> u8 {
    let reports = [
        report_slice(rightHand),
        report_slice(leftHand),
        report_slice(rightUpperArm),
        report_slice(leftUpperArm),
    ];
    update_status(with_session(|s| s.extern_update(&reports)))
}

/// # Safety
/// Each pointer must be null or valid for one node report of reads.
#[no_mangle]
pub unsafe extern "C" fn FinchExternHmdRotationUpdate(
    rightHand: *const u8,
    leftHand: *const u8,
    rightUpperArm: *const u8,
    leftUpperArm: *const u8,
    qhmd: Quaternion,
) -> u8 {
    let reports = [
        report_slice(rightHand),
        report_slice(leftHand),
        report_slice(rightUpperArm),
        report_slice(leftUpperArm),
    ];
    update_status(with_session(|s| s.extern_hmd_rotation_update(&reports, qhmd.into())))
}

/// # Safety
/// Each pointer must be null or valid for one node report of reads.
#[no_mangle]
pub unsafe extern "C" fn FinchExternHmdTransformUpdate(
    rightHand: *const u8,
    leftHand: *const u8,
    rightUpperArm: *const u8,
    leftUpperArm: *const u8,
    qhmd: Quaternion,
    phmd: Vector3,
) -> u8 {
    let reports = [
        report_slice(rightHand),
        report_slice(leftHand),
        report_slice(rightUpperArm),
        report_slice(leftUpperArm),
    ];
    update_status(with_session(|s| s.extern_hmd_transform_update(&reports, qhmd.into(), phmd.into())))
}

// ---- scanning and nodes ----

#[no_mangle]
pub extern "C" fn FinchStartScan(
    scanner: u8,
    timeMs: u32,
    rssiThreshold: i8,
    autoConnect: FinchBool,
) -> FinchBool {
    let started = with_session(|s| {
        let kind = decode(ScannerType::from_raw(scanner), "scanner type", scanner)?;
        let duration = Duration::from_millis(u64::from(timeMs));
        Ok(s.start_scan(kind, duration, rssiThreshold, autoConnect != 0))
    });
    to_finch_bool(started.unwrap_or(false))
}

#[no_mangle]
pub extern "C" fn FinchStopScan(autoConnect: FinchBool) -> u8 {
    with_session(|s| Ok(s.stop_scan(autoConnect != 0).bits())).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn FinchConnectNode(node: u8) -> u8 {
    io_status(with_session(|s| {
        s.connect_node(decode(NodeType::from_raw(node), "node", node)?)
    }))
}

#[no_mangle]
pub extern "C" fn FinchDisconnectNode(node: u8, unpair: FinchBool) {
    command(|s| {
        s.disconnect_node(decode(NodeType::from_raw(node), "node", node)?, unpair != 0);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchGetNodesState() -> u8 {
    query(0, |s| s.nodes_state().bits())
}

#[no_mangle]
pub extern "C" fn FinchIsNodeConnected(node: u8) -> FinchBool {
    to_finch_bool(query_arg(node, NodeType::from_raw, "node", false, |s, n| s.is_node_connected(n)))
}

#[no_mangle]
pub extern "C" fn FinchIsNodeDataCorrectly(node: u8) -> FinchBool {
    to_finch_bool(query_arg(node, NodeType::from_raw, "node", false, |s, n| {
        s.is_node_data_correct(n)
    }))
}

/// # Safety
/// `buf` must be null or valid for `length` bytes of writes.
unsafe fn node_string(node: u8, buf: *mut c_char, length: u32, pick: fn(&NodeInfo) -> String) -> u32 {
    let text = query_arg(node, NodeType::from_raw, "node", String::new(), |s, n| {
        s.node_info(n).map(pick).unwrap_or_default()
    });
    write_buffer(text.as_bytes(), buf as *mut u8, length, true)
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeName(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.name.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeAddress(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.address.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeManufacturerName(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.manufacturer_name.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeModelNumber(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.model_number.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeSerialNumber(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.serial_number.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeHardwareRevision(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.hardware_revision.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeFirmwareRevision(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.firmware_revision.clone())
}

/// # Safety
/// `f` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeSoftwareRevision(node: u8, f: *mut c_char, length: u32) -> u32 {
    node_string(node, f, length, |i| i.software_revision.clone())
}

fn node_field<T: Default>(node: u8, pick: fn(&NodeInfo) -> T) -> T {
    query_arg(node, NodeType::from_raw, "node", T::default(), |s, n| {
        s.node_info(n).map(pick).unwrap_or_default()
    })
}

#[no_mangle]
pub extern "C" fn FinchGetNodeVendorIDSource(node: u8) -> u8 {
    node_field(node, |i| i.vendor_id_source)
}

#[no_mangle]
pub extern "C" fn FinchGetNodeVendorID(node: u8) -> u16 {
    node_field(node, |i| i.vendor_id)
}

#[no_mangle]
pub extern "C" fn FinchGetNodeProductID(node: u8) -> u16 {
    node_field(node, |i| i.product_id)
}

#[no_mangle]
pub extern "C" fn FinchGetNodeProductVersion(node: u8) -> u16 {
    node_field(node, |i| i.product_version)
}

#[no_mangle]
pub extern "C" fn FinchGetNodeCharge(node: u8) -> u8 {
    query_arg(node, NodeType::from_raw, "node", 0, |s, n| s.node_charge(n))
}

#[no_mangle]
pub extern "C" fn FinchGetNodeTime(node: u8) -> u64 {
    query_arg(node, NodeType::from_raw, "node", 0, |s, n| s.node_time(n))
}

/// Copy the node's last raw report into `data`, following the buffer
/// convention without a terminator.
///
/// # Safety
/// `data` must be null or valid for `length` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn FinchGetNodeRawData(node: u8, data: *mut u8, length: u32) -> u32 {
    let raw = query_arg(node, NodeType::from_raw, "node", Vec::new(), |s, n| {
        s.node_raw_data(n).to_vec()
    });
    write_buffer(&raw, data, length, false)
}

#[no_mangle]
pub extern "C" fn FinchSwapNodes(first: u8, second: u8) {
    command(|s| {
        let a = decode(NodeType::from_raw(first), "node", first)?;
        let b = decode(NodeType::from_raw(second), "node", second)?;
        s.swap_nodes(a, b);
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn FinchSuspendNode(node: u8) -> FinchBool {
    let done = with_session(|s| Ok(s.suspend_node(decode(NodeType::from_raw(node), "node", node)?)));
    to_finch_bool(done.unwrap_or(false))
}

#[no_mangle]
pub extern "C" fn FinchResumeNode(node: u8) -> FinchBool {
    let done = with_session(|s| Ok(s.resume_node(decode(NodeType::from_raw(node), "node", node)?)));
    to_finch_bool(done.unwrap_or(false))
}

/// Blocking write to a node, bounded by the send timeout. Returns an
/// `IoError` value.
///
/// # Safety
/// `data` must be null or valid for `length` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn FinchSendDataToNode(node: u8, data: *const u8, length: u32) -> u8 {
    let payload: Result<&[u8]> = if data.is_null() {
        if length == 0 {
            Ok(&[])
        } else {
            Err(FinchError::illegal("null data with non-zero length"))
        }
    } else {
        Ok(std::slice::from_raw_parts(data, length as usize))
    };
    io_status(with_session(|s| {
        let n = decode(NodeType::from_raw(node), "node", node)?;
        s.send_data_to_node(n, payload?)
    }))
}

/// Seconds the element has been held on a node; not part of the native
/// header but exported for hosts that poll hold times.
#[no_mangle]
pub extern "C" fn FinchGetElementHoldTime(node: u8, element: u8) -> f32 {
    query_arg(node, NodeType::from_raw, "node", 0.0, |s, n| {
        match decode(ControllerElement::from_raw(element), "element", element) {
            Ok(e) => s.element_hold_time(n, e),
            Err(e) => {
                record(e);
                0.0
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDevice, MemoryTransport};
    use crate::protocol;
    use crate::types::{Events, NodeSample, FINCH_FALSE, FINCH_TRUE};
    use glam::{Quat, Vec2, Vec3};

    /// The ABI session is process-wide; tests touching it run one at a time.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        let guard = match TEST_LOCK.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        FinchExit();
        set_transport(Some(Arc::new(MemoryTransport::new())));
        guard
    }

    fn report(elements: Events) -> [u8; REPORT_SIZE] {
        protocol::encode_report(&NodeSample {
            time_ms: 1234,
            rotation: Quat::IDENTITY,
            acceleration: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            elements,
            touch: Vec2::ZERO,
            trigger: 0.0,
            charge: 55,
        })
    }

    #[test]
    fn test_init_twice_and_exit() {
        let _guard = serial();
        let hand = ControllerType::Hand.as_raw();
        let internal = Platform::Internal.as_raw();
        assert_eq!(FinchGetControllerType(), ControllerType::UNKNOWN);

        assert_eq!(FinchInit(hand, internal), InitError::None.as_raw());
        assert_eq!(FinchGetControllerType(), hand);
        assert_eq!(FinchInit(ControllerType::Dash.as_raw(), internal), InitError::AlreadyInitialized.as_raw());
        // The live session is untouched.
        assert_eq!(FinchGetControllerType(), hand);
        assert!(!FinchGetLastError().is_null());

        FinchExit();
        FinchExit();
        assert_eq!(FinchGetControllerType(), ControllerType::UNKNOWN);
    }

    #[test]
    fn test_init_rejects_bad_arguments() {
        let _guard = serial();
        assert_eq!(FinchInit(9, Platform::Internal.as_raw()), InitError::IllegalArgument.as_raw());
        assert_eq!(
            FinchInit(ControllerType::WaveVRDash.as_raw(), Platform::Unity3D.as_raw()),
            InitError::IllegalArgument.as_raw()
        );
        assert_eq!(FinchInit(ControllerType::Hand.as_raw(), 42), InitError::IllegalArgument.as_raw());
        assert_eq!(FinchGetControllerType(), ControllerType::UNKNOWN);
    }

    #[test]
    fn test_calls_without_session() {
        let _guard = serial();
        assert_eq!(FinchUpdate(), UpdateError::NotInitialized.as_raw());
        assert_eq!(FinchApply(), UpdateError::NotInitialized.as_raw());
        assert_eq!(FinchGetBoneRotation(Bone::Head.as_raw(), FINCH_TRUE), Quaternion::IDENTITY);
        assert_eq!(FinchGetBonePosition(Bone::Head.as_raw()), Vector3::ZERO);
        assert_eq!(FinchIsNodeConnected(0), FINCH_FALSE);
        assert_eq!(FinchStopScan(FINCH_TRUE), 0);
        assert_eq!(FinchStartScan(ScannerType::Bonded.as_raw(), 10, -70, FINCH_TRUE), FINCH_FALSE);
        assert_eq!(
            unsafe { FinchSendDataToNode(0, std::ptr::null(), 0) },
            IoError::NotInitialized.as_raw()
        );
        // Setters are no-ops.
        FinchSetBoneLength(Bone::Neck.as_raw(), 1.0);
        assert_eq!(FinchGetBoneLength(Bone::Neck.as_raw()), 0.0);
    }

    #[test]
    fn test_buffer_convention() {
        let _guard = serial();
        let version = env!("CARGO_PKG_VERSION");
        let required = unsafe { FinchGetCoreVersion(std::ptr::null_mut(), 0) };
        assert_eq!(required as usize, version.len());

        let mut buf = [0x55 as c_char; 32];
        assert_eq!(unsafe { FinchGetCoreVersion(buf.as_mut_ptr(), 0) }, required);
        assert_eq!(buf[0], 0x55);

        // Too small: nothing written.
        assert_eq!(unsafe { FinchGetCoreVersion(buf.as_mut_ptr(), required - 1) }, required);
        assert_eq!(buf[0], 0x55);

        // Exact: bytes without terminator.
        assert_eq!(unsafe { FinchGetCoreVersion(buf.as_mut_ptr(), required) }, required);
        assert_eq!(buf[0] as u8, version.as_bytes()[0]);
        assert_eq!(buf[required as usize], 0x55);

        // Room for the terminator.
        assert_eq!(unsafe { FinchGetCoreVersion(buf.as_mut_ptr(), required + 1) }, required);
        assert_eq!(buf[required as usize], 0);
    }

    #[test]
    fn test_body_setters_round_trip() {
        let _guard = serial();
        FinchInit(ControllerType::Shift.as_raw(), Platform::Unity3D.as_raw());
        FinchSetBoneLength(Bone::LeftLowerArm.as_raw(), 0.2731);
        assert_eq!(FinchGetBoneLength(Bone::LeftLowerArm.as_raw()), 0.2731);
        FinchSetBoneLength(Bone::LeftLowerArm.as_raw(), -0.5);
        assert_eq!(FinchGetBoneLength(Bone::LeftLowerArm.as_raw()), 0.2731);

        FinchSetEyesForwardDistance(0.085);
        assert_eq!(FinchGetEyesForwardDistance(), 0.085);
        FinchSetControllerWidth(0.031);
        assert_eq!(FinchGetControllerWidth(), 0.031);
        FinchSetNeckLeanAngle(12.0);
        assert_eq!(FinchGetNeckLeanAngle(), 12.0);
        FinchSetControllerOffset(Vector3::new(0.01, 0.02, 0.03), Chirality::Right.as_raw());
        assert_eq!(FinchGetControllerOffset(Chirality::Left.as_raw()), Vector3::new(-0.01, 0.02, 0.03));
        FinchSetBodyRotationMode(BodyRotationMode::HmdRotation.as_raw());
        assert_eq!(FinchGetBodyRotationMode(), BodyRotationMode::HmdRotation.as_raw());
        FinchSetBodyRotationMode(99);
        assert_eq!(FinchGetBodyRotationMode(), BodyRotationMode::HmdRotation.as_raw());
        FinchExit();
    }

    #[test]
    fn test_extern_update_and_raw_data() {
        let _guard = serial();
        FinchInit(ControllerType::Hand.as_raw(), Platform::External.as_raw());
        let right = report(Events::BUTTON_THUMB);
        let status = unsafe {
            FinchExternUpdate(right.as_ptr(), std::ptr::null(), std::ptr::null(), std::ptr::null())
        };
        assert_eq!(status, UpdateError::None.as_raw());
        assert_eq!(FinchIsNodeConnected(NodeType::RightHand.as_raw()), FINCH_TRUE);
        assert_eq!(FinchIsNodeDataCorrectly(NodeType::RightHand.as_raw()), FINCH_TRUE);
        assert_eq!(FinchGetNodesState(), 0b11);
        assert_eq!(
            FinchGetEvents(NodeType::RightHand.as_raw(), EventType::Begin.as_raw()),
            Events::BUTTON_THUMB.bits()
        );
        assert_eq!(FinchGetNodeTime(NodeType::RightHand.as_raw()), 1234);
        assert_eq!(FinchGetNodeCharge(NodeType::RightHand.as_raw()), 55);

        let mut raw = [0u8; REPORT_SIZE];
        let n = unsafe { FinchGetNodeRawData(NodeType::RightHand.as_raw(), raw.as_mut_ptr(), REPORT_SIZE as u32) };
        assert_eq!(n as usize, REPORT_SIZE);
        assert_eq!(raw, right);

        // Externally fed nodes have no link to write to.
        let cmd = [1u8, 2];
        assert_eq!(
            unsafe { FinchSendDataToNode(NodeType::RightHand.as_raw(), cmd.as_ptr(), 2) },
            IoError::RuntimeError.as_raw()
        );
        assert_eq!(
            unsafe { FinchSendDataToNode(NodeType::RightHand.as_raw(), std::ptr::null(), 2) },
            IoError::IllegalArgument.as_raw()
        );
        FinchExit();
    }

    #[test]
    fn test_scan_connects_memory_node() {
        let _guard = serial();
        let transport = Arc::new(MemoryTransport::new());
        let right = MemoryDevice::controller("C0:FF:EE:00:00:01", Chirality::Right).with_rssi(-40);
        transport.add(right.clone());
        set_transport(Some(transport));

        assert_eq!(
            FinchInit(ControllerType::Hand.as_raw(), Platform::Internal.as_raw()),
            InitError::None.as_raw()
        );
        assert_eq!(FinchStartScan(ScannerType::None.as_raw(), 50, -70, FINCH_TRUE), FINCH_FALSE);
        assert_eq!(FinchStartScan(ScannerType::Bonded.as_raw(), 50, -70, FINCH_TRUE), FINCH_TRUE);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(FinchUpdate(), UpdateError::None.as_raw());
        assert_eq!(FinchIsNodeConnected(NodeType::RightHand.as_raw()), FINCH_TRUE);
        assert_eq!(FinchStopScan(FINCH_TRUE), 1 << NodeType::RightHand.as_raw());

        let mut name = [0 as c_char; 64];
        let len = unsafe { FinchGetNodeAddress(NodeType::RightHand.as_raw(), name.as_mut_ptr(), 64) };
        let address = unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) };
        assert_eq!(len as usize, "C0:FF:EE:00:00:01".len());
        assert_eq!(address.to_str().unwrap(), "C0:FF:EE:00:00:01");

        let pulse = [10u8, 50];
        assert_eq!(
            unsafe { FinchSendDataToNode(NodeType::RightHand.as_raw(), pulse.as_ptr(), 2) },
            IoError::None.as_raw()
        );
        assert_eq!(right.written(), vec![pulse.to_vec()]);

        FinchDisconnectNode(NodeType::RightHand.as_raw(), FINCH_FALSE);
        assert_eq!(FinchIsNodeConnected(NodeType::RightHand.as_raw()), FINCH_FALSE);
        assert_eq!(FinchConnectNode(NodeType::RightHand.as_raw()), IoError::None.as_raw());
        assert_eq!(FinchConnectNode(NodeType::LeftHand.as_raw()), IoError::RuntimeError.as_raw());
        FinchExit();
        assert!(!right.is_connected());
        set_transport(None);
    }
}
