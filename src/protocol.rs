use crate::types::{Events, NodeSample};
use crate::{FinchError, Result};
use glam::{Quat, Vec2, Vec3};

// -- Report geometry --
pub const REPORT_SIZE: usize = 30;

/// Orientation fixed-point scale: 2^(-14) = 1/16384.
pub const QUAT_SCALE: f32 = 6.103515625e-05;

/// Accelerometer scale: 1/2048 g per LSB, expressed in m/s^2.
pub const ACCEL_SCALE: f32 = 9.80665 / 2048.0;

/// Gyroscope scale: 1/1024 rad/s per LSB.
pub const GYRO_SCALE: f32 = 1.0 / 1024.0;

/// Allowed deviation of a decoded orientation from unit length.
pub const NORM_TOLERANCE: f32 = 0.1;

// -- Node command opcodes --
pub const CMD_LED: u8 = 7;
pub const LED_ON: u8 = 6;
pub const LED_OFF: u8 = 7;
pub const CMD_LED_LEFT: u8 = 8;
pub const CMD_LED_RIGHT: u8 = 9;

/// Haptic timing limits in milliseconds; encoded in 10 ms units.
pub const HAPTIC_MIN_MS: f32 = 50.0;
pub const HAPTIC_MAX_MS: f32 = 2550.0;
pub const HAPTIC_DEFAULT_SPEED: u8 = 50;
pub const HAPTIC_MAX_STEPS: usize = 10;

fn read_i16(data: &[u8], at: usize) -> f32 {
    i16::from_le_bytes([data[at], data[at + 1]]) as f32
}

fn axis_from_u8(raw: u8) -> f32 {
    raw as f32 / 255.0 * 2.0 - 1.0
}

fn axis_to_u8(value: f32) -> u8 {
    ((value.clamp(-1.0, 1.0) + 1.0) * 0.5 * 255.0).round() as u8
}

fn write_i16(buf: &mut [u8], at: usize, value: f32) {
    let raw = value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    buf[at..at + 2].copy_from_slice(&raw.to_le_bytes());
}

/// Parse one node report.
///
/// Layout (little endian):
/// - `[0..4]`: u32 node time in milliseconds
/// - `[4..12]`: orientation [w, x, y, z] as 4x i16 (scaled by 2^-14)
/// - `[12..18]`: accelerometer [x, y, z] as 3x i16 (1/2048 g)
/// - `[18..24]`: gyroscope [x, y, z] as 3x i16 (1/1024 rad/s)
/// - `[24..26]`: u16 element state bits
/// - `[26]`, `[27]`: touch x, y (0..255 -> -1..1)
/// - `[28]`: index trigger (0..255 -> 0..1)
/// - `[29]`: battery charge in percent
pub fn parse_report(data: &[u8]) -> Result<NodeSample> {
    if data.len() != REPORT_SIZE {
        return Err(FinchError::illegal(format!(
            "node report must be {} bytes, got {}",
            REPORT_SIZE,
            data.len()
        )));
    }

    let time_ms = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64;

    // Wire order is w, x, y, z
    let qw = read_i16(data, 4) * QUAT_SCALE;
    let qx = read_i16(data, 6) * QUAT_SCALE;
    let qy = read_i16(data, 8) * QUAT_SCALE;
    let qz = read_i16(data, 10) * QUAT_SCALE;

    let acceleration = Vec3::new(
        read_i16(data, 12) * ACCEL_SCALE,
        read_i16(data, 14) * ACCEL_SCALE,
        read_i16(data, 16) * ACCEL_SCALE,
    );
    let angular_velocity = Vec3::new(
        read_i16(data, 18) * GYRO_SCALE,
        read_i16(data, 20) * GYRO_SCALE,
        read_i16(data, 22) * GYRO_SCALE,
    );

    let elements = Events::from_bits_retain(u16::from_le_bytes([data[24], data[25]]));

    Ok(NodeSample {
        time_ms,
        rotation: Quat::from_xyzw(qx, qy, qz, qw),
        acceleration,
        angular_velocity,
        elements,
        touch: Vec2::new(axis_from_u8(data[26]), axis_from_u8(data[27])),
        trigger: data[28] as f32 / 255.0,
        charge: data[29].min(100),
    })
}

/// Encode a sample in the report layout. Used by simulated transports.
pub fn encode_report(sample: &NodeSample) -> [u8; REPORT_SIZE] {
    let mut buf = [0u8; REPORT_SIZE];
    buf[0..4].copy_from_slice(&(sample.time_ms as u32).to_le_bytes());

    let q = sample.rotation;
    write_i16(&mut buf, 4, q.w / QUAT_SCALE);
    write_i16(&mut buf, 6, q.x / QUAT_SCALE);
    write_i16(&mut buf, 8, q.y / QUAT_SCALE);
    write_i16(&mut buf, 10, q.z / QUAT_SCALE);

    let a = sample.acceleration;
    write_i16(&mut buf, 12, a.x / ACCEL_SCALE);
    write_i16(&mut buf, 14, a.y / ACCEL_SCALE);
    write_i16(&mut buf, 16, a.z / ACCEL_SCALE);

    let g = sample.angular_velocity;
    write_i16(&mut buf, 18, g.x / GYRO_SCALE);
    write_i16(&mut buf, 20, g.y / GYRO_SCALE);
    write_i16(&mut buf, 22, g.z / GYRO_SCALE);

    buf[24..26].copy_from_slice(&sample.elements.bits().to_le_bytes());
    buf[26] = axis_to_u8(sample.touch.x);
    buf[27] = axis_to_u8(sample.touch.y);
    buf[28] = (sample.trigger.clamp(0.0, 1.0) * 255.0).round() as u8;
    buf[29] = sample.charge.min(100);
    buf
}

/// True when the orientation is usable: finite and close to unit length.
pub fn is_sample_correct(sample: &NodeSample) -> bool {
    let q = sample.rotation;
    q.is_finite()
        && (q.length() - 1.0).abs() <= NORM_TOLERANCE
        && sample.acceleration.is_finite()
        && sample.angular_velocity.is_finite()
}

fn haptic_time(ms: f32) -> u8 {
    (ms.clamp(HAPTIC_MIN_MS, HAPTIC_MAX_MS) * 0.1) as u8
}

/// Build a single vibration command: [duration / 10ms, speed].
pub fn build_haptic_pulse(ms: u16) -> [u8; 2] {
    [haptic_time(ms as f32), HAPTIC_DEFAULT_SPEED]
}

/// One step of a vibration pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VibrationStep {
    /// Duration in milliseconds.
    pub time_ms: f32,
    /// Motor speed in [-1..1].
    pub speed: f32,
}

/// Build a vibration pattern command of up to 10 steps.
pub fn build_haptic_pattern(pattern: &[VibrationStep]) -> Result<Vec<u8>> {
    if pattern.len() > HAPTIC_MAX_STEPS {
        return Err(FinchError::illegal(format!(
            "vibration pattern has {} steps, at most {} allowed",
            pattern.len(),
            HAPTIC_MAX_STEPS
        )));
    }
    let mut package = Vec::with_capacity(pattern.len() * 2);
    for step in pattern {
        package.push(haptic_time(step.time_ms));
        package.push((step.speed.clamp(-1.0, 1.0) * 50.0) as i8 as u8);
    }
    Ok(package)
}

/// Build the LED on/off command.
pub fn build_led_state(on: bool) -> [u8; 3] {
    [0, CMD_LED, if on { LED_ON } else { LED_OFF }]
}

/// Build the LED chirality command.
pub fn build_led_chirality(left: bool) -> [u8; 2] {
    [0, if left { CMD_LED_LEFT } else { CMD_LED_RIGHT }]
}
