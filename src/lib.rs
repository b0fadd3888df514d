//! # finch - core runtime for Finch VR controllers
//!
//! Turns raw orientation reports from up to four body-worn nodes (two hand
//! controllers and two upper-arm trackers) into a calibrated arm and torso
//! pose. Provides:
//! - Node discovery, connection and I/O over a pluggable [`Transport`]
//! - Per-node calibration, recentering and axis calibration
//! - A body model producing bone rotations, positions and their derivatives
//! - A flat C ABI (`Finch*` functions) for Unity/Unreal/native hosts
//!
//! The Rust API speaks [`glam`] types. The `#[repr(C)]` [`Vector3`] and
//! [`Quaternion`] only carry values across the C ABI.
//!
//! ## Quick Start
//! ```no_run
//! use finch::{Chirality, ControllerType, MemoryDevice, MemoryTransport, NodeType, Platform};
//! use finch::{ScannerType, Session, Settings};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! transport.add(MemoryDevice::controller("C0:FF:EE:00:00:01", Chirality::Right));
//!
//! let mut session = Session::with_transport(
//!     ControllerType::Hand,
//!     Platform::Internal,
//!     transport,
//!     Settings::default(),
//! )
//! .unwrap();
//! session.start_scan(ScannerType::Bonded, Duration::from_secs(2), -70, true);
//! for _ in 0..100 {
//!     session.update().unwrap();
//!     if session.is_node_connected(NodeType::RightHand) {
//!         println!("hand: {:?}", session.controller_position(Chirality::Right, true));
//!     }
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! ```

pub mod error;
pub mod types;
pub mod math;
pub mod protocol;
pub mod config;
pub mod transport;
pub mod memory;
#[cfg(feature = "hid")]
pub mod hid;
pub mod skeleton;
pub mod session;
pub mod ffi;

mod node;
mod scan;
mod calibration;

pub use error::FinchError;
pub use types::*;
pub use math::{Basis, QuatExt};
pub use protocol::VibrationStep;
pub use config::Settings;
pub use transport::{Advertisement, NodeLink, NodeRole, NullTransport, Transport};
pub use memory::{MemoryDevice, MemoryTransport};
pub use skeleton::{BodyModel, BoneState, ControllerState, Frame};
pub use session::Session;

/// Math types used throughout the Rust API.
pub use glam;

/// Result type alias for finch operations.
pub type Result<T> = std::result::Result<T, FinchError>;
