//! Scan for nodes, auto-connect them and print the hand positions.
//!
//! Uses the platform transport (`--features hid`), or two simulated
//! controllers with `--simulate`.
//!
//! Usage: cargo run --example scan [-- --simulate]

use finch::glam::{Quat, Vec2, Vec3};
use finch::{
    Chirality, ControllerType, Events, MemoryDevice, MemoryTransport, NodeSample, NodeType,
    Platform, ScannerType, Session, Settings,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn simulated() -> (Session, Vec<MemoryDevice>) {
    let transport = Arc::new(MemoryTransport::new());
    let devices = vec![
        MemoryDevice::controller("C0:FF:EE:00:00:01", Chirality::Right).with_rssi(-45),
        MemoryDevice::controller("C0:FF:EE:00:00:02", Chirality::Left).with_rssi(-52),
    ];
    for d in &devices {
        transport.add(d.clone());
    }
    let session = Session::with_transport(
        ControllerType::Hand,
        Platform::Internal,
        transport,
        Settings::from_env(),
    );
    match session {
        Ok(s) => (s, devices),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();

    let simulate = std::env::args().any(|a| a == "--simulate");
    let (mut session, devices) = if simulate {
        simulated()
    } else {
        match Session::new(ControllerType::Hand, Platform::Internal) {
            Ok(s) => (s, Vec::new()),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    };

    if !session.start_scan(ScannerType::BA, Duration::from_secs(5), -80, true) {
        eprintln!("Scan did not start");
        std::process::exit(1);
    }
    println!("Scanning for 5s...");

    let start = Instant::now();
    let mut frames = 0u64;
    while start.elapsed() < Duration::from_secs(10) {
        let t = start.elapsed().as_secs_f32();
        for (i, d) in devices.iter().enumerate() {
            // Slow wave of the forearm about the vertical axis.
            let yaw = (t + i as f32).sin() * 0.6;
            d.push_sample(&NodeSample {
                time_ms: start.elapsed().as_millis() as u64,
                rotation: Quat::from_rotation_y(yaw),
                acceleration: Vec3::new(0.0, 9.81, 0.0),
                angular_velocity: Vec3::ZERO,
                elements: Events::empty(),
                touch: Vec2::ZERO,
                trigger: 0.0,
                charge: 80,
            });
        }

        if let Err(e) = session.update() {
            eprintln!("Update failed: {}", e);
            break;
        }
        frames += 1;
        if frames % 50 == 0 {
            for side in [Chirality::Right, Chirality::Left] {
                let Some(node) = NodeType::hand(side) else { continue };
                if session.is_node_connected(node) {
                    let p = session.controller_position(side, true);
                    println!(
                        "{:?}: pos=({:.3}, {:.3}, {:.3}) charge={}%",
                        side,
                        p.x,
                        p.y,
                        p.z,
                        session.node_charge(node)
                    );
                }
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let filled = session.stop_scan(true);
    println!("Scan filled {:?}, state {:?}", filled, session.nodes_state());
}
