use crate::transport::{Advertisement, Transport};
use crate::types::{ScanResult, ScannerType};
use crate::{FinchError, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parameters of one scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanRequest {
    pub scanner: ScannerType,
    pub duration: Duration,
    pub rssi_threshold: i8,
    pub interval: Duration,
}

/// Handle to a running (or finished) discovery worker.
///
/// The worker only discovers; connecting happens on the session thread as
/// candidates are drained from the channel.
pub(crate) struct Scan {
    receiver: Receiver<Advertisement>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    pub auto_connect: bool,
    /// Slots filled while this scan was live.
    pub filled: ScanResult,
}

impl Scan {
    pub fn start(
        transport: Arc<dyn Transport>,
        request: ScanRequest,
        auto_connect: bool,
    ) -> Result<Scan> {
        let (sender, receiver) = crossbeam_channel::bounded(64);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name("finch-scan".into())
            .spawn(move || {
                scan_loop(transport, request, sender, stop_clone);
            })
            .map_err(|e| FinchError::transport(format!("Failed to spawn scan thread: {}", e)))?;

        Ok(Scan {
            receiver,
            stop_flag,
            thread: Some(thread),
            auto_connect,
            filled: ScanResult::empty(),
        })
    }

    /// Candidates found since the last drain, in discovery order.
    pub fn drain(&self) -> Vec<Advertisement> {
        self.receiver.try_iter().collect()
    }

    /// The worker has reached its deadline or was stopped.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs in the scan thread until the deadline or the stop flag.
fn scan_loop(
    transport: Arc<dyn Transport>,
    request: ScanRequest,
    sender: Sender<Advertisement>,
    stop_flag: Arc<AtomicBool>,
) {
    let deadline = Instant::now() + request.duration;
    let mut seen: HashSet<String> = HashSet::new();

    log::info!(
        "Scan started ({:?}, {:?}, rssi >= {})",
        request.scanner,
        request.duration,
        request.rssi_threshold
    );

    'scan: loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::info!("Scan stopping (stop flag set)");
            break;
        }

        match transport.discover(request.scanner) {
            Ok(mut found) => {
                found.retain(|a| {
                    a.visible_to(request.scanner)
                        && a.passes_rssi(request.rssi_threshold)
                        && !seen.contains(&a.address)
                });
                // Stable, so the transport's own order survives within a priority.
                found.sort_by_key(|a| a.priority(request.scanner));
                for adv in found {
                    log::debug!("Scan found {} ({}) rssi={:?}", adv.name, adv.address, adv.rssi);
                    let address = adv.address.clone();
                    match sender.try_send(adv) {
                        Ok(()) => {
                            seen.insert(address);
                        }
                        // Not marked as seen, so the next pass offers it again.
                        Err(TrySendError::Full(_)) => {
                            log::trace!("Scan channel full, deferring {}", address);
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            log::info!("Scan channel disconnected, stopping worker");
                            break 'scan;
                        }
                    }
                }
            }
            Err(e) => log::warn!("Discovery failed: {}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        // Sleep in slices so the stop flag stays responsive.
        let mut remaining = request.interval.min(deadline - now);
        while !remaining.is_zero() {
            if stop_flag.load(Ordering::Relaxed) {
                break;
            }
            let slice = remaining.min(Duration::from_millis(10));
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }

    log::info!("Scan finished, {} candidate(s)", seen.len());
}
