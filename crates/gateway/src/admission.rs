use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of one admission attempt. `release` must be called exactly once
/// for every attempt, admitted or not.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Admission {
    /// Strictly increasing attempt number, never reused.
    pub(crate) seq: u64,
    /// Live-connection count after this attempt was counted.
    pub(crate) live: i64,
    pub(crate) admitted: bool,
}

/// Gates new sessions against the concurrency ceiling and single-shot mode,
/// and owns the idle-shutdown watchdog. The counter and the single-shot slot
/// are plain atomics; the shutdown latch is a `CancellationToken` shared with
/// every session task and the HTTP server.
pub(crate) struct AdmissionController {
    live: AtomicI64,
    seq: AtomicU64,
    once_slot: AtomicBool,
    max_connections: i64,
    shutdown: CancellationToken,
    /// Cancelled on the first successful admission; disarms the watchdog.
    watchdog_disarm: CancellationToken,
}

impl AdmissionController {
    pub(crate) fn new(max_connections: i64, shutdown: CancellationToken) -> Self {
        Self {
            live: AtomicI64::new(0),
            seq: AtomicU64::new(0),
            once_slot: AtomicBool::new(false),
            max_connections,
            shutdown,
            watchdog_disarm: CancellationToken::new(),
        }
    }

    /// Counts the attempt and decides admission against the ceiling
    /// (0 = unlimited). The attempt stays counted even when refused; the
    /// caller's cleanup path balances it with `release`.
    pub(crate) fn admit(&self) -> Admission {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        let admitted = self.max_connections == 0 || live <= self.max_connections;
        if admitted {
            self.watchdog_disarm.cancel();
        }
        Admission {
            seq,
            live,
            admitted,
        }
    }

    pub(crate) fn release(&self) -> i64 {
        self.live.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn max_connections(&self) -> i64 {
        self.max_connections
    }

    /// Single-shot mode: true for exactly one caller across the process
    /// lifetime.
    pub(crate) fn try_consume_single_shot_slot(&self) -> bool {
        self.once_slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the idle watchdog: if no session is ever admitted before the
    /// deadline elapses, the gateway shuts down. The deadline, the external
    /// shutdown signal, and the first admission race; whichever fires first
    /// wins and the others become no-ops.
    pub(crate) fn spawn_watchdog(self: &Arc<Self>, idle_timeout: Duration) {
        if idle_timeout.is_zero() {
            return;
        }
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(idle_timeout) => {
                    info!(
                        idle_timeout_secs = idle_timeout.as_secs(),
                        "no session admitted before the idle deadline, shutting down"
                    );
                    controller.shutdown.cancel();
                }
                _ = controller.shutdown.cancelled() => {}
                _ = controller.watchdog_disarm.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_connections: i64) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(
            max_connections,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn ceiling_of_one_admits_exactly_one() {
        let controller = controller(1);
        let first = controller.admit();
        let second = controller.admit();
        assert!(first.admitted);
        assert!(!second.admitted);

        // rejected attempt still releases on its cleanup path
        assert_eq!(controller.release(), 1);
        // admitted session closes
        assert_eq!(controller.release(), 0);

        let third = controller.admit();
        assert!(third.admitted);
        assert_eq!(third.live, 1);
    }

    #[test]
    fn zero_ceiling_is_unlimited() {
        let controller = controller(0);
        for _ in 0..64 {
            assert!(controller.admit().admitted);
        }
    }

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let controller = controller(0);
        let a = controller.admit();
        controller.release();
        let b = controller.admit();
        controller.release();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(b.live, 1);
    }

    #[test]
    fn single_shot_slot_has_exactly_one_winner() {
        let controller = controller(0);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = Arc::clone(&controller);
            handles.push(std::thread::spawn(move || {
                controller.try_consume_single_shot_slot()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(|result| matches!(result, Ok(true)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn watchdog_fires_when_nothing_is_admitted() {
        let controller = controller(0);
        controller.spawn_watchdog(Duration::from_millis(20));
        let fired = tokio::time::timeout(
            Duration::from_secs(2),
            controller.shutdown_token().cancelled(),
        )
        .await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn watchdog_is_disarmed_by_a_successful_admission() {
        let controller = controller(0);
        controller.spawn_watchdog(Duration::from_millis(30));
        assert!(controller.admit().admitted);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!controller.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn zero_idle_timeout_disables_the_watchdog() {
        let controller = controller(0);
        controller.spawn_watchdog(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!controller.shutdown_token().is_cancelled());
    }
}
