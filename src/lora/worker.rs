//! Transmit worker: runs a transmit cycle each time the transmit gate fires.
//!
//! The controller is moved into the blocking task for the duration of a
//! cycle and moved back afterwards, so it keeps exactly one owner and needs no
//! lock. If a cycle could not re-arm receive, the worker keeps retrying with
//! a bounded backoff until receive is back or the device is gone.

use super::controller::RadioController;
use super::device::RadioDevice;
use crate::signal::SignalGate;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// First delay before re-arming receive after a failure.
pub const RESUME_BACKOFF_MIN: Duration = Duration::from_millis(50);

/// Longest delay between receive re-arm attempts.
pub const RESUME_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Totals across the worker's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransmitSummary {
    pub cycles: u64,
    pub failures: u64,
    /// Receive re-arm attempts made outside a transmit cycle.
    pub resume_attempts: u64,
}

enum Wake {
    Cancelled,
    Transmit,
    Resume,
}

/// Run `op` on the blocking pool with the controller, then hand it back.
async fn with_controller<D, T, F>(
    mut controller: RadioController<D>,
    op: F,
) -> Result<(RadioController<D>, T), JoinError>
where
    D: RadioDevice + 'static,
    T: Send + 'static,
    F: FnOnce(&mut RadioController<D>) -> T + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let result = op(&mut controller);
        (controller, result)
    })
    .await;
    if let Err(e) = &result {
        error!("LoRa TX task panicked: {}", e);
    }
    result
}

/// Run until `cancel` fires, then hand the controller back.
///
/// Signals raised while a cycle is in progress collapse into one further
/// cycle. Cycle failures are logged and the loop keeps going; only a panic in
/// the blocking task ends it early.
pub async fn run_transmit_loop<D: RadioDevice + 'static>(
    mut controller: RadioController<D>,
    gate: Arc<SignalGate>,
    payload: Vec<u8>,
    cancel: CancellationToken,
) -> Result<(RadioController<D>, TransmitSummary), JoinError> {
    let mut summary = TransmitSummary::default();
    let payload: Arc<[u8]> = payload.into();
    let mut backoff = RESUME_BACKOFF_MIN;
    let mut radio_lost = false;
    info!("Transmit worker started ({} byte payload)", payload.len());

    loop {
        let wake = if controller.is_receive_parked() && !radio_lost {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = gate.wait() => Wake::Transmit,
                _ = tokio::time::sleep(backoff) => Wake::Resume,
            }
        } else if gate.wait_cancellable(&cancel).await {
            Wake::Transmit
        } else {
            Wake::Cancelled
        };

        match wake {
            Wake::Cancelled => break,
            Wake::Resume => {
                summary.resume_attempts += 1;
                let (returned, result) =
                    with_controller(controller, |c| c.resume_receive()).await?;
                controller = returned;
                match result {
                    Ok(()) => {
                        info!("Reception restored");
                        backoff = RESUME_BACKOFF_MIN;
                    }
                    Err(e) if e.is_fatal() => {
                        error!("Radio unusable, giving up on reception: {}", e);
                        radio_lost = true;
                    }
                    Err(e) => {
                        backoff = (backoff * 2).min(RESUME_BACKOFF_MAX);
                        warn!("Receive still not restored, retrying in {:?}: {}", backoff, e);
                    }
                }
            }
            Wake::Transmit => {
                debug!("Transmit requested");
                let cycle_payload = payload.clone();
                let (returned, cycle) = with_controller(controller, move |c| {
                    if !c.is_receiving() {
                        // A previous cycle could not restore receive.
                        if let Err(e) = c.resume_receive() {
                            warn!("Receive still not restored: {}", e);
                        }
                    }
                    c.transmit_cycle(&cycle_payload)
                })
                .await?;
                controller = returned;
                summary.cycles += 1;
                if controller.is_receiving() {
                    backoff = RESUME_BACKOFF_MIN;
                }
                if let Err(e) = cycle {
                    summary.failures += 1;
                    if e.is_fatal() {
                        error!("Radio unusable: {}", e);
                    }
                }
            }
        }
    }

    info!(
        "Transmit worker stopped after {} cycles ({} failed)",
        summary.cycles, summary.failures
    );
    Ok((controller, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::config::{Direction, RadioConfig};
    use crate::lora::controller::RadioState;
    use crate::lora::device::RxEvent;
    use crate::lora::loopback::{LoopbackHandle, LoopbackRadio, RadioCall};

    const PAYLOAD: &[u8] = b"Chevy LS1 5.7L";

    fn receiving() -> (RadioController<LoopbackRadio>, LoopbackHandle) {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();
        controller.start_receive(|_: RxEvent<'_>| {}).unwrap();
        (controller, handle)
    }

    async fn wait_for_sends(handle: &LoopbackHandle, count: usize) {
        for _ in 0..400 {
            if handle.sent().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} sends, saw {}", count, handle.sent().len());
    }

    #[tokio::test]
    async fn test_multiple_signals_give_one_cycle() {
        let (controller, handle) = receiving();
        let gate = Arc::new(SignalGate::new("tx"));
        let cancel = CancellationToken::new();

        gate.signal();
        gate.signal();
        gate.signal();

        let worker = tokio::spawn(run_transmit_loop(
            controller,
            gate.clone(),
            PAYLOAD.to_vec(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let (controller, summary) = worker.await.unwrap().unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(handle.sent(), vec![PAYLOAD.to_vec()]);
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.is_receiving());
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_worker_running() {
        let (controller, handle) = receiving();
        let gate = Arc::new(SignalGate::new("tx"));
        let cancel = CancellationToken::new();
        handle.fail_next_send(-crate::errno::EIO);

        let worker = tokio::spawn(run_transmit_loop(
            controller,
            gate.clone(),
            PAYLOAD.to_vec(),
            cancel.clone(),
        ));

        gate.signal();
        wait_for_sends(&handle, 1).await;
        gate.signal();
        wait_for_sends(&handle, 2).await;
        cancel.cancel();

        let (controller, summary) = worker.await.unwrap().unwrap();
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(handle.sent().len(), 2);
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.violations().is_empty());
    }

    async fn wait_for_receiving(handle: &LoopbackHandle) {
        for _ in 0..400 {
            if handle.is_receiving() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("receive was never restored");
    }

    #[tokio::test]
    async fn test_failed_rearm_is_retried_without_another_press() {
        let (controller, handle) = receiving();
        handle.fail_next_configure(Direction::Receive, -crate::errno::EBUSY);
        let gate = Arc::new(SignalGate::new("tx"));
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_transmit_loop(
            controller,
            gate.clone(),
            PAYLOAD.to_vec(),
            cancel.clone(),
        ));
        gate.signal();
        wait_for_sends(&handle, 1).await;
        wait_for_receiving(&handle).await;
        cancel.cancel();

        let (controller, summary) = worker.await.unwrap().unwrap();
        assert_eq!(gate.signal_count(), 1);
        assert_eq!(summary.cycles, 1);
        assert!(summary.resume_attempts >= 1);
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.violations().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_rearm_failure_stops_retrying() {
        let (controller, handle) = receiving();
        handle.fail_next_configure(Direction::Receive, -crate::errno::ENODEV);
        handle.fail_next_configure(Direction::Receive, -crate::errno::ENODEV);
        let gate = Arc::new(SignalGate::new("tx"));
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_transmit_loop(
            controller,
            gate.clone(),
            PAYLOAD.to_vec(),
            cancel.clone(),
        ));
        gate.signal();
        tokio::time::sleep(RESUME_BACKOFF_MIN * 8).await;
        cancel.cancel();

        let (controller, summary) = worker.await.unwrap().unwrap();
        assert_eq!(summary.resume_attempts, 1);
        assert!(!controller.is_receiving());
        assert!(controller.is_receive_parked());
        let rx_configures = handle
            .calls()
            .iter()
            .filter(|call| **call == RadioCall::Configure(Direction::Receive))
            .count();
        // Initial configure, the cycle's re-arm, one retry.
        assert_eq!(rx_configures, 3);
    }

    #[tokio::test]
    async fn test_worker_restores_receive_before_cycle() {
        let (mut controller, handle) = receiving();
        handle.fail_next_configure(Direction::Receive, -crate::errno::EIO);
        // Left parked and idle by the failed receive configure.
        assert!(controller.transmit_cycle(PAYLOAD).is_ok());
        assert_eq!(controller.state(), RadioState::Idle);

        let gate = Arc::new(SignalGate::new("tx"));
        let cancel = CancellationToken::new();
        gate.signal();
        let worker = tokio::spawn(run_transmit_loop(
            controller,
            gate,
            PAYLOAD.to_vec(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let (controller, summary) = worker.await.unwrap().unwrap();
        assert_eq!(summary.failures, 0);
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.is_receiving());
    }
}
