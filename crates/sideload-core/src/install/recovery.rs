//! Retry loop for operations that wait on the user to act on the device.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::collaborators::InstallMessage;
use super::status::StatusSink;
use crate::error::{DeviceError, InstallError};

/// Clears a presented message when the retry loop exits, however it exits.
struct MessageGuard<'a> {
    status: &'a StatusSink,
    current: Option<InstallMessage>,
}

impl MessageGuard<'_> {
    fn present(&mut self, message: InstallMessage) {
        if self.current != Some(message) {
            self.status.set_message(Some(message));
            self.current = Some(message);
        }
    }
}

impl Drop for MessageGuard<'_> {
    fn drop(&mut self) {
        if self.current.is_some() {
            self.status.set_message(None);
        }
    }
}

/// Run `operation` until it succeeds, retrying every `interval` while the
/// device shows a pairing dialog or is locked.
///
/// Those two errors become messages for the user; anything else ends the
/// loop as a device error tagged with `stage`. Only cancellation bounds the
/// retries.
pub(crate) async fn perform_with_recovery<T, F, Fut>(
    stage: &str,
    status: &StatusSink,
    cancel: &CancellationToken,
    interval: Duration,
    mut operation: F,
) -> Result<T, InstallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeviceError>>,
{
    let mut guard = MessageGuard {
        status,
        current: None,
    };

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            result = operation() => result,
        };

        let message = match result {
            Ok(value) => return Ok(value),
            Err(DeviceError::PairingDialogPending) => InstallMessage::PairDevice,
            Err(DeviceError::PasswordProtected) => InstallMessage::UnlockDevice,
            Err(e) => return Err(InstallError::device(stage, e)),
        };
        debug!(?message, "Waiting for the user");
        guard.present(message);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::collaborators::InstallDelegate;
    use crate::install::status::StatusQueue;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Messages(Mutex<Vec<Option<InstallMessage>>>);

    #[async_trait]
    impl InstallDelegate for Messages {
        fn set_presented_message(&self, message: Option<InstallMessage>) {
            self.0.lock().unwrap().push(message);
        }

        fn on_stage_progress(&self, _stage: &str, _progress: Option<f64>) {}
    }

    fn scripted(
        results: Vec<Result<u32, DeviceError>>,
    ) -> (Arc<Mutex<usize>>, impl FnMut() -> std::future::Ready<Result<u32, DeviceError>>) {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut results: VecDeque<_> = results.into();
        let operation = move || {
            *counter.lock().unwrap() += 1;
            std::future::ready(results.pop_front().unwrap_or(Ok(0)))
        };
        (calls, operation)
    }

    const INTERVAL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn retries_until_trusted_and_clears_message() {
        let delegate = Arc::new(Messages::default());
        let queue = StatusQueue::start(delegate.clone(), CancellationToken::new());
        let (calls, operation) = scripted(vec![
            Err(DeviceError::PairingDialogPending),
            Err(DeviceError::PairingDialogPending),
            Err(DeviceError::PasswordProtected),
            Ok(7),
        ]);

        let value = perform_with_recovery(
            "Preparing device",
            &queue.sink(),
            &CancellationToken::new(),
            INTERVAL,
            operation,
        )
        .await
        .unwrap();
        queue.finish().await;

        assert_eq!(value, 7);
        assert_eq!(*calls.lock().unwrap(), 4);
        assert_eq!(
            *delegate.0.lock().unwrap(),
            vec![
                Some(InstallMessage::PairDevice),
                Some(InstallMessage::UnlockDevice),
                None
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_presents_nothing() {
        let delegate = Arc::new(Messages::default());
        let queue = StatusQueue::start(delegate.clone(), CancellationToken::new());
        let (_, operation) = scripted(vec![Ok(1)]);

        perform_with_recovery("x", &queue.sink(), &CancellationToken::new(), INTERVAL, operation)
            .await
            .unwrap();
        queue.finish().await;

        assert!(delegate.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_end_the_loop_with_stage() {
        let delegate = Arc::new(Messages::default());
        let queue = StatusQueue::start(delegate.clone(), CancellationToken::new());
        let (calls, operation) = scripted(vec![
            Err(DeviceError::PasswordProtected),
            Err(DeviceError::Timeout),
        ]);

        let err = perform_with_recovery(
            "Preparing device",
            &queue.sink(),
            &CancellationToken::new(),
            INTERVAL,
            operation,
        )
        .await
        .unwrap_err();
        queue.finish().await;

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(err.failed_stage(), Some("Preparing device"));
        assert_eq!(
            *delegate.0.lock().unwrap(),
            vec![Some(InstallMessage::UnlockDevice), None]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_endless_retries() {
        let delegate = Arc::new(Messages::default());
        let queue = StatusQueue::start(delegate.clone(), CancellationToken::new());
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let operation = move || {
            *counter.lock().unwrap() += 1;
            std::future::ready(Err::<(), _>(DeviceError::PairingDialogPending))
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = perform_with_recovery("x", &queue.sink(), &cancel, INTERVAL, operation)
            .await
            .unwrap_err();
        queue.finish().await;

        assert!(matches!(err, InstallError::Cancelled));
        assert!(*calls.lock().unwrap() >= 10);
        assert_eq!(delegate.0.lock().unwrap().last(), Some(&None));
    }
}
