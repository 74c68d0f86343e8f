//! Single-writer status stream for an install run.
//!
//! Stage, progress and message updates arrive from several producers: the
//! orchestrator itself and callbacks fired by collaborators on their own
//! tasks. They are all queued onto one channel and applied by one writer
//! task in submission order, which owns the current `(stage, progress)`
//! pair and is the only caller of the delegate.
//!
//! Rules the writer enforces:
//!
//! - a stage equal to the current one is ignored
//! - a stage that has already been left is never re-entered. A label of the
//!   form `Group: detail` belongs to `Group`, and details may come back as
//!   long as the group has not been left (`Installing: Verifying` after
//!   `Installing: Copying` is fine)
//! - progress never moves backward within a stage, and repeats are dropped
//! - after cancellation, stage and progress updates are dropped (messages
//!   still go through so a presented message can be cleared)

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::collaborators::{InstallDelegate, InstallMessage};

enum Command {
    Stage {
        name: String,
        progress: Option<f64>,
    },
    Progress(Option<f64>),
    /// Switch to `stage` if needed, then report `progress`.
    Report {
        stage: String,
        progress: Option<f64>,
    },
    Message(Option<InstallMessage>),
    Flush(oneshot::Sender<()>),
}

/// Producer handle onto the status queue. Cheap to clone.
#[derive(Clone)]
pub struct StatusSink {
    tx: mpsc::UnboundedSender<Command>,
    stage_set: Arc<AtomicBool>,
}

impl StatusSink {
    /// Switch stage, starting at `progress`.
    pub fn set_stage(&self, name: impl Into<String>, progress: Option<f64>) {
        self.stage_set.store(true, Ordering::SeqCst);
        self.send(Command::Stage {
            name: name.into(),
            progress,
        });
    }

    /// Report progress within the current stage.
    ///
    /// # Panics
    ///
    /// If no stage has been set yet. That is a bug in whoever reports.
    pub fn set_progress(&self, progress: Option<f64>) {
        assert!(
            self.stage_set.load(Ordering::SeqCst),
            "progress reported before any stage was set"
        );
        self.send(Command::Progress(progress));
    }

    /// Stage and progress in one update.
    pub fn report(&self, stage: impl Into<String>, progress: Option<f64>) {
        self.stage_set.store(true, Ordering::SeqCst);
        self.send(Command::Report {
            stage: stage.into(),
            progress,
        });
    }

    pub fn set_message(&self, message: Option<InstallMessage>) {
        self.send(Command::Message(message));
    }

    /// Wait until everything queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx));
        let _ = rx.await;
    }

    fn send(&self, command: Command) {
        // The writer only goes away once every sink is gone
        let _ = self.tx.send(command);
    }
}

/// Owns the writer task of one run.
pub struct StatusQueue {
    sink: StatusSink,
    writer: JoinHandle<()>,
}

impl StatusQueue {
    pub fn start(delegate: Arc<dyn InstallDelegate>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(
            StatusWriter {
                delegate,
                cancel,
                stage: None,
                progress: None,
                left: HashSet::new(),
            }
            .run(rx),
        );
        Self {
            sink: StatusSink {
                tx,
                stage_set: Arc::new(AtomicBool::new(false)),
            },
            writer,
        }
    }

    pub fn sink(&self) -> StatusSink {
        self.sink.clone()
    }

    /// Apply everything queued so far, then let the writer run down once the
    /// remaining sinks are dropped.
    pub async fn finish(self) {
        self.sink.flush().await;
        drop(self.sink);
        drop(self.writer);
    }
}

struct StatusWriter {
    delegate: Arc<dyn InstallDelegate>,
    cancel: CancellationToken,
    stage: Option<String>,
    progress: Option<f64>,
    /// Stage groups already moved past.
    left: HashSet<String>,
}

/// `Installing` for `Installing: Verifying`, the label itself otherwise.
fn stage_group(name: &str) -> &str {
    name.split_once(": ").map_or(name, |(group, _)| group)
}

impl StatusWriter {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Stage { name, progress } => self.apply_stage(name, progress),
                Command::Progress(progress) => self.apply_progress(progress),
                Command::Report { stage, progress } => {
                    if self.stage.as_deref() == Some(stage.as_str()) {
                        self.apply_progress(progress);
                    } else {
                        self.apply_stage(stage, progress);
                    }
                }
                Command::Message(message) => self.delegate.set_presented_message(message),
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    fn apply_stage(&mut self, name: String, progress: Option<f64>) {
        if self.cancel.is_cancelled() || self.stage.as_deref() == Some(name.as_str()) {
            return;
        }
        if self.left.contains(stage_group(&name)) {
            trace!(stage = %name, "Dropping update for a finished stage");
            return;
        }
        trace!(stage = %name, ?progress, "Stage");
        self.delegate.on_stage_progress(&name, progress);
        if let Some(previous) = self.stage.replace(name) {
            let group = stage_group(&previous);
            if Some(group) != self.stage.as_deref().map(stage_group) {
                self.left.insert(group.to_string());
            }
        }
        self.progress = progress;
    }

    fn apply_progress(&mut self, progress: Option<f64>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(stage) = &self.stage else {
            return;
        };
        let stale = match (self.progress, progress) {
            (Some(current), Some(next)) => next <= current,
            // Indeterminate after a known position would also be a step back
            (Some(_), None) => true,
            (None, None) => true,
            (None, Some(_)) => false,
        };
        if stale {
            trace!(stage = %stage, ?progress, "Dropping stale progress");
            return;
        }
        self.delegate.on_stage_progress(stage, progress);
        self.progress = progress;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(String, Option<f64>)>>,
        messages: Mutex<Vec<Option<InstallMessage>>>,
    }

    #[async_trait]
    impl InstallDelegate for Recorder {
        fn set_presented_message(&self, message: Option<InstallMessage>) {
            self.messages.lock().unwrap().push(message);
        }

        fn on_stage_progress(&self, stage: &str, progress: Option<f64>) {
            self.updates
                .lock()
                .unwrap()
                .push((stage.to_string(), progress));
        }
    }

    fn updates(recorder: &Recorder) -> Vec<(String, Option<f64>)> {
        recorder.updates.lock().unwrap().clone()
    }

    fn entry(stage: &str, progress: Option<f64>) -> (String, Option<f64>) {
        (stage.to_string(), progress)
    }

    /// `seen` keeps the relative order of `submitted`.
    fn assert_subsequence(seen: &[(String, Option<f64>)], submitted: &[(String, Option<f64>)]) {
        let mut rest = submitted.iter();
        for update in seen {
            assert!(
                rest.any(|s| s == update),
                "{:?} out of submission order in {:?}",
                update,
                seen
            );
        }
    }

    /// Within a stage, known progress never decreases.
    fn assert_monotonic(updates: &[(String, Option<f64>)]) {
        for pair in updates.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.0 == b.0 {
                if let (Some(x), Some(y)) = (a.1, b.1) {
                    assert!(y >= x, "progress went backward: {:?} -> {:?}", a, b);
                }
                assert!(!(a.1.is_some() && b.1.is_none()), "{:?} -> {:?}", a, b);
            }
        }
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[tokio::test]
    async fn applies_in_submission_order_and_drops_backward_progress() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());
        let sink = queue.sink();

        sink.report("A", Some(0.2));
        sink.report("A", Some(0.5));
        sink.report("A", Some(0.3));
        sink.report("B", None);
        queue.finish().await;

        assert_eq!(
            updates(&recorder),
            vec![entry("A", Some(0.2)), entry("A", Some(0.5)), entry("B", None)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_producers_yield_a_monotonic_stream() {
        for _ in 0..50 {
            let recorder = Arc::new(Recorder::default());
            let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());

            let first = queue.sink();
            let second = queue.sink();
            let a = tokio::spawn(async move {
                first.report("A", Some(0.2));
                tokio::task::yield_now().await;
                first.report("A", Some(0.5));
                tokio::task::yield_now().await;
                first.report("B", None);
            });
            let b = tokio::spawn(async move {
                tokio::task::yield_now().await;
                second.report("A", Some(0.3));
            });
            a.await.unwrap();
            b.await.unwrap();
            queue.finish().await;

            let seen = updates(&recorder);
            assert_monotonic(&seen);
            assert_eq!(seen.first().map(|u| u.0.as_str()), Some("A"));
            assert_eq!(seen.last(), Some(&entry("B", None)));
            // Each producer's updates keep their own order
            let from_first: Vec<_> = seen
                .iter()
                .filter(|u| **u != entry("A", Some(0.3)))
                .cloned()
                .collect();
            assert_subsequence(
                &from_first,
                &[entry("A", Some(0.2)), entry("A", Some(0.5)), entry("B", None)],
            );
            // Once B shows up, A never comes back.
            let at = seen.iter().position(|u| u.0 == "B").unwrap();
            assert!(seen[..at].iter().all(|u| u.0 == "A"));
            assert_eq!(at, seen.len() - 1);
        }
    }

    // =========================================================================
    // Stage rules
    // =========================================================================

    #[tokio::test]
    async fn repeated_stage_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());
        let sink = queue.sink();

        sink.set_stage("Signing", Some(0.0));
        sink.set_progress(Some(0.4));
        sink.set_stage("Signing", Some(0.0));
        sink.set_stage("Packaging", None);
        queue.finish().await;

        assert_eq!(
            updates(&recorder),
            vec![
                entry("Signing", Some(0.0)),
                entry("Signing", Some(0.4)),
                entry("Packaging", None),
            ]
        );
    }

    #[tokio::test]
    async fn finished_stage_is_not_reentered() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());
        let sink = queue.sink();

        sink.report("A", Some(0.2));
        sink.report("B", None);
        sink.report("A", Some(0.3));
        queue.finish().await;

        assert_eq!(updates(&recorder), vec![entry("A", Some(0.2)), entry("B", None)]);
    }

    #[tokio::test]
    async fn details_of_the_current_group_may_repeat() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());
        let sink = queue.sink();

        sink.report("Uploading", Some(1.0));
        sink.report("Installing: Verifying", Some(0.2));
        sink.report("Installing: Copying", Some(0.4));
        sink.report("Installing: Verifying", Some(0.6));
        sink.report("Uploading", Some(1.0));
        queue.finish().await;

        assert_eq!(
            updates(&recorder),
            vec![
                entry("Uploading", Some(1.0)),
                entry("Installing: Verifying", Some(0.2)),
                entry("Installing: Copying", Some(0.4)),
                entry("Installing: Verifying", Some(0.6)),
            ]
        );
    }

    #[test]
    fn stage_group_is_the_label_prefix() {
        assert_eq!(stage_group("Installing: Verifying"), "Installing");
        assert_eq!(stage_group("Unpacking app"), "Unpacking app");
    }

    #[tokio::test]
    async fn stage_change_resets_progress() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());
        let sink = queue.sink();

        sink.set_stage("Uploading", Some(0.0));
        sink.set_progress(Some(0.9));
        sink.set_stage("Installing", Some(0.0));
        sink.set_progress(Some(0.1));
        queue.finish().await;

        assert_eq!(updates(&recorder).last(), Some(&entry("Installing", Some(0.1))));
    }

    #[tokio::test]
    async fn unchanged_progress_is_not_repeated() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder.clone(), CancellationToken::new());
        let sink = queue.sink();

        sink.set_stage("Unpacking app", None);
        sink.set_progress(None);
        sink.set_progress(Some(1.0));
        sink.set_progress(Some(1.0));
        queue.finish().await;

        assert_eq!(
            updates(&recorder),
            vec![entry("Unpacking app", None), entry("Unpacking app", Some(1.0))]
        );
    }

    #[tokio::test]
    #[should_panic(expected = "progress reported before any stage was set")]
    async fn progress_before_stage_panics() {
        let recorder = Arc::new(Recorder::default());
        let queue = StatusQueue::start(recorder, CancellationToken::new());
        queue.sink().set_progress(Some(0.5));
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[tokio::test]
    async fn cancellation_silences_stage_updates_but_not_messages() {
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let queue = StatusQueue::start(recorder.clone(), cancel.clone());
        let sink = queue.sink();

        sink.set_stage("Provisioning", None);
        sink.set_message(Some(InstallMessage::PairDevice));
        sink.flush().await;

        cancel.cancel();
        sink.set_progress(Some(0.5));
        sink.set_stage("Signing", None);
        sink.set_message(None);
        queue.finish().await;

        assert_eq!(updates(&recorder), vec![entry("Provisioning", None)]);
        assert_eq!(
            *recorder.messages.lock().unwrap(),
            vec![Some(InstallMessage::PairDevice), None]
        );
    }
}
