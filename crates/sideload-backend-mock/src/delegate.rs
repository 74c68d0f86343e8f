use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sideload_core::install::{Certificate, InstallDelegate, InstallMessage};

/// One call the orchestrator made on the delegate.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateEvent {
    Stage(String, Option<f64>),
    Message(Option<InstallMessage>),
}

/// Delegate that records every call for later inspection.
#[derive(Clone)]
pub struct RecordingDelegate {
    events: Arc<Mutex<Vec<DelegateEvent>>>,
    allow_revocation: Arc<AtomicBool>,
    revocation_prompts: Arc<AtomicUsize>,
}

impl Default for RecordingDelegate {
    fn default() -> Self {
        Self {
            events: Arc::default(),
            allow_revocation: Arc::new(AtomicBool::new(true)),
            revocation_prompts: Arc::default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer revocation prompts with `allow`.
    pub fn allowing_revocation(self, allow: bool) -> Self {
        self.allow_revocation.store(allow, Ordering::SeqCst);
        self
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        lock(&self.events).clone()
    }

    /// Stage updates only, in delivery order.
    pub fn stages(&self) -> Vec<(String, Option<f64>)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                DelegateEvent::Stage(name, progress) => Some((name.clone(), *progress)),
                DelegateEvent::Message(_) => None,
            })
            .collect()
    }

    /// Distinct stage names in the order they were entered.
    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, _) in self.stages() {
            if names.last() != Some(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn messages(&self) -> Vec<Option<InstallMessage>> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                DelegateEvent::Message(message) => Some(*message),
                DelegateEvent::Stage(..) => None,
            })
            .collect()
    }

    pub fn revocation_prompts(&self) -> usize {
        self.revocation_prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstallDelegate for RecordingDelegate {
    fn set_presented_message(&self, message: Option<InstallMessage>) {
        lock(&self.events).push(DelegateEvent::Message(message));
    }

    fn on_stage_progress(&self, stage: &str, progress: Option<f64>) {
        lock(&self.events).push(DelegateEvent::Stage(stage.to_string(), progress));
    }

    async fn confirm_revocation(&self, _certificates: &[Certificate]) -> bool {
        self.revocation_prompts.fetch_add(1, Ordering::SeqCst);
        self.allow_revocation.load(Ordering::SeqCst)
    }
}
