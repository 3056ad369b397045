use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::error::{InstallError, InstallResult};
use crate::installer::types::{InstallState, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Overrides,
    Files,
    Dependencies,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Overrides => "overrides",
            Phase::Files => "files",
            Phase::Dependencies => "dependencies",
        }
    }
}

/// Events emitted by the pipeline. Producers never wait on consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Counters go back to zero for a new installation
    Reset,
    StateChanged(InstallState),
    PhaseStarted { phase: Phase, total: u32 },
    /// More work was discovered while the phase was running
    PhaseGrown { phase: Phase, added: u32 },
    ItemStarted { phase: Phase, name: String },
    ItemFinished { phase: Phase, name: String },
    Bytes { name: String, transferred: u64, total: Option<u64> },
    Message(String),
    Finished { success: bool, message: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounter {
    pub completed: u32,
    pub total: u32,
    pub current_item: String,
}

/// Snapshot of one installation's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub state: InstallState,
    pub files: PhaseCounter,
    pub dependencies: PhaseCounter,
    pub overrides: PhaseCounter,
}

impl InstallProgress {
    pub fn reset(&mut self) {
        *self = InstallProgress::default();
    }

    pub fn counter(&self, phase: Phase) -> &PhaseCounter {
        match phase {
            Phase::Overrides => &self.overrides,
            Phase::Files => &self.files,
            Phase::Dependencies => &self.dependencies,
        }
    }

    fn counter_mut(&mut self, phase: Phase) -> &mut PhaseCounter {
        match phase {
            Phase::Overrides => &mut self.overrides,
            Phase::Files => &mut self.files,
            Phase::Dependencies => &mut self.dependencies,
        }
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Reset => self.reset(),
            ProgressEvent::StateChanged(state) => self.state = *state,
            ProgressEvent::PhaseStarted { phase, total } => {
                let counter = self.counter_mut(*phase);
                counter.completed = 0;
                counter.total = *total;
                counter.current_item.clear();
            }
            ProgressEvent::PhaseGrown { phase, added } => {
                self.counter_mut(*phase).total += *added;
            }
            ProgressEvent::ItemStarted { phase, name } => {
                self.counter_mut(*phase).current_item = name.clone();
            }
            ProgressEvent::ItemFinished { phase, name } => {
                let counter = self.counter_mut(*phase);
                counter.completed += 1;
                counter.current_item = name.clone();
            }
            ProgressEvent::Bytes { .. }
            | ProgressEvent::Message(_)
            | ProgressEvent::Finished { .. } => {}
        }
    }
}

/// Cheap, cloneable producer side of the progress channel.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    /// A sender whose events go nowhere.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ProgressEvent) {
        // A closed channel only means nobody is watching
        let _ = self.tx.send(event);
    }

    pub fn state(&self, state: InstallState) {
        self.send(ProgressEvent::StateChanged(state));
    }

    pub fn phase_started(&self, phase: Phase, total: usize) {
        self.send(ProgressEvent::PhaseStarted {
            phase,
            total: total as u32,
        });
    }

    pub fn phase_grown(&self, phase: Phase, added: usize) {
        if added > 0 {
            self.send(ProgressEvent::PhaseGrown {
                phase,
                added: added as u32,
            });
        }
    }

    pub fn item_started(&self, phase: Phase, name: impl Into<String>) {
        self.send(ProgressEvent::ItemStarted {
            phase,
            name: name.into(),
        });
    }

    pub fn item_finished(&self, phase: Phase, name: impl Into<String>) {
        self.send(ProgressEvent::ItemFinished {
            phase,
            name: name.into(),
        });
    }

    pub fn bytes(&self, name: &str, transferred: u64, total: Option<u64>) {
        self.send(ProgressEvent::Bytes {
            name: name.to_string(),
            transferred,
            total,
        });
    }

    pub fn message(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Message(message.into()));
    }
}

/// Single consumer of progress events. Owns the shared `InstallProgress`
/// and is its only writer; readers take snapshots.
pub struct ProgressTracker {
    progress: Arc<RwLock<InstallProgress>>,
    sender: ProgressSender,
    task: JoinHandle<()>,
}

impl ProgressTracker {
    /// Spawns the consumer task on the current runtime.
    pub fn new(reporter: Option<Arc<dyn ProgressReporter>>) -> Self {
        let (sender, mut rx) = ProgressSender::channel();
        let progress = Arc::new(RwLock::new(InstallProgress::default()));
        let shared = progress.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot = {
                    let mut guard = shared.write().await;
                    guard.apply(&event);
                    guard.clone()
                };
                if let Some(reporter) = &reporter {
                    forward(reporter.as_ref(), &event, &snapshot);
                }
            }
        });

        Self {
            progress,
            sender,
            task,
        }
    }

    pub fn sender(&self) -> ProgressSender {
        self.sender.clone()
    }

    /// Read-only handle for observers
    pub fn handle(&self) -> Arc<RwLock<InstallProgress>> {
        self.progress.clone()
    }

    pub async fn snapshot(&self) -> InstallProgress {
        self.progress.read().await.clone()
    }

    /// Drains outstanding events once every sender clone is dropped and returns the final state.
    pub async fn finish(self) -> InstallProgress {
        drop(self.sender);
        if let Err(e) = self.task.await {
            log::warn!("Progress consumer task ended abnormally: {}", e);
        }
        let progress = self.progress.read().await.clone();
        progress
    }
}

fn forward(reporter: &dyn ProgressReporter, event: &ProgressEvent, snapshot: &InstallProgress) {
    match event {
        ProgressEvent::Reset => {}
        ProgressEvent::StateChanged(state) => reporter.start_step(state.label(), None),
        ProgressEvent::PhaseStarted { total, .. } => reporter.set_step_count(0, Some(*total)),
        ProgressEvent::PhaseGrown { phase, .. } => {
            let counter = snapshot.counter(*phase);
            reporter.set_step_count(counter.completed, Some(counter.total));
        }
        ProgressEvent::ItemStarted { phase, name } => {
            reporter.set_message(&format!("{}: {}", phase.label(), name))
        }
        ProgressEvent::ItemFinished { phase, .. } => {
            let counter = snapshot.counter(*phase);
            reporter.set_step_count(counter.completed, Some(counter.total));
        }
        ProgressEvent::Bytes {
            transferred, total, ..
        } => reporter.update_bytes(*transferred, *total),
        ProgressEvent::Message(message) => reporter.set_message(message),
        ProgressEvent::Finished { success, message } => reporter.done(*success, message.as_deref()),
    }
}

/// Cancellation token wrapper. Clones observe the same signal.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once the token has tripped.
    pub fn check(&self) -> InstallResult<()> {
        if self.is_cancelled() {
            Err(InstallError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token trips.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
