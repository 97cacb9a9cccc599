//! Connected-call duration timer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::session::CallEvent;

const TICK: Duration = Duration::from_secs(1);

/// Counts whole seconds since the media path came up.
///
/// The tick task exits on its own once the session epoch moves past the
/// value it was started under.
pub struct CallTimer {
    elapsed: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl CallTimer {
    pub fn start(events: mpsc::UnboundedSender<CallEvent>, mut epoch: watch::Receiver<u64>) -> Self {
        let elapsed = Arc::new(AtomicU64::new(0));
        let started_under = *epoch.borrow_and_update();

        let counter = Arc::clone(&elapsed);
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + TICK, TICK);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = epoch.changed() => {
                        if changed.is_err() || *epoch.borrow() != started_under {
                            break;
                        }
                    }
                    _ = ticks.tick() => {
                        let seconds = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if events.send(CallEvent::Duration(seconds)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            elapsed,
            task: Some(task),
        }
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.elapsed.store(0, Ordering::SeqCst);
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// `MM:SS`, or `HH:MM:SS` from the first hour on.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
