//! Port arrival and removal notifications.
//!
//! There is no portable hotplug API for serial ports, so [`PortWatcher`]
//! polls enumeration and broadcasts the differences.

use std::time::Duration;

use log::{debug, trace};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{DetectedPort, detect_ports};

/// Default enumeration poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 32;

/// A port appeared or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new port is available.
    Connected(DetectedPort),
    /// A port with this name went away.
    Disconnected(String),
}

/// Events that turn `previous` into `current`. Removals come first.
pub fn diff_ports(previous: &[DetectedPort], current: &[DetectedPort]) -> Vec<ConnectionEvent> {
    let removed = previous
        .iter()
        .filter(|old| {
            !current
                .iter()
                .any(|new| new.name == old.name)
        })
        .map(|old| ConnectionEvent::Disconnected(old.name.clone()));
    let added = current
        .iter()
        .filter(|new| {
            !previous
                .iter()
                .any(|old| old.name == new.name)
        })
        .map(|new| ConnectionEvent::Connected(new.clone()));
    removed
        .chain(added)
        .collect()
}

/// Background poller that broadcasts [`ConnectionEvent`]s.
///
/// Dropping the watcher stops polling. Dropping a receiver unsubscribes it.
pub struct PortWatcher {
    events: broadcast::Sender<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl PortWatcher {
    /// Watch the system's serial ports.
    pub fn spawn(interval: Duration) -> Self {
        Self::spawn_with(interval, detect_ports)
    }

    /// Watch the ports returned by `enumerate`.
    ///
    /// The first enumeration is the baseline and produces no events.
    pub fn spawn_with<F>(interval: Duration, enumerate: F) -> Self
    where
        F: Fn() -> Vec<DetectedPort> + Send + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sender = events.clone();

        let task = tokio::spawn(async move {
            let mut known = enumerate();
            trace!("Watching {} ports", known.len());
            loop {
                tokio::time::sleep(interval).await;
                let current = enumerate();
                for event in diff_ports(&known, &current) {
                    debug!("Port event: {event:?}");
                    // No subscribers is fine.
                    let _ = sender.send(event);
                }
                known = current;
            }
        });

        Self { events, task }
    }

    /// Receive future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events
            .subscribe()
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.task
            .abort();
    }
}

/// Wait until the port called `name` disappears.
///
/// Returns `false` if the watcher went away first.
pub async fn wait_for_removal(events: &mut broadcast::Receiver<ConnectionEvent>, name: &str) -> bool {
    loop {
        match events
            .recv()
            .await
        {
            Ok(ConnectionEvent::Disconnected(gone)) if gone == name => return true,
            Ok(_) => {},
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Missed {skipped} port events");
            },
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
