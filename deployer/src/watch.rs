// deployer/src/watch.rs
use crate::deployment::StatusEvent;
use crate::registry::DeploymentEntry;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::watch;

struct Cursor {
    entry: Arc<DeploymentEntry>,
    signal: watch::Receiver<usize>,
    next: usize,
    done: bool,
}

/// Lazy, finite stream of a deployment's status events.
///
/// Starts at the most recent event and ends right after the first terminal
/// one, so a watch opened on a finished deployment yields exactly its final
/// event. The stream only suspends while waiting for the next event; drop it
/// to stop watching.
pub fn events(entry: Arc<DeploymentEntry>) -> impl Stream<Item = StatusEvent> + Send + 'static {
    // Subscribe before reading so that no event slips in between.
    let signal = entry.event_signal();
    let next = entry.read(|d| d.events.len().saturating_sub(1));
    let cursor = Cursor {
        entry,
        signal,
        next,
        done: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return None;
        }
        loop {
            let index = cursor.next;
            if let Some(event) = cursor.entry.read(|d| d.events.get(index).cloned()) {
                cursor.next += 1;
                cursor.done = event.status.is_terminal();
                return Some((event, cursor));
            }
            if cursor.signal.changed().await.is_err() {
                return None;
            }
        }
    })
}
