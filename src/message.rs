//! Broadcast message center.
//!
//! A `Center` fans every sent message out to all subscribed channels from
//! a single forwarding thread. Shutdown is cooperative: a sentinel is
//! broadcast so every consumer sees end-of-stream after the final message.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{LibernetError, Result};

/// Progress events emitted while bundles are built or restored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Work started on a new source directory.
    Source(String),
    /// Work started on a file within the current source.
    File(String),
    /// A number of bytes were stored or restored.
    Data(u64),
}

/// A consumer endpoint. `None` from a receive means the center shut down.
pub struct Channel<T> {
    id: usize,
    receiver: Receiver<Option<T>>,
}

impl<T> Channel<T> {
    /// Wait up to `timeout` for the next message.
    pub fn receive(&self, timeout: Duration) -> std::result::Result<Option<T>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Process-wide broadcast bus.
pub struct Center<T: Clone + Send + 'static> {
    input: Sender<Option<T>>,
    subscribers: Arc<Mutex<Vec<(usize, Sender<Option<T>>)>>>,
    running: Arc<AtomicBool>,
    next_id: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> Center<T> {
    pub fn new() -> Self {
        let (input, feed) = unbounded::<Option<T>>();
        let subscribers: Arc<Mutex<Vec<(usize, Sender<Option<T>>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let worker_subscribers = Arc::clone(&subscribers);
        let worker = std::thread::spawn(move || {
            loop {
                match feed.recv() {
                    Ok(Some(message)) => broadcast(&worker_subscribers, Some(message)),
                    Ok(None) | Err(_) => break,
                }
            }

            // deliver anything that raced in ahead of the sentinel
            while let Ok(Some(message)) = feed.try_recv() {
                broadcast(&worker_subscribers, Some(message));
            }

            broadcast(&worker_subscribers, None);
        });

        Center {
            input,
            subscribers,
            running,
            next_id: AtomicUsize::new(0),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Broadcast a message to every channel.
    pub fn send(&self, message: T) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LibernetError::Shutdown);
        }

        self.input.send(Some(message)).map_err(|_| LibernetError::Shutdown)
    }

    /// Create an independent consumer of future messages.
    pub fn new_channel(&self) -> Channel<T> {
        let (sender, receiver) = unbounded();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push((id, sender));
        Channel { id, receiver }
    }

    /// Detach a channel so it stops receiving.
    pub fn close_channel(&self, channel: &Channel<T>) {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .retain(|(id, _)| *id != channel.id);
    }

    /// Whether messages are still being accepted or drained.
    pub fn active(&self) -> bool {
        self.running.load(Ordering::SeqCst) || !self.input.is_empty()
    }

    /// Stop accepting sends and broadcast the end-of-stream sentinel.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.input.send(None);
        }
    }

    /// Wait for the forwarding thread to finish. Implies `shutdown`.
    pub fn join(&self) {
        self.shutdown();

        if let Some(worker) = self.worker.lock().expect("worker handle poisoned").take() {
            let _ = worker.join();
        }
    }
}

impl<T: Clone + Send + 'static> Default for Center<T> {
    fn default() -> Self {
        Center::new()
    }
}

impl<T: Clone + Send + 'static> Drop for Center<T> {
    fn drop(&mut self) {
        self.join();
    }
}

/// Mirrors every message from a center into the tracing log until the
/// center shuts down. Useful when a headless run wants the same progress
/// stream an interactive session renders.
pub struct Logger {
    worker: Option<JoinHandle<()>>,
}

impl Logger {
    pub fn new<T: Clone + Send + std::fmt::Debug + 'static>(center: &Center<T>) -> Self {
        let channel = center.new_channel();
        let worker = std::thread::spawn(move || loop {
            match channel.receive(Duration::from_millis(500)) {
                Ok(Some(message)) => tracing::info!("message received: {message:?}"),
                Ok(None) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        Logger {
            worker: Some(worker),
        }
    }

    /// Wait for the mirror thread to drain and exit.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn broadcast<T: Clone>(
    subscribers: &Arc<Mutex<Vec<(usize, Sender<Option<T>>)>>>,
    message: Option<T>,
) {
    // snapshot under the lock, deliver outside it
    let targets: Vec<Sender<Option<T>>> = subscribers
        .lock()
        .expect("subscriber list poisoned")
        .iter()
        .map(|(_, sender)| sender.clone())
        .collect();

    for target in targets {
        let _ = target.send(message.clone());
    }
}
