//! Block storage backed by a remote peer over HTTP.
//!
//! Writes are queued and flushed by a background worker; reads gate on the
//! queue being empty so a client always sees its own writes. The worker is
//! joined explicitly (or on drop) so the process cannot exit with unsent
//! blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::error::{LibernetError, Result};
use crate::store::{writable_address, BlockStore};
use crate::url;

enum Job {
    Put { address: String, data: Vec<u8> },
    Shutdown,
}

/// Cleared on every enqueue, set when the send queue empties. Readers wait
/// on it before touching the wire.
struct DrainGate {
    drained: Mutex<bool>,
    signal: Condvar,
}

impl DrainGate {
    fn new() -> Self {
        DrainGate {
            drained: Mutex::new(true),
            signal: Condvar::new(),
        }
    }

    fn clear(&self) {
        *self.drained.lock().expect("drain gate poisoned") = false;
    }

    fn set(&self) {
        *self.drained.lock().expect("drain gate poisoned") = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut drained = self.drained.lock().expect("drain gate poisoned");
        while !*drained {
            drained = self.signal.wait(drained).expect("drain gate poisoned");
        }
    }
}

/// A [`BlockStore`] served by a remote block server.
pub struct ProxyStore {
    base_url: String,
    client: reqwest::blocking::Client,
    jobs: Sender<Job>,
    gate: Arc<DrainGate>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyStore {
    pub fn new(server: &str, port: u16) -> Self {
        let base_url = format!("http://{server}:{port}");
        let client = reqwest::blocking::Client::new();
        let gate = Arc::new(DrainGate::new());
        let running = Arc::new(AtomicBool::new(true));
        let (jobs, feed) = unbounded();

        let worker = spawn_send_worker(base_url.clone(), client.clone(), feed, Arc::clone(&gate));

        ProxyStore {
            base_url,
            client,
            jobs,
            gate,
            running,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LibernetError::Shutdown)
        }
    }
}

fn spawn_send_worker(
    base_url: String,
    client: reqwest::blocking::Client,
    feed: Receiver<Job>,
    gate: Arc<DrainGate>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut closing = false;

        loop {
            match feed.try_recv() {
                Ok(job) => closing |= handle_job(&base_url, &client, job),
                Err(TryRecvError::Empty) => {
                    gate.set();

                    if closing {
                        break;
                    }

                    match feed.recv() {
                        Ok(job) => closing |= handle_job(&base_url, &client, job),
                        Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        gate.set();
    })
}

/// Send one queued write. Returns true for the shutdown sentinel.
fn handle_job(base_url: &str, client: &reqwest::blocking::Client, job: Job) -> bool {
    let Job::Put { address, data } = job else {
        return true;
    };

    let target = format!("{base_url}{address}");
    let size = data.len();
    debug!("sending {size} bytes to {target}");

    match client.put(&target).body(data).send() {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => warn!("sending {size} bytes to {target} -> {}", response.status()),
        Err(error) => warn!("sending {size} bytes to {target} failed: {error}"),
    }

    false
}

impl BlockStore for ProxyStore {
    fn put(&self, block_url: &str, data: &[u8]) -> Result<()> {
        self.check_running()?;
        let address = writable_address(block_url)?;
        // clear before enqueue so a racing reader cannot slip past the gate
        self.gate.clear();
        self.jobs
            .send(Job::Put {
                address,
                data: data.to_vec(),
            })
            .map_err(|_| LibernetError::Shutdown)
    }

    fn get(&self, block_url: &str) -> Result<Option<Vec<u8>>> {
        self.check_running()?;
        self.gate.wait();

        let address = url::address_of(block_url)?;
        let response = self.client.get(format!("{}{address}", self.base_url)).send()?;

        if !response.status().is_success() {
            return Ok(None);
        }

        Ok(Some(response.bytes()?.to_vec()))
    }

    fn contains(&self, block_url: &str) -> Result<bool> {
        self.check_running()?;
        self.gate.wait();

        let address = url::address_of(block_url)?;
        let response = self
            .client
            .head(format!("{}{address}", self.base_url))
            .send()?;
        Ok(response.status().is_success())
    }

    fn like(&self, block_url: &str) -> Result<BTreeMap<String, u64>> {
        self.check_running()?;
        self.gate.wait();

        let target = url::parse(block_url)?.address;
        let response = self
            .client
            .get(format!("{}/sha256/like/{target}", self.base_url))
            .send()?;

        if !response.status().is_success() {
            return Ok(BTreeMap::new());
        }

        Ok(serde_json::from_slice(&response.bytes()?)?)
    }

    fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.jobs.send(Job::Shutdown);
        }
    }

    fn join(&self) {
        self.shutdown();

        if let Some(worker) = self.worker.lock().expect("worker handle poisoned").take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ProxyStore {
    fn drop(&mut self) {
        self.join();
    }
}
