//! The single-writer serialization layer: a bounded command queue
//! funneling every mutation through one or more worker threads that
//! hold the only handles to the embedded KV store, giving
//! read-modify-write atomicity without per-key locking.
//!
//! A `crossbeam_channel` command queue is drained by plain OS threads,
//! with `tokio::sync::oneshot` carrying each request's reply back to
//! the async HTTP handler that submitted it.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::Error;
use crate::sketch::Sketch;

/// A single mutating or reading action against one named sketch.
#[derive(Debug)]
pub enum Command {
    Get { key: String },
    Set { key: String, sketch: Sketch },
    Delete { key: String },
    AddHash { key: String, hash: u64 },
    Resize { key: String, new_k: usize },
}

/// A command paired with the one-shot channel its result is delivered on.
struct Request {
    key: String,
    command: Command,
    reply: oneshot::Sender<Result<Option<Sketch>, Error>>,
}

/// Handle shared by every caller wanting to submit work to the store.
/// Cloning is cheap: it's a sender end of the bounded command channel
/// plus an `Arc` to the default capacity used for implicitly-created
/// sketches.
#[derive(Clone)]
pub struct StoreHandle {
    sender: crossbeam_channel::Sender<Request>,
    default_k: usize,
}

impl StoreHandle {
    /// Submits `command` to the worker pool and awaits its result.
    ///
    /// Commands with an empty key fail fast with `Error::MissingKey`
    /// without ever reaching a worker.
    pub async fn submit(&self, command: Command) -> Result<Option<Sketch>, Error> {
        let key = command_key(&command).to_string();
        if key.is_empty() {
            return Err(Error::MissingKey);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            key,
            command,
            reply: reply_tx,
        };

        let sender = self.sender.clone();
        tokio::task::spawn_blocking(move || sender.send(request))
            .await
            .map_err(|_| Error::Shutdown)?
            .map_err(|_| Error::Shutdown)?;

        reply_rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Convenience wrapper for `Get`, returning the sketch (or the
    /// empty default sketch for a missing key).
    pub async fn get(&self, key: &str) -> Result<Sketch, Error> {
        match self.submit(Command::Get { key: key.to_string() }).await? {
            Some(s) => Ok(s),
            None => Ok(Sketch::new(self.default_k)),
        }
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }
}

fn command_key(command: &Command) -> &str {
    match command {
        Command::Get { key } => key,
        Command::Set { key, .. } => key,
        Command::Delete { key } => key,
        Command::AddHash { key, .. } => key,
        Command::Resize { key, .. } => key,
    }
}

/// The worker pool: owns the shared command channel and the join
/// handles of its worker threads, so it can be shut down cleanly.
pub struct StorePool {
    handle: StoreHandle,
    workers: Vec<JoinHandle<()>>,
}

impl StorePool {
    /// Opens the embedded KV store at `path` and spawns `n_workers`
    /// worker threads draining a command channel of the given
    /// `channel_capacity`.
    ///
    /// `n_workers` should be `1` unless the deployment shards keys
    /// across workers some other way: with more than one worker,
    /// concurrent `AddHash`/`Resize` against the same key can lose
    /// updates, since two workers may both read the prior bytes before
    /// either has written back.
    pub fn open(
        path: &std::path::Path,
        cache_capacity: u64,
        default_k: usize,
        n_workers: usize,
        channel_capacity: usize,
    ) -> Result<Self, Error> {
        assert!(n_workers >= 1, "at least one worker is required");
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(cache_capacity)
            .open()?;
        let db = Arc::new(db);

        let (sender, receiver) = crossbeam_channel::bounded(channel_capacity);

        let mut workers = Vec::with_capacity(n_workers);
        for id in 0..n_workers {
            let db = Arc::clone(&db);
            let receiver = receiver.clone();
            workers.push(std::thread::spawn(move || worker_loop(id, db, receiver, default_k)));
        }

        Ok(StorePool {
            handle: StoreHandle { sender, default_k },
            workers,
        })
    }

    /// A cheaply-cloneable handle for submitting commands.
    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    /// Closes the command channel and waits for every worker to drain
    /// and exit, the process-wide graceful shutdown path behind `/exit`.
    pub fn shutdown(self) {
        drop(self.handle);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    id: usize,
    db: Arc<sled::Db>,
    receiver: crossbeam_channel::Receiver<Request>,
    default_k: usize,
) {
    debug!(worker = id, "store worker started");
    for request in receiver.iter() {
        let result = execute(&db, request.command, default_k);
        if let Err(ref e) = result {
            warn!(worker = id, key = %request.key, error = %e, "command failed");
        }
        let _ = request.reply.send(result);
    }
    debug!(worker = id, "store worker exiting");
}

fn execute(db: &sled::Db, command: Command, default_k: usize) -> Result<Option<Sketch>, Error> {
    match command {
        Command::Get { key } => {
            let sketch = read_sketch(db, &key, default_k)?;
            Ok(Some(sketch))
        }
        Command::Set { key, sketch } => {
            db.insert(key.as_bytes(), sketch.encode())?;
            Ok(Some(sketch))
        }
        Command::Delete { key } => {
            db.remove(key.as_bytes())?;
            Ok(None)
        }
        Command::AddHash { key, hash } => {
            let mut sketch = read_sketch(db, &key, default_k)?;
            sketch.add_hash(hash);
            db.insert(key.as_bytes(), sketch.encode())?;
            Ok(Some(sketch))
        }
        Command::Resize { key, new_k } => {
            let mut sketch = read_sketch(db, &key, default_k)?;
            sketch.resize(new_k)?;
            db.insert(key.as_bytes(), sketch.encode())?;
            Ok(Some(sketch))
        }
    }
}

fn read_sketch(db: &sled::Db, key: &str, default_k: usize) -> Result<Sketch, Error> {
    match db.get(key.as_bytes())? {
        Some(bytes) => Sketch::decode(&bytes, default_k),
        None => Ok(Sketch::new(default_k)),
    }
}
