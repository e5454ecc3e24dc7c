//! # Appender
//!
//! All file mutation funnels through one dedicated writer thread. Callers
//! enqueue operations; the thread drains them in batches and performs, per
//! batch, one append to each touched data file, one append to each touched
//! log file, and at most one fsync per file. Many concurrent writers thus
//! share each fsync.
//!
//! ## Enqueue side
//!
//! Space is claimed at enqueue time, under the appender lock: an ADD
//! reserves its data-file range and log slot in the active segment (rolling
//! to a new segment first when the record would not fit), so the caller
//! learns the record's final `(segment, offset)` before the bytes hit disk
//! and can index it immediately. The value bytes go into the in-flight map,
//! where reads find them until the batch lands.
//!
//! A DEL reserves only a log slot — in the log of the segment holding the
//! record it cancels. Cancelling ADD and DEL therefore always share one log
//! file, which is what makes per-segment reference counts and file-granular
//! replay skipping sound.
//!
//! ## Ordering and durability
//!
//! The queue preserves enqueue order, batches are processed in order, and
//! appends within a batch follow enqueue order, so operations become
//! durable in exactly the order they were submitted. A `sync = true`
//! operation (or an explicit [`Appender::sync`]) gates its batch: the batch
//! fsyncs every file dirtied since the previous fsync before the waiter is
//! released, so a successful return covers every earlier operation too.
//! With the store's `force` flag set, every batch fsyncs.
//!
//! ## Failure
//!
//! A write or fsync error poisons the store: the error is recorded, every
//! waiting and future caller fails fast with it, and the thread keeps
//! draining only to reject queued work. It never dies silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::error;
use zerocopy::IntoBytes;

use super::checkpoint::JournalLocation;
use super::op_record::{OpRecord, OP_RECORD_BYTES};
use super::segment::{value_record_len, Segment, SegmentRegistry};
use crate::key::StoreKey;

/// Default cap on bytes drained into one batch.
pub const MAX_BATCH_SIZE: usize = 4 * 1024 * 1024;

/// A value visible to readers before its batch lands. The count tracks how
/// many enqueued ADDs still reference the key; the entry leaves the map
/// when it reaches zero.
struct InFlyWrite {
    data: Arc<[u8]>,
    count: u32,
}

#[derive(Default)]
pub struct InFlyWrites {
    entries: RwLock<HashMap<StoreKey, InFlyWrite>>,
}

impl InFlyWrites {
    pub fn get(&self, key: &StoreKey) -> Option<Arc<[u8]>> {
        self.entries.read().get(key).map(|w| w.data.clone())
    }

    fn acquire(&self, key: StoreKey, data: Arc<[u8]>) {
        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.data = data;
                entry.count += 1;
            }
            None => {
                entries.insert(key, InFlyWrite { data, count: 1 });
            }
        }
    }

    fn release(&self, key: &StoreKey) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            entry.count -= 1;
            if entry.count == 0 {
                entries.remove(key);
            }
        }
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Blocks a `sync = true` caller until its batch is durable.
struct Gate {
    done: Mutex<Option<std::result::Result<(), String>>>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn release(&self, outcome: std::result::Result<(), String>) {
        let mut done = self.done.lock();
        *done = Some(outcome);
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut done = self.done.lock();
        while done.is_none() {
            self.cond.wait(&mut done);
        }
        match done.take().unwrap() {
            Ok(()) => Ok(()),
            Err(message) => bail!("write failed: {}", message),
        }
    }
}

struct PendingOp {
    record: OpRecord,
    /// Segment receiving the bytes: the active one for an ADD, the log
    /// owner of the cancelled record for a DEL.
    segment: Arc<Segment>,
    data: Option<Arc<[u8]>>,
    gate: Option<Arc<Gate>>,
}

impl PendingOp {
    fn cost(&self) -> usize {
        let data = self
            .data
            .as_ref()
            .map(|d| value_record_len(d.len()) as usize)
            .unwrap_or(0);
        data + OP_RECORD_BYTES
    }
}

enum Command {
    Op(PendingOp),
    Sync(Arc<Gate>),
    Shutdown,
}

struct Poison {
    failed: AtomicBool,
    message: Mutex<Option<String>>,
}

impl Poison {
    fn set(&self, message: String) {
        let mut slot = self.message.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            let message = self
                .message
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown writer failure".to_string());
            bail!("store is dead after writer failure: {}", message);
        }
        Ok(())
    }
}

pub struct Appender {
    registry: Arc<SegmentRegistry>,
    in_fly: Arc<InFlyWrites>,
    poison: Arc<Poison>,
    /// Serializes reservation + enqueue so queue order equals reservation
    /// order.
    enqueue: Mutex<Sender<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Appender {
    pub fn start(registry: Arc<SegmentRegistry>, force: bool, max_batch: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let in_fly = Arc::new(InFlyWrites::default());
        let poison = Arc::new(Poison {
            failed: AtomicBool::new(false),
            message: Mutex::new(None),
        });

        let worker = {
            let registry = registry.clone();
            let in_fly = in_fly.clone();
            let poison = poison.clone();
            std::thread::Builder::new()
                .name("journalkv-writer".to_string())
                .spawn(move || writer_loop(rx, registry, in_fly, poison, force, max_batch))
                .expect("failed to spawn writer thread")
        };

        Self {
            registry,
            in_fly,
            poison,
            enqueue: Mutex::new(tx),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues an ADD, returning the resolved record and the journal
    /// location of its log entry. Blocks until durable when `sync`.
    pub fn store(
        &self,
        key: StoreKey,
        data: Arc<[u8]>,
        sync: bool,
    ) -> Result<(OpRecord, JournalLocation)> {
        self.poison.check()?;

        let gate = sync.then(Gate::new);
        let (record, location) = {
            let tx = self.enqueue.lock();

            // A segment seals once it has reached capacity; the record that
            // crossed the line stays where it landed, so sealed segments
            // are always at least capacity-sized.
            let mut active = self.registry.active()?;
            if active.data_len() >= active.capacity() {
                active = self.registry.roll()?;
            }

            let record_len = value_record_len(data.len());

            let offset = active.reserve_data(record_len);
            let log_offset = active.reserve_log();
            let record = OpRecord::add(key, active.serial(), offset, data.len() as u32);

            active.increment();
            self.in_fly.acquire(key, data.clone());

            let sent = tx.send(Command::Op(PendingOp {
                record,
                segment: active.clone(),
                data: Some(data),
                gate: gate.clone(),
            }));
            ensure!(sent.is_ok(), "writer thread is gone");

            (record, JournalLocation::new(active.serial(), log_offset))
        };

        if let Some(gate) = gate {
            gate.wait()?;
        }
        Ok((record, location))
    }

    /// Enqueues the DEL cancelling `old`. Blocks until durable when `sync`.
    pub fn remove(&self, old: &OpRecord, sync: bool) -> Result<()> {
        self.poison.check()?;

        let segment = self
            .registry
            .get(old.segment())
            .ok_or_else(|| eyre::eyre!("segment {} is no longer registered", old.segment()))?;

        let gate = sync.then(Gate::new);
        {
            let tx = self.enqueue.lock();
            segment.reserve_log();
            let sent = tx.send(Command::Op(PendingOp {
                record: OpRecord::del_for(old),
                segment,
                data: None,
                gate: gate.clone(),
            }));
            ensure!(sent.is_ok(), "writer thread is gone");
        }

        if let Some(gate) = gate {
            gate.wait()?;
        }
        Ok(())
    }

    /// Bytes of a not-yet-landed ADD, if any.
    pub fn in_fly_data(&self, key: &StoreKey) -> Option<Arc<[u8]>> {
        self.in_fly.get(key)
    }

    /// Blocks until everything enqueued so far is durable.
    pub fn sync(&self) -> Result<()> {
        self.poison.check()?;

        let gate = Gate::new();
        {
            let tx = self.enqueue.lock();
            ensure!(
                tx.send(Command::Sync(gate.clone())).is_ok(),
                "writer thread is gone"
            );
        }
        gate.wait()
    }

    /// Flushes, stops the writer thread, and joins it. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return Ok(());
        };

        let sync_result = self.sync();
        {
            let tx = self.enqueue.lock();
            let _ = tx.send(Command::Shutdown);
        }
        if worker.join().is_err() {
            self.poison.set("writer thread panicked".to_string());
        }
        sync_result
    }
}

fn writer_loop(
    rx: Receiver<Command>,
    registry: Arc<SegmentRegistry>,
    in_fly: Arc<InFlyWrites>,
    poison: Arc<Poison>,
    force: bool,
    max_batch: usize,
) {
    // Files written but not yet fsynced, by segment serial.
    let mut dirty_data: HashMap<u32, Arc<Segment>> = HashMap::new();
    let mut dirty_logs: HashMap<u32, Arc<Segment>> = HashMap::new();

    loop {
        let first = match rx.recv() {
            Ok(command) => command,
            Err(_) => return, // all senders dropped
        };

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        let mut stop = false;

        match first {
            Command::Shutdown => return,
            Command::Op(op) => {
                bytes += op.cost();
                batch.push(Command::Op(op));
            }
            sync @ Command::Sync(_) => batch.push(sync),
        }

        while bytes < max_batch {
            match rx.try_recv() {
                Ok(Command::Shutdown) => {
                    stop = true;
                    break;
                }
                Ok(Command::Op(op)) => {
                    bytes += op.cost();
                    batch.push(Command::Op(op));
                }
                Ok(sync @ Command::Sync(_)) => batch.push(sync),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        process_batch(batch, &registry, &in_fly, &poison, force, &mut dirty_data, &mut dirty_logs);

        if stop {
            return;
        }
    }
}

fn process_batch(
    batch: Vec<Command>,
    registry: &SegmentRegistry,
    in_fly: &InFlyWrites,
    poison: &Poison,
    force: bool,
    dirty_data: &mut HashMap<u32, Arc<Segment>>,
    dirty_logs: &mut HashMap<u32, Arc<Segment>>,
) {
    let mut gates: Vec<Arc<Gate>> = Vec::new();

    // An earlier fatal error: reject everything immediately.
    if poison.check().is_err() {
        let message = poison
            .message
            .lock()
            .clone()
            .unwrap_or_else(|| "writer failed".to_string());
        for command in batch {
            match command {
                Command::Op(op) => {
                    if let Some(gate) = op.gate {
                        gate.release(Err(message.clone()));
                    }
                }
                Command::Sync(gate) => gate.release(Err(message.clone())),
                Command::Shutdown => {}
            }
        }
        return;
    }

    // One outgoing buffer per touched data file and per touched log file,
    // filled in enqueue order.
    let mut data_bufs: Vec<(Arc<Segment>, Vec<u8>)> = Vec::new();
    let mut log_bufs: Vec<(Arc<Segment>, Vec<u8>)> = Vec::new();
    let mut add_keys: Vec<StoreKey> = Vec::new();
    let mut del_segments: Vec<Arc<Segment>> = Vec::new();
    let mut explicit_sync = false;

    fn buffer_for<'a>(
        bufs: &'a mut Vec<(Arc<Segment>, Vec<u8>)>,
        segment: &Arc<Segment>,
    ) -> &'a mut Vec<u8> {
        if let Some(i) = bufs.iter().position(|(s, _)| s.serial() == segment.serial()) {
            return &mut bufs[i].1;
        }
        bufs.push((segment.clone(), Vec::new()));
        &mut bufs.last_mut().unwrap().1
    }

    for command in batch {
        match command {
            Command::Op(op) => {
                if let Some(data) = &op.data {
                    let buf = buffer_for(&mut data_bufs, &op.segment);
                    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                    buf.extend_from_slice(data);
                    add_keys.push(op.record.key());
                } else {
                    del_segments.push(op.segment.clone());
                }
                buffer_for(&mut log_bufs, &op.segment).extend_from_slice(op.record.as_bytes());
                if let Some(gate) = op.gate {
                    gates.push(gate);
                }
            }
            Command::Sync(gate) => {
                explicit_sync = true;
                gates.push(gate);
            }
            Command::Shutdown => {}
        }
    }

    let outcome = (|| -> Result<()> {
        for (segment, buf) in &data_bufs {
            segment.append_data(buf)?;
            dirty_data.insert(segment.serial(), segment.clone());
        }
        for (segment, buf) in &log_bufs {
            segment.append_log(buf)?;
            dirty_logs.insert(segment.serial(), segment.clone());
        }

        // The files now hold the bytes (page cache), so readers no longer
        // need the in-flight copies.
        for key in &add_keys {
            in_fly.release(key);
        }

        if force || explicit_sync || !gates.is_empty() {
            for segment in dirty_data.values() {
                segment.sync_data()?;
            }
            dirty_data.clear();
            for segment in dirty_logs.values() {
                segment.sync_log()?;
            }
            dirty_logs.clear();
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            for segment in del_segments {
                segment.decrement();
                registry.maybe_retire(&segment);
            }
            for gate in gates {
                gate.release(Ok(()));
            }
        }
        Err(e) => {
            let message = format!("{:#}", e);
            error!(error = %message, "writer batch failed; store is now dead");
            poison.set(message.clone());
            in_fly.clear();
            for gate in gates {
                gate.release(Err(message.clone()));
            }
        }
    }
}
