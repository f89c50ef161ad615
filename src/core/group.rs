//! Process group handle and the in-process, thread-backed implementation.
//!
//! Every component receives a [`ProcessGroup`] explicitly. All methods except
//! [`ProcessGroup::send`] and [`ProcessGroup::recv`] are collective: every rank
//! must call them, in the same order, or the group blocks forever.

use crate::types::{GridError, GridResult};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Barrier};

/// Rank that owns coordinator-only state (output files, loaded targets)
pub const COORDINATOR: usize = 0;

/// Communication primitives shared by every process of one pipeline run
pub trait ProcessGroup {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    /// Block until every rank has reached the barrier
    fn barrier(&self);

    /// Point-to-point send; only the receiving rank takes part
    fn send<T: Send + 'static>(&self, value: T, dest: usize) -> GridResult<()>;

    /// Point-to-point receive from a specific rank
    fn recv<T: Send + 'static>(&self, source: usize) -> GridResult<T>;

    /// Distribute the coordinator's value to every rank. Non-coordinators pass
    /// `None`. A coordinator passing `None` makes every rank return an error.
    fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>) -> GridResult<T>;

    /// Deliver `parts[i]` from the coordinator to rank `i`
    fn scatter<T: Send + 'static>(&self, parts: Option<Vec<T>>) -> GridResult<T>;

    /// Every rank receives every rank's value, in rank order
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> GridResult<Vec<T>>;

    fn all_reduce_sum(&self, value: f64) -> GridResult<f64> {
        Ok(self.all_gather(value)?.into_iter().sum())
    }

    /// Collectively allocate a shared region of `len` elements. Only the
    /// coordinator supplies `contents`, which are copied into the region before
    /// it is published to the other ranks.
    fn allocate_shared<T: Clone + Send + Sync + 'static>(
        &self,
        len: usize,
        contents: Option<&[T]>,
    ) -> GridResult<SharedRegion<T>>;

    /// Release this rank's handle on a shared region. Every rank that took
    /// part in the allocation must release it.
    fn release_shared<T: Send + Sync + 'static>(&self, region: SharedRegion<T>) -> GridResult<()>;

    /// Fail unless every participant has released each of `ids`. Only
    /// meaningful once all ranks have passed a barrier after releasing.
    fn verify_released(&self, ids: &[u64]) -> GridResult<()>;
}

/// Bookkeeping for shared regions of one group
#[derive(Debug, Default)]
pub struct RegionLedger {
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_id: u64,
    regions: BTreeMap<u64, RegionRecord>,
}

#[derive(Debug)]
struct RegionRecord {
    participants: usize,
    released: BTreeSet<usize>,
}

impl RegionLedger {
    fn register(&self, participants: usize) -> u64 {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.regions.insert(
            id,
            RegionRecord {
                participants,
                released: BTreeSet::new(),
            },
        );
        id
    }

    fn release(&self, id: u64, rank: usize) -> GridResult<()> {
        let mut state = self.inner.lock();
        let record = state
            .regions
            .get_mut(&id)
            .ok_or_else(|| GridError::SharedRegion(format!("region {} was never allocated", id)))?;
        if !record.released.insert(rank) {
            return Err(GridError::SharedRegion(format!(
                "region {} released twice by rank {}",
                id, rank
            )));
        }
        Ok(())
    }

    /// Regions that are not released by every participant
    pub fn outstanding(&self) -> Vec<(u64, usize, usize)> {
        let state = self.inner.lock();
        state
            .regions
            .iter()
            .filter(|(_, r)| r.released.len() != r.participants)
            .map(|(id, r)| (*id, r.released.len(), r.participants))
            .collect()
    }

    /// Fails when any of `ids` is still held by some participant
    pub fn verify_regions(&self, ids: &[u64]) -> GridResult<()> {
        let state = self.inner.lock();
        for id in ids {
            let record = state
                .regions
                .get(id)
                .ok_or_else(|| GridError::SharedRegion(format!("region {} was never allocated", id)))?;
            if record.released.len() != record.participants {
                return Err(GridError::SharedRegion(format!(
                    "region {} released by {} of {} processes",
                    id,
                    record.released.len(),
                    record.participants
                )));
            }
        }
        Ok(())
    }

    /// Fails when any region was released by only part of the group
    pub fn verify(&self) -> GridResult<()> {
        let outstanding = self.outstanding();
        if let Some((id, released, participants)) = outstanding.first() {
            return Err(GridError::SharedRegion(format!(
                "region {} released by {} of {} processes ({} regions outstanding)",
                id,
                released,
                participants,
                outstanding.len()
            )));
        }
        Ok(())
    }
}

/// One rank's read handle on a region written once by the coordinator
pub struct SharedRegion<T> {
    id: u64,
    data: Arc<[T]>,
    released: bool,
}

impl<T> SharedRegion<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when both handles view the same bytes
    pub fn shares_memory_with(&self, other: &SharedRegion<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl<T> std::fmt::Debug for SharedRegion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Shared region {} dropped without a collective release", self.id);
        }
    }
}

type Payload = Box<dyn Any + Send>;

/// Process group whose members are threads of the current process
pub struct LocalGroup {
    rank: usize,
    size: usize,
    barrier: Arc<Barrier>,
    // indexed by destination rank
    outboxes: Vec<Sender<Payload>>,
    // indexed by source rank
    inboxes: Vec<Receiver<Payload>>,
    ledger: Arc<RegionLedger>,
}

impl LocalGroup {
    /// Build the endpoints of a group of `size` ranks
    pub fn endpoints(size: usize) -> GridResult<Vec<LocalGroup>> {
        if size == 0 {
            return Err(GridError::InvalidConfig("process group needs at least one rank".to_string()));
        }

        let barrier = Arc::new(Barrier::new(size));
        let ledger = Arc::new(RegionLedger::default());

        let mut senders: Vec<Vec<Sender<Payload>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Payload>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for source in 0..size {
            for dest in 0..size {
                let (tx, rx) = unbounded();
                senders[source].push(tx);
                receivers[dest].push(rx);
            }
        }

        Ok(senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalGroup {
                rank,
                size,
                barrier: Arc::clone(&barrier),
                outboxes,
                inboxes,
                ledger: Arc::clone(&ledger),
            })
            .collect())
    }

    /// Run `program` on `size` ranks, one thread each, and collect the
    /// per-rank results in rank order. Shared regions left partially released
    /// are reported once every rank has finished.
    pub fn launch<F, R>(size: usize, program: F) -> GridResult<Vec<R>>
    where
        F: Fn(&LocalGroup) -> GridResult<R> + Sync,
        R: Send,
    {
        let endpoints = Self::endpoints(size)?;
        let ledger = Arc::clone(&endpoints[0].ledger);
        log::debug!("Launching local process group of size {}", size);

        let outcomes: Vec<std::thread::Result<GridResult<R>>> = std::thread::scope(|scope| {
            let program = &program;
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|group| scope.spawn(move || program(&group)))
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let mut results = Vec::with_capacity(size);
        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(result) => results.push(result?),
                Err(_) => return Err(GridError::Collective(format!("rank {} panicked", rank))),
            }
        }

        ledger.verify()?;
        Ok(results)
    }

    pub fn ledger(&self) -> &RegionLedger {
        &self.ledger
    }

    fn post(&self, payload: Payload, dest: usize) -> GridResult<()> {
        let outbox = self.outboxes.get(dest).ok_or_else(|| {
            GridError::Collective(format!("rank {} does not exist in a group of {}", dest, self.size))
        })?;
        outbox
            .send(payload)
            .map_err(|_| GridError::Collective(format!("rank {} has left the group", dest)))
    }

    fn take<T: 'static>(&self, source: usize) -> GridResult<T> {
        let inbox = self.inboxes.get(source).ok_or_else(|| {
            GridError::Collective(format!("rank {} does not exist in a group of {}", source, self.size))
        })?;
        let payload = inbox
            .recv()
            .map_err(|_| GridError::Collective(format!("rank {} has left the group", source)))?;
        payload.downcast::<T>().map(|b| *b).map_err(|_| {
            GridError::Collective(format!(
                "rank {} received an unexpected message type from rank {}",
                self.rank, source
            ))
        })
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn send<T: Send + 'static>(&self, value: T, dest: usize) -> GridResult<()> {
        self.post(Box::new(value), dest)
    }

    fn recv<T: Send + 'static>(&self, source: usize) -> GridResult<T> {
        self.take(source)
    }

    fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>) -> GridResult<T> {
        let received = if self.is_coordinator() {
            for dest in (0..self.size).filter(|&d| d != COORDINATOR) {
                self.post(Box::new(value.clone()), dest)?;
            }
            value
        } else {
            self.take::<Option<T>>(COORDINATOR)?
        };
        received.ok_or_else(|| GridError::Collective("coordinator had nothing to broadcast".to_string()))
    }

    fn scatter<T: Send + 'static>(&self, parts: Option<Vec<T>>) -> GridResult<T> {
        if !self.is_coordinator() {
            return self
                .take::<Option<T>>(COORDINATOR)?
                .ok_or_else(|| GridError::Collective("coordinator had nothing to scatter".to_string()));
        }

        let parts = parts.filter(|p| p.len() == self.size);
        match parts {
            Some(parts) => {
                let mut own = None;
                for (dest, part) in parts.into_iter().enumerate() {
                    if dest == COORDINATOR {
                        own = Some(part);
                    } else {
                        self.post(Box::new(Some(part)), dest)?;
                    }
                }
                own.ok_or_else(|| GridError::Collective("scatter lost the coordinator's part".to_string()))
            }
            None => {
                for dest in (0..self.size).filter(|&d| d != COORDINATOR) {
                    self.post(Box::new(None::<T>), dest)?;
                }
                Err(GridError::Collective(format!(
                    "scatter needs exactly {} parts on the coordinator",
                    self.size
                )))
            }
        }
    }

    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> GridResult<Vec<T>> {
        for dest in (0..self.size).filter(|&d| d != self.rank) {
            self.post(Box::new(value.clone()), dest)?;
        }
        let mut gathered = Vec::with_capacity(self.size);
        for source in 0..self.size {
            if source == self.rank {
                gathered.push(value.clone());
            } else {
                gathered.push(self.take::<T>(source)?);
            }
        }
        Ok(gathered)
    }

    fn allocate_shared<T: Clone + Send + Sync + 'static>(
        &self,
        len: usize,
        contents: Option<&[T]>,
    ) -> GridResult<SharedRegion<T>> {
        let published: Option<(u64, Arc<[T]>)> = if self.is_coordinator() {
            let published = contents.filter(|c| c.len() == len).map(|c| {
                let id = self.ledger.register(self.size);
                (id, Arc::<[T]>::from(c))
            });
            for dest in (0..self.size).filter(|&d| d != COORDINATOR) {
                self.post(Box::new(published.clone()), dest)?;
            }
            published
        } else {
            self.take::<Option<(u64, Arc<[T]>)>>(COORDINATOR)?
        };

        let (id, data) = published.ok_or_else(|| {
            GridError::SharedRegion(format!(
                "coordinator did not supply {} elements for the shared region",
                len
            ))
        })?;
        if data.len() != len {
            return Err(GridError::SharedRegion(format!(
                "rank {} expected {} elements but the region holds {}",
                self.rank,
                len,
                data.len()
            )));
        }

        log::debug!("[rank {}] Attached shared region {} ({} elements)", self.rank, id, len);
        Ok(SharedRegion {
            id,
            data,
            released: false,
        })
    }

    fn release_shared<T: Send + Sync + 'static>(&self, mut region: SharedRegion<T>) -> GridResult<()> {
        region.released = true;
        self.ledger.release(region.id, self.rank)
    }

    fn verify_released(&self, ids: &[u64]) -> GridResult<()> {
        self.ledger.verify_regions(ids)
    }
}
