//! In-memory priority queue of pending sync requests.
//!
//! Entries live in a binary heap laid out in a `Vec`, with a side index from
//! `(type, id)` to heap position that is kept in step with every swap. An
//! entry stays in the heap while a dispatcher task owns it so later enqueues
//! for the same key can find it and never create a duplicate.

use crate::types::{FetchPermsOptions, Priority, RequestType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::Notify;

/// What a caller asks the queue to sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMeta {
    pub priority: Priority,
    pub request_type: RequestType,
    pub id: i32,
    pub options: FetchPermsOptions,
    /// `None` means as soon as possible.
    pub next_sync_at: Option<DateTime<Utc>>,
    /// The entity has never been synced.
    pub no_perms: bool
}

impl RequestMeta {
    pub fn user(id: i32, priority: Priority) -> Self {
        Self::new(RequestType::User, id, priority)
    }

    pub fn repo(id: i32, priority: Priority) -> Self {
        Self::new(RequestType::Repo, id, priority)
    }

    fn new(request_type: RequestType, id: i32, priority: Priority) -> Self {
        Self {
            priority,
            request_type,
            id,
            options: FetchPermsOptions::default(),
            next_sync_at: None,
            no_perms: false
        }
    }

    pub fn with_options(mut self, options: FetchPermsOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_next_sync_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_sync_at = Some(at);
        self
    }

    pub fn with_no_perms(mut self, no_perms: bool) -> Self {
        self.no_perms = no_perms;
        self
    }

    /// Folds a later request for the same key into this one: priority only
    /// goes up, options are replaced, the more urgent time wins and
    /// `no_perms` sticks once set.
    fn absorb(&mut self, newer: RequestMeta) {
        self.priority = self.priority.max(newer.priority);
        self.options = newer.options;
        self.next_sync_at = match (self.next_sync_at, newer.next_sync_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None
        };
        self.no_perms |= newer.no_perms;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRequest {
    #[serde(flatten)]
    pub meta: RequestMeta,
    pub acquired: bool
}

impl SyncRequest {
    pub fn key(&self) -> (RequestType, i32) {
        (self.meta.request_type, self.meta.id)
    }
}

struct Entry {
    request: SyncRequest,
    seq: u64,
    /// Update that arrived while the entry was acquired.
    deferred: Option<RequestMeta>
}

/// `Less` means `a` is dequeued before `b`.
fn rank(a: &Entry, b: &Entry) -> Ordering {
    let (ra, rb) = (&a.request, &b.request);
    ra.acquired
        .cmp(&rb.acquired)
        .then_with(|| rb.meta.priority.cmp(&ra.meta.priority))
        .then_with(|| match (ra.meta.next_sync_at, rb.meta.next_sync_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y)
        })
        .then_with(|| rb.meta.request_type.cmp(&ra.meta.request_type))
        .then_with(|| a.seq.cmp(&b.seq))
}

#[derive(Default)]
struct Heap {
    entries: Vec<Entry>,
    index: HashMap<(RequestType, i32), usize>,
    next_seq: u64
}

impl Heap {
    fn push(&mut self, meta: RequestMeta) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let pos = self.entries.len();
        self.index.insert((meta.request_type, meta.id), pos);
        self.entries.push(Entry {
            request: SyncRequest {
                meta,
                acquired: false
            },
            seq,
            deferred: None
        });
        self.sift_up(pos);
    }

    fn remove_at(&mut self, pos: usize) -> Option<Entry> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(pos, last);
        let entry = self.entries.pop()?;
        self.index.remove(&entry.request.key());
        if pos < self.entries.len() {
            self.fix(pos);
        }
        Some(entry)
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.entries.swap(i, j);
        self.index.insert(self.entries[i].request.key(), i);
        self.index.insert(self.entries[j].request.key(), j);
    }

    /// Restores heap order after the entry at `pos` changed.
    fn fix(&mut self, pos: usize) {
        if !self.sift_down(pos) {
            self.sift_up(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if rank(&self.entries[pos], &self.entries[parent]) != Ordering::Less {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, start: usize) -> bool {
        let mut pos = start;
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && rank(&self.entries[right], &self.entries[left]) == Ordering::Less {
                child = right;
            }
            if rank(&self.entries[child], &self.entries[pos]) != Ordering::Less {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
        pos > start
    }
}

pub struct RequestQueue {
    heap: Mutex<Heap>,
    notify: Notify
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::default()),
            notify: Notify::new()
        }
    }

    /// Inserts the request or folds it into the existing entry for the same
    /// key. Returns `true` when an existing entry was updated.
    pub fn enqueue(&self, meta: RequestMeta) -> bool {
        let updated = {
            let mut heap = self.heap.lock();
            match heap.index.get(&(meta.request_type, meta.id)).copied() {
                Some(pos) => {
                    let entry = &mut heap.entries[pos];
                    if entry.request.acquired {
                        match entry.deferred.as_mut() {
                            Some(deferred) => deferred.absorb(meta),
                            None => entry.deferred = Some(meta)
                        }
                    } else {
                        entry.request.meta.absorb(meta);
                        heap.fix(pos);
                    }
                    true
                }
                None => {
                    heap.push(meta);
                    false
                }
            }
        };
        self.notify.notify_one();
        updated
    }

    /// Marks the most urgent unacquired request as acquired and returns a
    /// copy of it.
    pub fn acquire_next(&self) -> Option<SyncRequest> {
        let mut heap = self.heap.lock();
        let root = heap.entries.first_mut()?;
        if root.request.acquired {
            return None;
        }
        root.request.acquired = true;
        let request = root.request.clone();
        heap.fix(0);
        Some(request)
    }

    /// Hands an acquired request back to the queue, applying any update that
    /// arrived in the meantime. Waiters are only woken for such an update, so
    /// releasing a request that is not yet due cannot spin the dispatcher.
    pub fn release(&self, request_type: RequestType, id: i32) -> bool {
        let (released, updated) = {
            let mut heap = self.heap.lock();
            let Some(pos) = heap.index.get(&(request_type, id)).copied() else {
                return false;
            };
            let entry = &mut heap.entries[pos];
            if !entry.request.acquired {
                (false, false)
            } else {
                entry.request.acquired = false;
                let deferred = entry.deferred.take();
                let updated = deferred.is_some();
                if let Some(deferred) = deferred {
                    entry.request.meta.absorb(deferred);
                }
                heap.fix(pos);
                (true, updated)
            }
        };
        if updated {
            self.notify.notify_one();
        }
        released
    }

    /// Drops the entry if its acquired flag equals `acquired`. An update
    /// deferred while it was acquired is queued as a fresh request.
    pub fn remove(&self, request_type: RequestType, id: i32, acquired: bool) -> bool {
        let mut heap = self.heap.lock();
        let Some(pos) = heap.index.get(&(request_type, id)).copied() else {
            return false;
        };
        if heap.entries[pos].request.acquired != acquired {
            return false;
        }
        let Some(entry) = heap.remove_at(pos) else {
            return false;
        };
        if let Some(deferred) = entry.deferred {
            heap.push(deferred);
            drop(heap);
            self.notify.notify_one();
        }
        true
    }

    pub fn get(&self, request_type: RequestType, id: i32) -> Option<SyncRequest> {
        let heap = self.heap.lock();
        let pos = heap.index.get(&(request_type, id)).copied()?;
        Some(heap.entries[pos].request.clone())
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in dequeue order.
    pub fn snapshot(&self) -> Vec<SyncRequest> {
        let heap = self.heap.lock();
        let mut order: Vec<&Entry> = heap.entries.iter().collect();
        order.sort_by(|a, b| rank(a, b));
        order.into_iter().map(|e| e.request.clone()).collect()
    }

    /// Wakes a waiter, or the next one to arrive if nobody is waiting.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
