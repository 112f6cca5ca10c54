// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Rank Transport
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Abstract point-to-point transport between ranks.
//!
//! The engine only needs non-blocking send/receive/test/wait plus a
//! barrier and an allgather for geometry setup. Messages between the
//! same (sender, tag) pair are delivered in posting order; distinct tags
//! are matched independently, so receivers rely on tags, not FIFO.
//!
//! Two implementations are provided: [`NullTransport`] for single-rank
//! runs and [`LocalFabric`] which hosts N ranks as threads of one
//! process. The trait can be wired to rsmpi in a later phase.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use stencil_types::error::{StencilError, StencilResult};

pub type Tag = u32;

/// Opaque handle for an outstanding non-blocking operation.
#[derive(Debug)]
pub struct Request(ReqKind);

#[derive(Debug)]
enum ReqKind {
    /// Local sends complete at posting time (the payload is copied).
    CompletedSend,
    Recv { from: usize, tag: Tag, nbytes: usize },
}

pub trait Transport: Send + Sync {
    fn my_rank(&self) -> usize;
    fn num_ranks(&self) -> usize;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> StencilResult<()>;

    /// Exchange one row of i64s per rank; returns all rows indexed by
    /// rank. All rows must have the same length.
    fn allgather(&self, mine: &[i64]) -> StencilResult<Vec<Vec<i64>>>;

    /// Post a non-blocking send of `payload` to rank `to` under `tag`.
    fn isend(&self, to: usize, tag: Tag, payload: Vec<u8>) -> StencilResult<Request>;

    /// Post a non-blocking receive of exactly `nbytes` from rank `from`
    /// under `tag`.
    fn irecv(&self, from: usize, tag: Tag, nbytes: usize) -> StencilResult<Request>;

    /// Poll a request without blocking; true when it could complete now.
    fn test(&self, req: &Request) -> StencilResult<bool>;

    /// Block until the request completes. Returns the payload for
    /// receives, `None` for sends.
    fn wait(&self, req: Request) -> StencilResult<Option<Vec<u8>>>;
}

// ── Single-rank transport ────────────────────────────────────────────

/// Transport for a solution running on exactly one rank. Point-to-point
/// traffic is a configuration error because a lone rank has no peers.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn my_rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn barrier(&self) -> StencilResult<()> {
        Ok(())
    }

    fn allgather(&self, mine: &[i64]) -> StencilResult<Vec<Vec<i64>>> {
        Ok(vec![mine.to_vec()])
    }

    fn isend(&self, to: usize, _tag: Tag, _payload: Vec<u8>) -> StencilResult<Request> {
        Err(StencilError::Messaging(format!(
            "isend to rank {to} on a single-rank transport"
        )))
    }

    fn irecv(&self, from: usize, _tag: Tag, _nbytes: usize) -> StencilResult<Request> {
        Err(StencilError::Messaging(format!(
            "irecv from rank {from} on a single-rank transport"
        )))
    }

    fn test(&self, _req: &Request) -> StencilResult<bool> {
        Ok(true)
    }

    fn wait(&self, _req: Request) -> StencilResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

// ── In-process fabric hosting N ranks ────────────────────────────────

type MailKey = (usize, usize, Tag); // (src, dst, tag)

struct GatherState {
    generation: u64,
    slots: Vec<Option<Vec<i64>>>,
    published: Vec<Vec<i64>>,
}

/// Shared state connecting the [`LocalTransport`] endpoints of one
/// in-process multi-rank run.
pub struct LocalFabric {
    num_ranks: usize,
    mail: Mutex<HashMap<MailKey, VecDeque<Vec<u8>>>>,
    mail_cv: Condvar,
    gather: Mutex<GatherState>,
    gather_cv: Condvar,
    barrier: Barrier,
}

impl LocalFabric {
    pub fn new(num_ranks: usize) -> Arc<Self> {
        assert!(num_ranks >= 1, "fabric needs at least one rank");
        Arc::new(LocalFabric {
            num_ranks,
            mail: Mutex::new(HashMap::new()),
            mail_cv: Condvar::new(),
            gather: Mutex::new(GatherState {
                generation: 0,
                slots: vec![None; num_ranks],
                published: Vec::new(),
            }),
            gather_cv: Condvar::new(),
            barrier: Barrier::new(num_ranks),
        })
    }

    /// The endpoint for one rank.
    pub fn transport(self: &Arc<Self>, rank: usize) -> LocalTransport {
        assert!(rank < self.num_ranks);
        LocalTransport {
            fabric: Arc::clone(self),
            rank,
        }
    }

    fn check_peer(&self, rank: usize) -> StencilResult<()> {
        if rank >= self.num_ranks {
            return Err(StencilError::Messaging(format!(
                "rank {rank} outside fabric of {} rank(s)",
                self.num_ranks
            )));
        }
        Ok(())
    }
}

/// One rank's endpoint on a [`LocalFabric`].
pub struct LocalTransport {
    fabric: Arc<LocalFabric>,
    rank: usize,
}

impl Transport for LocalTransport {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.fabric.num_ranks
    }

    fn barrier(&self) -> StencilResult<()> {
        self.fabric.barrier.wait();
        Ok(())
    }

    fn allgather(&self, mine: &[i64]) -> StencilResult<Vec<Vec<i64>>> {
        let fabric = &self.fabric;
        let mut st = fabric
            .gather
            .lock()
            .map_err(|_| StencilError::Messaging("poisoned gather lock".into()))?;
        let my_generation = st.generation;
        if st.slots[self.rank].is_some() {
            return Err(StencilError::InternalInvariant(format!(
                "rank {} entered allgather twice in one round",
                self.rank
            )));
        }
        st.slots[self.rank] = Some(mine.to_vec());
        if st.slots.iter().all(|s| s.is_some()) {
            st.published = st
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            st.generation += 1;
            fabric.gather_cv.notify_all();
        } else {
            while st.generation == my_generation {
                st = fabric
                    .gather_cv
                    .wait(st)
                    .map_err(|_| StencilError::Messaging("poisoned gather wait".into()))?;
            }
        }
        Ok(st.published.clone())
    }

    fn isend(&self, to: usize, tag: Tag, payload: Vec<u8>) -> StencilResult<Request> {
        self.fabric.check_peer(to)?;
        let key = (self.rank, to, tag);
        let mut mail = self
            .fabric
            .mail
            .lock()
            .map_err(|_| StencilError::Messaging("poisoned mailbox lock".into()))?;
        mail.entry(key).or_default().push_back(payload);
        self.fabric.mail_cv.notify_all();
        Ok(Request(ReqKind::CompletedSend))
    }

    fn irecv(&self, from: usize, tag: Tag, nbytes: usize) -> StencilResult<Request> {
        self.fabric.check_peer(from)?;
        Ok(Request(ReqKind::Recv {
            from,
            tag,
            nbytes,
        }))
    }

    fn test(&self, req: &Request) -> StencilResult<bool> {
        match &req.0 {
            ReqKind::CompletedSend => Ok(true),
            ReqKind::Recv { from, tag, .. } => {
                let mail = self
                    .fabric
                    .mail
                    .lock()
                    .map_err(|_| StencilError::Messaging("poisoned mailbox lock".into()))?;
                Ok(mail
                    .get(&(*from, self.rank, *tag))
                    .is_some_and(|q| !q.is_empty()))
            }
        }
    }

    fn wait(&self, req: Request) -> StencilResult<Option<Vec<u8>>> {
        match req.0 {
            ReqKind::CompletedSend => Ok(None),
            ReqKind::Recv { from, tag, nbytes } => {
                let key = (from, self.rank, tag);
                let mut mail = self
                    .fabric
                    .mail
                    .lock()
                    .map_err(|_| StencilError::Messaging("poisoned mailbox lock".into()))?;
                loop {
                    if let Some(msg) = mail.get_mut(&key).and_then(|q| q.pop_front()) {
                        if msg.len() != nbytes {
                            return Err(StencilError::Messaging(format!(
                                "message from rank {from} tag {tag} has {} byte(s), expected {nbytes}",
                                msg.len()
                            )));
                        }
                        return Ok(Some(msg));
                    }
                    mail = self
                        .fabric
                        .mail_cv
                        .wait(mail)
                        .map_err(|_| StencilError::Messaging("poisoned mailbox wait".into()))?;
                }
            }
        }
    }
}

/// Serialize a slice of f64 elements into a little-endian byte buffer.
pub fn elems_to_bytes(elems: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elems.len() * 8);
    for v in elems {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Inverse of [`elems_to_bytes`]; the length must be a multiple of 8.
pub fn bytes_to_elems(bytes: &[u8]) -> StencilResult<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(StencilError::Messaging(format!(
            "byte buffer of {} is not a whole number of elements",
            bytes.len()
        )));
    }
    let mut out = Vec::with_capacity(bytes.len() / 8);
    for chunk in bytes.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        out.push(f64::from_le_bytes(raw));
    }
    Ok(out)
}
