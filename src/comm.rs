//! Process-group communication abstraction.
//!
//! The solver core only ever needs two collective facilities: an all-reduce of a single
//! scalar (for norms and inner products) and a pairwise value-block exchange with a fixed
//! set of neighboring ranks (for the halo portion of gather). Everything else about the
//! process runtime is outside the crate.
//!
//! Two implementations ship with the crate: [`LocalComm`] for single-process runs, and
//! [`ThreadedComm`], a channel-backed communicator with one rank per thread that stands in
//! for an MPI-style runtime in tests and shared-memory settings.

use std::sync::mpsc::{channel, Receiver, Sender};

use num::Zero;

use crate::error::CommError;
use crate::Real;

/// A fixed group of cooperating processes ("ranks"), each owning a disjoint partition of
/// elements.
///
/// Both collectives are blocking with respect to their own result: the caller must not use
/// the returned value before the call completes, but unrelated local work is unaffected.
pub trait Communicator<T: Real>: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sum a scalar contribution over every rank. Every rank receives the identical total;
    /// the summation order over ranks is fixed, so the result does not depend on message
    /// arrival order.
    fn all_reduce_sum(&self, local: T) -> Result<T, CommError>;

    /// Sum a counter over every rank (used for global dof and element counts).
    fn all_reduce_sum_u64(&self, local: u64) -> Result<u64, CommError>;

    /// Exchange one value block with each neighboring rank: `send[k]` is delivered to
    /// `neighbors[k]`, and the block received from `neighbors[k]` is written to `recv[k]`.
    ///
    /// Every listed neighbor must concurrently perform the matching exchange.
    fn neighbor_exchange(
        &self,
        neighbors: &[usize],
        send: &[Vec<T>],
        recv: &mut [Vec<T>],
    ) -> Result<(), CommError>;
}

/// The trivial single-process communicator: rank 0 of 1, no neighbors, identity reductions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl<T: Real> Communicator<T> for LocalComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, local: T) -> Result<T, CommError> {
        Ok(local)
    }

    fn all_reduce_sum_u64(&self, local: u64) -> Result<u64, CommError> {
        Ok(local)
    }

    fn neighbor_exchange(
        &self,
        neighbors: &[usize],
        _send: &[Vec<T>],
        _recv: &mut [Vec<T>],
    ) -> Result<(), CommError> {
        debug_assert!(
            neighbors.is_empty(),
            "a single-process run cannot have halo neighbors"
        );
        Ok(())
    }
}

/// A multi-rank communicator backed by `std::sync::mpsc` channels, one rank per thread.
///
/// `ThreadedComm::create(size)` returns one handle per rank; each handle is moved into the
/// thread that plays that rank. Channels are unbounded, so sends never block and the
/// exchange pattern (send everything, then receive everything) cannot deadlock. A peer
/// whose thread has exited renders its channels disconnected, which surfaces as
/// [`CommError::Disconnected`].
#[derive(Debug)]
pub struct ThreadedComm<T> {
    rank: usize,
    size: usize,
    value_tx: Vec<Option<Sender<Vec<T>>>>,
    value_rx: Vec<Option<Receiver<Vec<T>>>>,
    count_tx: Vec<Option<Sender<u64>>>,
    count_rx: Vec<Option<Receiver<u64>>>,
}

impl<T: Real> ThreadedComm<T> {
    /// Create a fully connected group of `size` ranks.
    pub fn create(size: usize) -> Vec<Self> {
        assert!(size > 0, "a communicator needs at least one rank");

        let mut value_tx: Vec<Vec<Option<Sender<Vec<T>>>>> = init_grid(size);
        let mut value_rx: Vec<Vec<Option<Receiver<Vec<T>>>>> = init_grid(size);
        let mut count_tx: Vec<Vec<Option<Sender<u64>>>> = init_grid(size);
        let mut count_rx: Vec<Vec<Option<Receiver<u64>>>> = init_grid(size);

        for src in 0..size {
            for dst in 0..size {
                if src == dst {
                    continue;
                }
                let (tx, rx) = channel();
                value_tx[src][dst] = Some(tx);
                value_rx[dst][src] = Some(rx);
                let (tx, rx) = channel();
                count_tx[src][dst] = Some(tx);
                count_rx[dst][src] = Some(rx);
            }
        }

        let mut comms = Vec::with_capacity(size);
        for rank in 0..size {
            comms.push(Self {
                rank,
                size,
                value_tx: std::mem::take(&mut value_tx[rank]),
                value_rx: std::mem::take(&mut value_rx[rank]),
                count_tx: std::mem::take(&mut count_tx[rank]),
                count_rx: std::mem::take(&mut count_rx[rank]),
            });
        }
        comms
    }
}

fn init_grid<U>(size: usize) -> Vec<Vec<Option<U>>> {
    (0..size)
        .map(|_| (0..size).map(|_| None).collect())
        .collect()
}

impl<T: Real> Communicator<T> for ThreadedComm<T> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce_sum(&self, local: T) -> Result<T, CommError> {
        // Gather one contribution per rank, then sum in rank order so that every rank
        // computes the bitwise identical total.
        let mut contributions = vec![T::zero(); self.size];
        contributions[self.rank] = local;
        for (peer, tx) in self.value_tx.iter().enumerate() {
            if let Some(tx) = tx {
                tx.send(vec![local])
                    .map_err(|_| CommError::Disconnected { rank: peer })?;
            }
        }
        for (peer, rx) in self.value_rx.iter().enumerate() {
            if let Some(rx) = rx {
                let message = rx
                    .recv()
                    .map_err(|_| CommError::Disconnected { rank: peer })?;
                if message.len() != 1 {
                    return Err(CommError::MessageSize {
                        rank: peer,
                        expected: 1,
                        actual: message.len(),
                    });
                }
                contributions[peer] = message[0];
            }
        }
        Ok(contributions
            .iter()
            .fold(T::zero(), |total, &c| total + c))
    }

    fn all_reduce_sum_u64(&self, local: u64) -> Result<u64, CommError> {
        for (peer, tx) in self.count_tx.iter().enumerate() {
            if let Some(tx) = tx {
                tx.send(local)
                    .map_err(|_| CommError::Disconnected { rank: peer })?;
            }
        }
        let mut total = local;
        for (peer, rx) in self.count_rx.iter().enumerate() {
            if let Some(rx) = rx {
                total += rx
                    .recv()
                    .map_err(|_| CommError::Disconnected { rank: peer })?;
            }
        }
        Ok(total)
    }

    fn neighbor_exchange(
        &self,
        neighbors: &[usize],
        send: &[Vec<T>],
        recv: &mut [Vec<T>],
    ) -> Result<(), CommError> {
        assert_eq!(neighbors.len(), send.len());
        assert_eq!(neighbors.len(), recv.len());

        // Post all sends before receiving anything; channels buffer, so this cannot
        // deadlock even when two ranks exchange simultaneously.
        for (&peer, block) in neighbors.iter().zip(send) {
            let tx = self.value_tx[peer]
                .as_ref()
                .ok_or(CommError::Disconnected { rank: peer })?;
            tx.send(block.clone())
                .map_err(|_| CommError::Disconnected { rank: peer })?;
        }
        for (&peer, block) in neighbors.iter().zip(recv.iter_mut()) {
            let rx = self.value_rx[peer]
                .as_ref()
                .ok_or(CommError::Disconnected { rank: peer })?;
            *block = rx
                .recv()
                .map_err(|_| CommError::Disconnected { rank: peer })?;
        }
        Ok(())
    }
}
