//! The gather-scatter engine reconciling element-local, duplicated dofs with the globally
//! unique numbering.
//!
//! Shared mesh nodes appear once per adjacent element in the local representation, and
//! once per touching rank across the process group. [`DofCorrespondence`] maps every local
//! slot to exactly one *gathered* slot (the per-rank segment of the global numbering), and
//! [`GatherScatter`] implements the two directions:
//!
//! - `gather`: reduce all local duplicates of each dof into one value, then combine the
//!   per-rank partial results over the halo so that every rank sharing a dof holds the
//!   identical reduced value;
//! - `scatter`: broadcast each gathered value back to all of its local duplicates (purely
//!   local, since a consistent gathered field already replicates shared dofs per rank).
//!
//! Local reductions are data-parallel over gathered dofs and therefore conflict-free; the
//! only communication is the per-neighbor block exchange inside `gather`.

use std::cell::RefCell;

use itertools::izip;
use num::One;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::comm::Communicator;
use crate::error::{CommError, SetupError};
use crate::mesh::{MeshPartition, UNASSIGNED_NODE};
use crate::Real;

/// Reduction applied to duplicated values during a gather. `Add` is the operator path;
/// `Min`/`Max` are useful for masks and setup queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOp {
    Add,
    Min,
    Max,
}

impl GatherOp {
    fn combine<T: Real>(self, a: T, b: T) -> T {
        match self {
            GatherOp::Add => a + b,
            GatherOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            GatherOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
        }
    }
}

/// The immutable many-to-one map from local node slots to gathered dofs, plus its inverse
/// in compressed form.
///
/// Invariants established at construction: every local slot maps to exactly one gathered
/// dof, and every gathered dof is the image of at least one local slot.
#[derive(Debug, Clone)]
pub struct DofCorrespondence {
    num_local: usize,
    /// Gathered slot for every local slot.
    local_to_gathered: Vec<usize>,
    /// CSR-style inverse: local slots of gathered dof `g` are
    /// `slots[offsets[g]..offsets[g + 1]]`.
    offsets: Vec<usize>,
    slots: Vec<usize>,
    /// Sorted unique global node ids, one per gathered dof.
    global_ids: Vec<u64>,
}

impl DofCorrespondence {
    /// Build the correspondence from raw connectivity: one global node id per local slot.
    pub fn from_global_ids(ids: &[u64]) -> Result<Self, SetupError> {
        let num_local = ids.len();
        let mut pairs = Vec::with_capacity(num_local);
        for (slot, &id) in ids.iter().enumerate() {
            if id == UNASSIGNED_NODE {
                return Err(SetupError::OrphanLocalSlot { slot });
            }
            pairs.push((id, slot));
        }
        pairs.sort_unstable();

        let mut local_to_gathered = vec![0; num_local];
        let mut offsets = Vec::new();
        let mut slots = Vec::with_capacity(num_local);
        let mut global_ids = Vec::new();

        for (id, slot) in pairs {
            if global_ids.last() != Some(&id) {
                global_ids.push(id);
                offsets.push(slots.len());
            }
            local_to_gathered[slot] = global_ids.len() - 1;
            slots.push(slot);
        }
        offsets.push(slots.len());

        let correspondence = Self {
            num_local,
            local_to_gathered,
            offsets,
            slots,
            global_ids,
        };
        correspondence.check_invariants()?;
        Ok(correspondence)
    }

    fn check_invariants(&self) -> Result<(), SetupError> {
        for dof in 0..self.num_gathered() {
            if self.offsets[dof + 1] == self.offsets[dof] {
                return Err(SetupError::EmptyGatheredDof { dof });
            }
        }
        Ok(())
    }

    pub fn num_local(&self) -> usize {
        self.num_local
    }

    pub fn num_gathered(&self) -> usize {
        self.global_ids.len()
    }

    /// The gathered dof a local slot maps to.
    pub fn gathered_of(&self, slot: usize) -> usize {
        self.local_to_gathered[slot]
    }

    /// All local slots carrying duplicates of a gathered dof.
    pub fn duplicates(&self, dof: usize) -> &[usize] {
        &self.slots[self.offsets[dof]..self.offsets[dof + 1]]
    }

    pub fn global_ids(&self) -> &[u64] {
        &self.global_ids
    }

    /// Gathered slot of a global node id, if it is visible on this rank.
    pub fn find(&self, id: u64) -> Option<usize> {
        self.global_ids.binary_search(&id).ok()
    }
}

/// The per-neighbor exchange plan for shared dofs.
#[derive(Debug, Clone)]
struct HaloPlan {
    neighbor_ranks: Vec<usize>,
    /// For each neighbor, the gathered slots of the dofs shared with it.
    indices: Vec<Vec<usize>>,
}

#[derive(Debug)]
struct HaloBuffers<T> {
    send: Vec<Vec<T>>,
    recv: Vec<Vec<T>>,
}

/// Gather-scatter over one mesh partition.
///
/// Halo send/receive buffers are owned by the engine and reused across calls, so repeated
/// gathers allocate nothing.
#[derive(Debug)]
pub struct GatherScatter<T: Real> {
    dofs: DofCorrespondence,
    halo: HaloPlan,
    num_owned: usize,
    num_global: u64,
    /// `1 / (number of ranks that can see the dof)`; the weight that makes inner products
    /// over replicated gathered fields count every unique dof exactly once.
    inverse_multiplicity: Vec<T>,
    buffers: RefCell<HaloBuffers<T>>,
}

impl<T: Real> GatherScatter<T> {
    /// Build the engine from a partition's connectivity and shared-node lists.
    ///
    /// This performs one collective (the global dof count), so every rank of `comm` must
    /// call it together.
    pub fn new<C: Communicator<T>>(
        partition: &MeshPartition,
        comm: &C,
    ) -> Result<Self, SetupError> {
        let dofs = DofCorrespondence::from_global_ids(&partition.global_node_ids)?;

        // Resolve each neighbor's shared ids against the gathered numbering.
        let mut id_to_slot = FxHashMap::default();
        id_to_slot.reserve(dofs.num_gathered());
        for (slot, &id) in dofs.global_ids().iter().enumerate() {
            id_to_slot.insert(id, slot);
        }

        let mut neighbor_ranks = Vec::with_capacity(partition.neighbors.len());
        let mut indices = Vec::with_capacity(partition.neighbors.len());
        for neighbor in &partition.neighbors {
            let mut shared = Vec::with_capacity(neighbor.shared_nodes.len());
            for &id in &neighbor.shared_nodes {
                let slot = *id_to_slot
                    .get(&id)
                    .ok_or(SetupError::UnknownSharedNode {
                        rank: neighbor.rank,
                        id,
                    })?;
                shared.push(slot);
            }
            neighbor_ranks.push(neighbor.rank);
            indices.push(shared);
        }

        // The lowest rank touching a shared dof owns it; owned counts add up to the
        // globally unique dof count.
        let mut owned = vec![true; dofs.num_gathered()];
        for (&rank, shared) in izip!(&neighbor_ranks, &indices) {
            if rank < comm.rank() {
                for &slot in shared {
                    owned[slot] = false;
                }
            }
        }
        let num_owned = owned.iter().filter(|&&o| o).count();
        let num_global = comm.all_reduce_sum_u64(num_owned as u64)?;

        // Rank multiplicity of every gathered dof: 1 plus the number of neighbors that
        // also see it.
        let mut multiplicity = vec![1_u32; dofs.num_gathered()];
        for shared in &indices {
            for &slot in shared {
                multiplicity[slot] += 1;
            }
        }
        let inverse_multiplicity = multiplicity
            .iter()
            .map(|&m| T::one() / T::from_u32(m).expect("rank count must fit in T"))
            .collect();

        log::debug!(
            "gather-scatter: {} local slots, {} gathered dofs ({} owned), {} neighbors",
            dofs.num_local(),
            dofs.num_gathered(),
            num_owned,
            neighbor_ranks.len()
        );

        let num_neighbors = neighbor_ranks.len();
        Ok(Self {
            dofs,
            halo: HaloPlan {
                neighbor_ranks,
                indices,
            },
            num_owned,
            num_global,
            inverse_multiplicity,
            buffers: RefCell::new(HaloBuffers {
                send: vec![Vec::new(); num_neighbors],
                recv: vec![Vec::new(); num_neighbors],
            }),
        })
    }

    pub fn correspondence(&self) -> &DofCorrespondence {
        &self.dofs
    }

    /// Length of one gathered field on this rank.
    pub fn num_gathered(&self) -> usize {
        self.dofs.num_gathered()
    }

    /// Length of one local field on this rank.
    pub fn num_local(&self) -> usize {
        self.dofs.num_local()
    }

    /// Gathered dofs owned by this rank (shared dofs count only for their lowest rank).
    pub fn num_owned(&self) -> usize {
        self.num_owned
    }

    /// Globally unique dof count over all ranks.
    pub fn num_global_dofs(&self) -> u64 {
        self.num_global
    }

    /// Per-dof weight `1 / rank multiplicity`.
    ///
    /// Gathered fields replicate shared dofs on every rank that sees them; reductions
    /// over such fields must scale by this weight to count each unique dof once, or the
    /// halo would be double counted.
    pub fn inverse_multiplicity(&self) -> &[T] {
        &self.inverse_multiplicity
    }

    /// Whether any dof of this partition is shared with another rank.
    pub fn has_halo(&self) -> bool {
        !self.halo.neighbor_ranks.is_empty()
    }

    /// Reduce every local duplicate of each dof into the gathered field, including
    /// duplicates living on other ranks.
    ///
    /// After the call each rank holds, for every dof it can see, the reduction over *all*
    /// local copies on *all* ranks. The floating-point reduction order over ranks is
    /// fixed, but the order over local duplicates is not guaranteed to be reproducible
    /// across partitionings.
    pub fn gather<C: Communicator<T>>(
        &self,
        gathered_out: &mut [T],
        local_in: &[T],
        num_fields: usize,
        op: GatherOp,
        comm: &C,
    ) -> Result<(), CommError> {
        let nl = self.dofs.num_local();
        let ng = self.dofs.num_gathered();
        assert_eq!(local_in.len(), num_fields * nl);
        assert_eq!(gathered_out.len(), num_fields * ng);

        // Bind the correspondence alone: the engine itself is not shareable across the
        // worker threads (it carries the halo buffer cell), the immutable table is.
        let dofs = &self.dofs;
        for field in 0..num_fields {
            let local = &local_in[field * nl..(field + 1) * nl];
            let gathered = &mut gathered_out[field * ng..(field + 1) * ng];
            gathered
                .par_iter_mut()
                .enumerate()
                .for_each(|(dof, value)| {
                    let duplicates = dofs.duplicates(dof);
                    let mut acc = local[duplicates[0]];
                    for &slot in &duplicates[1..] {
                        acc = op.combine(acc, local[slot]);
                    }
                    *value = acc;
                });
        }

        if self.halo.neighbor_ranks.is_empty() {
            return Ok(());
        }

        // Exchange per-rank partial reductions for shared dofs. Every rank packs its own
        // partials before applying anything received, so all sharing ranks converge on the
        // same combined value.
        let buffers = &mut *self.buffers.borrow_mut();
        for (k, shared) in self.halo.indices.iter().enumerate() {
            let send = &mut buffers.send[k];
            send.clear();
            for field in 0..num_fields {
                for &slot in shared {
                    send.push(gathered_out[field * ng + slot]);
                }
            }
        }
        comm.neighbor_exchange(&self.halo.neighbor_ranks, &buffers.send, &mut buffers.recv)?;
        for (k, shared) in self.halo.indices.iter().enumerate() {
            let recv = &buffers.recv[k];
            if recv.len() != num_fields * shared.len() {
                return Err(CommError::MessageSize {
                    rank: self.halo.neighbor_ranks[k],
                    expected: num_fields * shared.len(),
                    actual: recv.len(),
                });
            }
            for field in 0..num_fields {
                for (j, &slot) in shared.iter().enumerate() {
                    let value = &mut gathered_out[field * ng + slot];
                    *value = op.combine(*value, recv[field * shared.len() + j]);
                }
            }
        }
        Ok(())
    }

    /// Broadcast each gathered value to all of its local duplicates.
    pub fn scatter(&self, local_out: &mut [T], gathered_in: &[T], num_fields: usize) {
        let nl = self.dofs.num_local();
        let ng = self.dofs.num_gathered();
        assert_eq!(local_out.len(), num_fields * nl);
        assert_eq!(gathered_in.len(), num_fields * ng);

        let dofs = &self.dofs;
        for field in 0..num_fields {
            let gathered = &gathered_in[field * ng..(field + 1) * ng];
            let local = &mut local_out[field * nl..(field + 1) * nl];
            local.par_iter_mut().enumerate().for_each(|(slot, value)| {
                *value = gathered[dofs.gathered_of(slot)];
            });
        }
    }
}
