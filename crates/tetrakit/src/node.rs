//! Vertex storage: positions, global ids, ownership, and the metric field.
//!
//! Slots are recycled through a free list, globals map bijectively to valid
//! locals, and the metric is carried in log form so interpolation and
//! averaging stay SPD under plain arithmetic.

use rustc_hash::FxHashMap;

use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::matrix::{self, SymMat};

const UNSET: i64 = -1;

#[derive(Debug, Clone)]
pub struct NodeTable {
    rank: usize,
    global: Vec<i64>,
    part: Vec<usize>,
    xyz: Vec<[f64; 3]>,
    log_metric: Vec<SymMat>,
    free: Vec<usize>,
    global_to_local: FxHashMap<i64, usize>,
    n_global: i64,
}

impl NodeTable {
    pub fn new(rank: usize) -> NodeTable {
        NodeTable {
            rank,
            global: Vec::new(),
            part: Vec::new(),
            xyz: Vec::new(),
            log_metric: Vec::new(),
            free: Vec::new(),
            global_to_local: FxHashMap::default(),
            n_global: 0,
        }
    }

    /// Highest slot index plus one, spanning free slots too.
    pub fn max(&self) -> usize {
        self.global.len()
    }

    /// Count of valid slots.
    pub fn n(&self) -> usize {
        self.global_to_local.len()
    }

    pub fn n_global(&self) -> i64 {
        self.n_global
    }

    /// Record the global vertex count before a partitioned read.
    pub fn initialize_n_global(&mut self, n_global: i64) {
        self.n_global = n_global;
    }

    /// New globals created by operators extend the global range.
    pub fn next_global(&mut self) -> i64 {
        let next = self.n_global;
        self.n_global += 1;
        next
    }

    /// Add (or find) the slot carrying `global`.
    pub fn add(&mut self, global: i64) -> Result<usize> {
        if global < 0 {
            return Err(Error::Invalid(format!("negative global id {global}")));
        }
        if let Some(&local) = self.global_to_local.get(&global) {
            return Ok(local);
        }
        let local = if let Some(slot) = self.free.pop() {
            self.global[slot] = global;
            self.part[slot] = self.rank;
            self.xyz[slot] = [0.0; 3];
            self.log_metric[slot] = [0.0; 6];
            slot
        } else {
            self.global.push(global);
            self.part.push(self.rank);
            self.xyz.push([0.0; 3]);
            self.log_metric.push([0.0; 6]);
            self.global.len() - 1
        };
        self.global_to_local.insert(global, local);
        self.n_global = self.n_global.max(global + 1);
        Ok(local)
    }

    pub fn remove(&mut self, local: usize) -> Result<()> {
        if !self.valid(local) {
            return Err(Error::Invalid(format!("remove of invalid node {local}")));
        }
        self.global_to_local.remove(&self.global[local]);
        self.global[local] = UNSET;
        self.free.push(local);
        Ok(())
    }

    pub fn valid(&self, local: usize) -> bool {
        local < self.global.len() && self.global[local] != UNSET
    }

    pub fn owned(&self, local: usize) -> bool {
        self.part[local] == self.rank
    }

    pub fn part(&self, local: usize) -> usize {
        self.part[local]
    }

    pub fn set_part(&mut self, local: usize, part: usize) {
        self.part[local] = part;
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn global(&self, local: usize) -> i64 {
        self.global[local]
    }

    /// Local slot of `global`, or `NotFound` when it lives elsewhere.
    pub fn local(&self, global: i64) -> Result<usize> {
        self.global_to_local
            .get(&global)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("global {global} not local")))
    }

    pub fn xyz(&self, local: usize) -> &[f64; 3] {
        &self.xyz[local]
    }

    pub fn set_xyz(&mut self, local: usize, xyz: [f64; 3]) {
        self.xyz[local] = xyz;
    }

    pub fn metric_get_log(&self, local: usize) -> &SymMat {
        &self.log_metric[local]
    }

    pub fn metric_set_log(&mut self, local: usize, log_m: SymMat) {
        self.log_metric[local] = log_m;
    }

    pub fn metric_get(&self, local: usize) -> Result<SymMat> {
        matrix::exp_m(&self.log_metric[local])
    }

    pub fn metric_set(&mut self, local: usize, m: &SymMat) -> Result<()> {
        self.log_metric[local] = matrix::log_m(m)?;
        Ok(())
    }

    /// Valid slots in slot order.
    pub fn iter_valid(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.global.len()).filter(|&local| self.global[local] != UNSET)
    }

    pub fn location(&self, local: usize) -> String {
        if !self.valid(local) {
            return format!("node {local} invalid");
        }
        format!(
            "node {local} global {} part {} xyz {:e} {:e} {:e}",
            self.global[local], self.part[local], self.xyz[local][0], self.xyz[local][1],
            self.xyz[local][2]
        )
    }

    /// Renumber valid slots to the dense range [0, n); returns
    /// (old_to_new, new_to_old) with `usize::MAX` marking dropped slots.
    pub fn compact(&mut self) -> (Vec<usize>, Vec<usize>) {
        let old_max = self.global.len();
        let mut old_to_new = vec![usize::MAX; old_max];
        let mut new_to_old = Vec::with_capacity(self.n());
        for old in 0..old_max {
            if self.global[old] != UNSET {
                old_to_new[old] = new_to_old.len();
                new_to_old.push(old);
            }
        }
        let mut global = Vec::with_capacity(new_to_old.len());
        let mut part = Vec::with_capacity(new_to_old.len());
        let mut xyz = Vec::with_capacity(new_to_old.len());
        let mut log_metric = Vec::with_capacity(new_to_old.len());
        for &old in &new_to_old {
            global.push(self.global[old]);
            part.push(self.part[old]);
            xyz.push(self.xyz[old]);
            log_metric.push(self.log_metric[old]);
        }
        self.global = global;
        self.part = part;
        self.xyz = xyz;
        self.log_metric = log_metric;
        self.free.clear();
        self.global_to_local.clear();
        for (local, &g) in self.global.iter().enumerate() {
            self.global_to_local.insert(g, local);
        }
        (old_to_new, new_to_old)
    }

    /// Refresh a per-node field on ghost copies from each vertex's owner.
    /// Requests are ordered by global id so the exchange is a pure function
    /// of the global numbering.
    pub fn ghost_sync_dbl(&self, comm: &Comm, field: &mut [f64], ldim: usize) -> Result<()> {
        let mut needs: Vec<usize> = self
            .iter_valid()
            .filter(|&local| !self.owned(local))
            .collect();
        needs.sort_by_key(|&local| self.global[local]);
        let owners: Vec<usize> = needs.iter().map(|&local| self.part[local]).collect();
        let globals: Vec<i64> = needs.iter().map(|&local| self.global[local]).collect();
        let ret: Vec<i64> = vec![self.rank as i64; needs.len()];

        let asked_globals = comm.blindsend_ints(&owners, &globals, 1);
        let asked_ret = comm.blindsend_ints(&owners, &ret, 1);

        let back_dest: Vec<usize> = asked_ret.iter().map(|&r| r as usize).collect();
        let mut values = Vec::with_capacity(asked_globals.len() * ldim);
        for &global in &asked_globals {
            let local = self.local(global)?;
            values.extend_from_slice(&field[local * ldim..(local + 1) * ldim]);
        }
        let back_globals = comm.blindsend_ints(&back_dest, &asked_globals, 1);
        let back_values = comm.blindsend_dbls(&back_dest, &values, ldim);

        for (slot, &global) in back_globals.iter().enumerate() {
            let local = self.local(global)?;
            field[local * ldim..(local + 1) * ldim]
                .copy_from_slice(&back_values[slot * ldim..(slot + 1) * ldim]);
        }
        Ok(())
    }

    /// Integer twin of [`NodeTable::ghost_sync_dbl`].
    pub fn ghost_sync_int(&self, comm: &Comm, field: &mut [i64], ldim: usize) -> Result<()> {
        let mut needs: Vec<usize> = self
            .iter_valid()
            .filter(|&local| !self.owned(local))
            .collect();
        needs.sort_by_key(|&local| self.global[local]);
        let owners: Vec<usize> = needs.iter().map(|&local| self.part[local]).collect();
        let globals: Vec<i64> = needs.iter().map(|&local| self.global[local]).collect();
        let ret: Vec<i64> = vec![self.rank as i64; needs.len()];

        let asked_globals = comm.blindsend_ints(&owners, &globals, 1);
        let asked_ret = comm.blindsend_ints(&owners, &ret, 1);

        let back_dest: Vec<usize> = asked_ret.iter().map(|&r| r as usize).collect();
        let mut values = Vec::with_capacity(asked_globals.len() * ldim);
        for &global in &asked_globals {
            let local = self.local(global)?;
            values.extend_from_slice(&field[local * ldim..(local + 1) * ldim]);
        }
        let back_globals = comm.blindsend_ints(&back_dest, &asked_globals, 1);
        let back_values = comm.blindsend_ints(&back_dest, &values, ldim);

        for (slot, &global) in back_globals.iter().enumerate() {
            let local = self.local(global)?;
            field[local * ldim..(local + 1) * ldim]
                .copy_from_slice(&back_values[slot * ldim..(slot + 1) * ldim]);
        }
        Ok(())
    }

    /// Refresh ghost positions and metrics from their owners.
    pub fn ghost_real(&mut self, comm: &Comm) -> Result<()> {
        let max = self.max();
        let mut xyz_field = vec![0.0; 3 * max];
        let mut log_field = vec![0.0; 6 * max];
        for local in self.iter_valid() {
            xyz_field[3 * local..3 * local + 3].copy_from_slice(&self.xyz[local]);
            log_field[6 * local..6 * local + 6].copy_from_slice(&self.log_metric[local]);
        }
        self.ghost_sync_dbl(comm, &mut xyz_field, 3)?;
        self.ghost_sync_dbl(comm, &mut log_field, 6)?;
        for local in 0..max {
            if self.valid(local) && !self.owned(local) {
                self.xyz[local]
                    .copy_from_slice(&xyz_field[3 * local..3 * local + 3]);
                self.log_metric[local]
                    .copy_from_slice(&log_field[6 * local..6 * local + 6]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::with_fabric;
    use approx::assert_abs_diff_eq;

    #[test]
    fn add_is_idempotent_per_global() {
        let mut nodes = NodeTable::new(0);
        let a = nodes.add(10).unwrap();
        let b = nodes.add(10).unwrap();
        assert_eq!(a, b);
        assert_eq!(nodes.n(), 1);
        assert_eq!(nodes.global(a), 10);
    }

    #[test]
    fn remove_recycles_slot() {
        let mut nodes = NodeTable::new(0);
        let a = nodes.add(0).unwrap();
        nodes.add(1).unwrap();
        nodes.remove(a).unwrap();
        assert!(!nodes.valid(a));
        assert!(nodes.local(0).is_err());
        let c = nodes.add(2).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn metric_round_trip() {
        let mut nodes = NodeTable::new(0);
        let local = nodes.add(0).unwrap();
        let m = [100.0, 0.0, 0.0, 100.0, 0.0, 4.0];
        nodes.metric_set(local, &m).unwrap();
        let back = nodes.metric_get(local).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(m[i], back[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn compact_is_dense_and_invertible() {
        let mut nodes = NodeTable::new(0);
        for global in 0..5 {
            nodes.add(global).unwrap();
        }
        nodes.remove(1).unwrap();
        nodes.remove(3).unwrap();
        let (old_to_new, new_to_old) = nodes.compact();
        assert_eq!(nodes.n(), 3);
        assert_eq!(nodes.max(), 3);
        for (new, &old) in new_to_old.iter().enumerate() {
            assert_eq!(old_to_new[old], new);
        }
        for local in 0..nodes.max() {
            assert!(nodes.valid(local));
            assert_eq!(nodes.local(nodes.global(local)).unwrap(), local);
        }
    }

    #[test]
    fn ghost_sync_pulls_owner_values() {
        let results = with_fabric(2, |comm| {
            let mut nodes = NodeTable::new(comm.rank());
            // global 0 owned by rank 0, global 1 owned by rank 1; both ranks
            // hold both
            let n0 = nodes.add(0).unwrap();
            let n1 = nodes.add(1).unwrap();
            nodes.set_part(n0, 0);
            nodes.set_part(n1, 1);
            let mut field = vec![0.0; 2];
            field[if comm.rank() == 0 { n0 } else { n1 }] = 7.0 + comm.rank() as f64;
            nodes.ghost_sync_dbl(&comm, &mut field, 1).unwrap();
            field
        });
        assert_eq!(results[0], vec![7.0, 8.0]);
        assert_eq!(results[1], vec![7.0, 8.0]);
    }
}
