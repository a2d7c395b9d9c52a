//! Geometry association: per-vertex records tying mesh entities to CAD
//! topology. A record pins one (node, kind, id) tuple with up to two
//! parametric coordinates and an optional CAD-group reference.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::node::NodeTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeomKind {
    Node,
    Edge,
    Face,
}

impl GeomKind {
    pub const ALL: [GeomKind; 3] = [GeomKind::Node, GeomKind::Edge, GeomKind::Face];

    /// Count of parametric coordinates carried by this kind.
    pub fn param_count(self) -> usize {
        match self {
            GeomKind::Node => 0,
            GeomKind::Edge => 1,
            GeomKind::Face => 2,
        }
    }

    pub fn from_index(index: usize) -> Result<GeomKind> {
        match index {
            0 => Ok(GeomKind::Node),
            1 => Ok(GeomKind::Edge),
            2 => Ok(GeomKind::Face),
            _ => Err(Error::Invalid(format!("geom kind index {index}"))),
        }
    }

    pub fn index(self) -> usize {
        match self {
            GeomKind::Node => 0,
            GeomKind::Edge => 1,
            GeomKind::Face => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GeomRecord {
    pub kind: GeomKind,
    pub id: i64,
    pub param: [f64; 2],
    pub gref: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct GeomTable {
    records: FxHashMap<usize, SmallVec<[GeomRecord; 2]>>,
}

impl GeomTable {
    pub fn new() -> GeomTable {
        GeomTable::default()
    }

    pub fn n(&self) -> usize {
        self.records.values().map(SmallVec::len).sum()
    }

    /// Add or refresh the record keyed by (node, kind, id).
    pub fn add(&mut self, node: usize, kind: GeomKind, id: i64, param: &[f64]) -> Result<()> {
        if param.len() < kind.param_count() {
            return Err(Error::Invalid(format!(
                "{kind:?} id {id} needs {} params",
                kind.param_count()
            )));
        }
        let mut record = GeomRecord {
            kind,
            id,
            param: [0.0; 2],
            gref: None,
        };
        record.param[..kind.param_count()].copy_from_slice(&param[..kind.param_count()]);
        let list = self.records.entry(node).or_default();
        if let Some(existing) = list.iter_mut().find(|r| r.kind == kind && r.id == id) {
            existing.param = record.param;
        } else {
            list.push(record);
        }
        Ok(())
    }

    pub fn set_gref(&mut self, node: usize, kind: GeomKind, id: i64, gref: i64) -> Result<()> {
        let record = self
            .records
            .get_mut(&node)
            .and_then(|list| list.iter_mut().find(|r| r.kind == kind && r.id == id))
            .ok_or_else(|| Error::NotFound(format!("no {kind:?} {id} on node {node}")))?;
        record.gref = Some(gref);
        Ok(())
    }

    pub fn remove_all(&mut self, node: usize) {
        self.records.remove(&node);
    }

    pub fn find(&self, node: usize, kind: GeomKind, id: i64) -> Option<&GeomRecord> {
        self.records
            .get(&node)?
            .iter()
            .find(|r| r.kind == kind && r.id == id)
    }

    pub fn records_of(&self, node: usize) -> &[GeomRecord] {
        self.records.get(&node).map_or(&[], |list| list.as_slice())
    }

    /// The single id of `kind` on `node`; `NotFound` without one, `Invalid`
    /// when several are attached.
    pub fn unique_id(&self, node: usize, kind: GeomKind) -> Result<i64> {
        let mut ids = self
            .records_of(node)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.id);
        let first = ids
            .next()
            .ok_or_else(|| Error::NotFound(format!("no {kind:?} on node {node}")))?;
        if ids.next().is_some() {
            return Err(Error::Invalid(format!("ambiguous {kind:?} on node {node}")));
        }
        Ok(first)
    }

    pub fn nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.records.keys().copied()
    }

    /// Seed `new_node` with the parametric midpoint of every edge or face
    /// record shared by both endpoints; a CAD collaborator may re-snap the
    /// parameters later.
    pub fn add_between(&mut self, node0: usize, node1: usize, t: f64, new_node: usize) -> Result<()> {
        let shared: Vec<(GeomKind, i64, [f64; 2])> = self
            .records_of(node0)
            .iter()
            .filter(|r0| r0.kind != GeomKind::Node)
            .filter_map(|r0| {
                self.find(node1, r0.kind, r0.id).map(|r1| {
                    let mut param = [0.0; 2];
                    for i in 0..r0.kind.param_count() {
                        param[i] = (1.0 - t) * r0.param[i] + t * r1.param[i];
                    }
                    (r0.kind, r0.id, param)
                })
            })
            .collect();
        for (kind, id, param) in shared {
            self.add(new_node, kind, id, &param)?;
        }
        Ok(())
    }

    /// Replicate each ghost node's records from its owner.
    pub fn ghost(&mut self, comm: &Comm, nodes: &NodeTable) -> Result<()> {
        let mut ghosts: Vec<usize> = nodes
            .iter_valid()
            .filter(|&local| !nodes.owned(local))
            .collect();
        ghosts.sort_by_key(|&local| nodes.global(local));
        let owners: Vec<usize> = ghosts.iter().map(|&local| nodes.part(local)).collect();
        let globals: Vec<i64> = ghosts.iter().map(|&local| nodes.global(local)).collect();
        let ret: Vec<i64> = vec![comm.rank() as i64; ghosts.len()];

        let asked_globals = comm.blindsend_ints(&owners, &globals, 1);
        let asked_ret = comm.blindsend_ints(&owners, &ret, 1);

        // one reply record = (node global, kind, id, has_gref, gref) + params
        let mut reply_dest = Vec::new();
        let mut reply_ints = Vec::new();
        let mut reply_dbls = Vec::new();
        for (slot, &global) in asked_globals.iter().enumerate() {
            let local = nodes.local(global)?;
            for record in self.records_of(local) {
                reply_dest.push(asked_ret[slot] as usize);
                reply_ints.extend_from_slice(&[
                    global,
                    record.kind.index() as i64,
                    record.id,
                    i64::from(record.gref.is_some()),
                    record.gref.unwrap_or(0),
                ]);
                reply_dbls.extend_from_slice(&record.param);
            }
        }
        let got_ints = comm.blindsend_ints(&reply_dest, &reply_ints, 5);
        let got_dbls = comm.blindsend_dbls(&reply_dest, &reply_dbls, 2);

        for slot in 0..got_ints.len() / 5 {
            let global = got_ints[5 * slot];
            let kind = GeomKind::from_index(got_ints[5 * slot + 1] as usize)?;
            let id = got_ints[5 * slot + 2];
            let local = nodes.local(global)?;
            let param = [got_dbls[2 * slot], got_dbls[2 * slot + 1]];
            self.add(local, kind, id, &param)?;
            if got_ints[5 * slot + 3] != 0 {
                self.set_gref(local, kind, id, got_ints[5 * slot + 4])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn add_is_idempotent_per_key() {
        let mut geom = GeomTable::new();
        geom.add(3, GeomKind::Face, 2, &[0.1, 0.2]).unwrap();
        geom.add(3, GeomKind::Face, 2, &[0.3, 0.4]).unwrap();
        assert_eq!(geom.n(), 1);
        let record = geom.find(3, GeomKind::Face, 2).unwrap();
        assert_abs_diff_eq!(record.param[0], 0.3);
    }

    #[test]
    fn unique_id_detects_ambiguity() {
        let mut geom = GeomTable::new();
        geom.add(0, GeomKind::Edge, 5, &[0.5]).unwrap();
        assert_eq!(geom.unique_id(0, GeomKind::Edge).unwrap(), 5);
        geom.add(0, GeomKind::Edge, 6, &[0.6]).unwrap();
        assert!(matches!(
            geom.unique_id(0, GeomKind::Edge),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            geom.unique_id(0, GeomKind::Face),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn add_between_interpolates_shared_records() {
        let mut geom = GeomTable::new();
        geom.add(0, GeomKind::Edge, 4, &[0.0]).unwrap();
        geom.add(1, GeomKind::Edge, 4, &[1.0]).unwrap();
        geom.add(0, GeomKind::Face, 9, &[0.0, 2.0]).unwrap();
        geom.add(1, GeomKind::Face, 9, &[1.0, 4.0]).unwrap();
        // a record only node 0 carries must not leak to the midpoint
        geom.add(0, GeomKind::Face, 11, &[5.0, 5.0]).unwrap();
        geom.add_between(0, 1, 0.5, 7).unwrap();
        let edge = geom.find(7, GeomKind::Edge, 4).unwrap();
        assert_abs_diff_eq!(edge.param[0], 0.5);
        let face = geom.find(7, GeomKind::Face, 9).unwrap();
        assert_abs_diff_eq!(face.param[0], 0.5);
        assert_abs_diff_eq!(face.param[1], 3.0);
        assert!(geom.find(7, GeomKind::Face, 11).is_none());
    }

    #[test]
    fn remove_all_clears_node() {
        let mut geom = GeomTable::new();
        geom.add(2, GeomKind::Node, 1, &[]).unwrap();
        geom.remove_all(2);
        assert_eq!(geom.records_of(2).len(), 0);
    }
}
