//! Per-element-kind cell tables with chained node-to-cell adjacency.
//!
//! Node ordering conventions: tets are right-handed; pyramids carry the quad
//! base (0,1,2,3) under apex 4; prisms stack triangle (3,4,5) over (0,1,2);
//! hexes stack quad (4,5,6,7) over (0,1,2,3). Boundary kinds (tri, qua, edg)
//! carry a trailing surface id.

use arrayvec::ArrayVec;

use crate::adj::Adj;
use crate::error::{Error, Result};

pub const MAX_NODE_PER: usize = 8;

/// Node tuple of one cell, arity bounded by the hex.
pub type CellNodes = ArrayVec<usize, MAX_NODE_PER>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellKind {
    Tet,
    Pyr,
    Pri,
    Hex,
    Tri,
    Qua,
    Edg,
}

impl CellKind {
    pub const ALL: [CellKind; 7] = [
        CellKind::Tet,
        CellKind::Pyr,
        CellKind::Pri,
        CellKind::Hex,
        CellKind::Tri,
        CellKind::Qua,
        CellKind::Edg,
    ];

    pub const VOLUME: [CellKind; 4] = [CellKind::Tet, CellKind::Pyr, CellKind::Pri, CellKind::Hex];

    pub fn node_per(self) -> usize {
        match self {
            CellKind::Tet => 4,
            CellKind::Pyr => 5,
            CellKind::Pri => 6,
            CellKind::Hex => 8,
            CellKind::Tri => 3,
            CellKind::Qua => 4,
            CellKind::Edg => 2,
        }
    }

    /// Boundary kinds carry a trailing surface id in file formats.
    pub fn has_id(self) -> bool {
        matches!(self, CellKind::Tri | CellKind::Qua | CellKind::Edg)
    }

    pub fn dimension(self) -> usize {
        match self {
            CellKind::Tet | CellKind::Pyr | CellKind::Pri | CellKind::Hex => 3,
            CellKind::Tri | CellKind::Qua => 2,
            CellKind::Edg => 1,
        }
    }

    /// Faces as quads; triangular faces repeat their first node in slot 3.
    pub fn faces(self) -> &'static [[usize; 4]] {
        match self {
            CellKind::Tet => &[[1, 3, 2, 1], [0, 2, 3, 0], [0, 3, 1, 0], [0, 1, 2, 0]],
            CellKind::Pyr => &[
                [0, 3, 2, 1],
                [0, 1, 4, 0],
                [1, 2, 4, 1],
                [2, 3, 4, 2],
                [3, 0, 4, 3],
            ],
            CellKind::Pri => &[
                [0, 2, 1, 0],
                [3, 4, 5, 3],
                [0, 1, 4, 3],
                [1, 2, 5, 4],
                [2, 0, 3, 5],
            ],
            CellKind::Hex => &[
                [0, 3, 2, 1],
                [4, 5, 6, 7],
                [0, 1, 5, 4],
                [1, 2, 6, 5],
                [2, 3, 7, 6],
                [3, 0, 4, 7],
            ],
            CellKind::Tri | CellKind::Qua | CellKind::Edg => &[],
        }
    }

    /// Node-index pairs forming the edges of this kind.
    pub fn edges(self) -> &'static [[usize; 2]] {
        match self {
            CellKind::Tet => &[[0, 1], [0, 2], [0, 3], [1, 2], [1, 3], [2, 3]],
            CellKind::Pyr => &[
                [0, 1],
                [1, 2],
                [2, 3],
                [3, 0],
                [0, 4],
                [1, 4],
                [2, 4],
                [3, 4],
            ],
            CellKind::Pri => &[
                [0, 1],
                [1, 2],
                [2, 0],
                [3, 4],
                [4, 5],
                [5, 3],
                [0, 3],
                [1, 4],
                [2, 5],
            ],
            CellKind::Hex => &[
                [0, 1],
                [1, 2],
                [2, 3],
                [3, 0],
                [4, 5],
                [5, 6],
                [6, 7],
                [7, 4],
                [0, 4],
                [1, 5],
                [2, 6],
                [3, 7],
            ],
            CellKind::Tri => &[[0, 1], [1, 2], [2, 0]],
            CellKind::Qua => &[[0, 1], [1, 2], [2, 3], [3, 0]],
            CellKind::Edg => &[[0, 1]],
        }
    }
}

const FREE: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct CellTable {
    kind: CellKind,
    nodes: Vec<usize>,
    id: Vec<i64>,
    free: Vec<usize>,
    n: usize,
    adj: Adj,
}

impl CellTable {
    pub fn new(kind: CellKind) -> CellTable {
        CellTable {
            kind,
            nodes: Vec::new(),
            id: Vec::new(),
            free: Vec::new(),
            n: 0,
            adj: Adj::new(),
        }
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn max(&self) -> usize {
        if self.nodes.is_empty() {
            0
        } else {
            self.nodes.len() / self.kind.node_per()
        }
    }

    pub fn valid(&self, cell: usize) -> bool {
        cell < self.max() && self.nodes[cell * self.kind.node_per()] != FREE
    }

    /// Add a cell; re-adding an identical node multiset returns the existing
    /// cell.
    pub fn add(&mut self, nodes: &[usize]) -> Result<usize> {
        self.add_with_id(nodes, 0)
    }

    pub fn add_with_id(&mut self, nodes: &[usize], id: i64) -> Result<usize> {
        let node_per = self.kind.node_per();
        if nodes.len() != node_per {
            return Err(Error::Invalid(format!(
                "{:?} takes {node_per} nodes, got {}",
                self.kind,
                nodes.len()
            )));
        }
        if let Some(existing) = self.with_nodes(nodes) {
            return Ok(existing);
        }
        let cell = if let Some(slot) = self.free.pop() {
            slot
        } else {
            self.nodes.resize(self.nodes.len() + node_per, FREE);
            self.id.push(0);
            self.max() - 1
        };
        self.nodes[cell * node_per..(cell + 1) * node_per].copy_from_slice(nodes);
        self.id[cell] = id;
        for &node in nodes {
            self.adj.add(node, cell);
        }
        self.n += 1;
        Ok(cell)
    }

    pub fn remove(&mut self, cell: usize) -> Result<()> {
        if !self.valid(cell) {
            return Err(Error::Invalid(format!(
                "remove of invalid {:?} {cell}",
                self.kind
            )));
        }
        let node_per = self.kind.node_per();
        for slot in 0..node_per {
            let node = self.nodes[cell * node_per + slot];
            self.adj.remove(node, cell);
        }
        self.nodes[cell * node_per] = FREE;
        self.free.push(cell);
        self.n -= 1;
        Ok(())
    }

    pub fn nodes_of(&self, cell: usize) -> Result<&[usize]> {
        if !self.valid(cell) {
            return Err(Error::Invalid(format!("invalid {:?} {cell}", self.kind)));
        }
        let node_per = self.kind.node_per();
        Ok(&self.nodes[cell * node_per..(cell + 1) * node_per])
    }

    pub fn surface_id(&self, cell: usize) -> Result<i64> {
        if !self.valid(cell) {
            return Err(Error::Invalid(format!("invalid {:?} {cell}", self.kind)));
        }
        Ok(self.id[cell])
    }

    pub fn valid_cells(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.max()).filter(|&cell| self.valid(cell))
    }

    pub fn cells_having_node(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.adj.items(node)
    }

    pub fn node_empty(&self, node: usize) -> bool {
        self.adj.empty(node)
    }

    /// Any one cell incident to `node`.
    pub fn first_with(&self, node: usize) -> Option<usize> {
        self.adj.items(node).next()
    }

    /// The cell whose node multiset equals `nodes`, if present.
    pub fn with_nodes(&self, nodes: &[usize]) -> Option<usize> {
        let mut wanted: CellNodes = nodes.iter().copied().collect();
        wanted.sort_unstable();
        self.cells_having_node(nodes[0]).find(|&cell| {
            let mut have: CellNodes = self.nodes_of(cell).unwrap().iter().copied().collect();
            have.sort_unstable();
            have == wanted
        })
    }

    /// The up-to-two cells sharing a face. Triangular faces are passed as
    /// quads with a duplicated node.
    pub fn cells_with_face(&self, face: &[usize; 4]) -> (Option<usize>, Option<usize>) {
        let mut distinct: CellNodes = ArrayVec::new();
        for &node in face {
            if !distinct.contains(&node) {
                distinct.push(node);
            }
        }
        let mut found = (None, None);
        for cell in self.cells_having_node(distinct[0]) {
            let cell_nodes = match self.nodes_of(cell) {
                Ok(cell_nodes) => cell_nodes,
                Err(_) => continue,
            };
            if distinct.iter().all(|node| cell_nodes.contains(node)) {
                match found {
                    (None, _) => found.0 = Some(cell),
                    (Some(first), None) if first != cell => found.1 = Some(cell),
                    _ => {}
                }
            }
        }
        found
    }

    /// Cells containing both endpoints of a side.
    pub fn cells_with_side(&self, node0: usize, node1: usize) -> Vec<usize> {
        self.cells_having_node(node0)
            .filter(|&cell| {
                self.nodes_of(cell)
                    .map(|cell_nodes| cell_nodes.contains(&node1))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Distinct nodes sharing a cell with `node`, excluding `node` itself.
    pub fn node_list_around(&self, node: usize, limit: usize) -> Result<Vec<usize>> {
        let mut list = Vec::new();
        for cell in self.cells_having_node(node) {
            for &other in self.nodes_of(cell)? {
                if other != node && !list.contains(&other) {
                    if list.len() >= limit {
                        return Err(Error::IncreaseLimit(format!(
                            "node list around {node} exceeds {limit}"
                        )));
                    }
                    list.push(other);
                }
            }
        }
        Ok(list)
    }

    /// Distinct surface ids on cells around `node`.
    pub fn id_list_around(&self, node: usize, limit: usize) -> Result<Vec<i64>> {
        let mut list = Vec::new();
        for cell in self.cells_having_node(node) {
            let id = self.surface_id(cell)?;
            if !list.contains(&id) {
                if list.len() >= limit {
                    return Err(Error::IncreaseLimit(format!(
                        "id list around {node} exceeds {limit}"
                    )));
                }
                list.push(id);
            }
        }
        Ok(list)
    }

    /// Remap node indices after a compaction; cells touching a dropped node
    /// are removed.
    pub fn renumber(&mut self, old_to_new: &[usize]) -> Result<()> {
        let node_per = self.kind.node_per();
        let cells: Vec<usize> = self.valid_cells().collect();
        let mut keep = Vec::with_capacity(cells.len());
        for cell in cells {
            let mut mapped: CellNodes = ArrayVec::new();
            let mut alive = true;
            for &node in self.nodes_of(cell)? {
                let new = old_to_new.get(node).copied().unwrap_or(usize::MAX);
                if new == usize::MAX {
                    alive = false;
                    break;
                }
                mapped.push(new);
            }
            let id = self.id[cell];
            if alive {
                keep.push((mapped, id));
            }
        }
        self.nodes.clear();
        self.id.clear();
        self.free.clear();
        self.n = 0;
        self.adj = Adj::new();
        for (mapped, id) in keep {
            let cell = if let Some(slot) = self.free.pop() {
                slot
            } else {
                self.nodes.resize(self.nodes.len() + node_per, FREE);
                self.id.push(0);
                self.max() - 1
            };
            self.nodes[cell * node_per..(cell + 1) * node_per].copy_from_slice(&mapped);
            self.id[cell] = id;
            for &node in &mapped {
                self.adj.add(node, cell);
            }
            self.n += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_lookup() {
        let mut tets = CellTable::new(CellKind::Tet);
        let cell = tets.add(&[0, 1, 2, 3]).unwrap();
        assert_eq!(tets.n(), 1);
        assert_eq!(tets.nodes_of(cell).unwrap(), &[0, 1, 2, 3]);
        assert!(tets.cells_having_node(2).any(|c| c == cell));
        assert!(tets.node_empty(9));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut tets = CellTable::new(CellKind::Tet);
        let a = tets.add(&[0, 1, 2, 3]).unwrap();
        let b = tets.add(&[1, 0, 3, 2]).unwrap();
        assert_eq!(a, b);
        assert_eq!(tets.n(), 1);
    }

    #[test]
    fn wrong_arity_is_invalid() {
        let mut tets = CellTable::new(CellKind::Tet);
        assert!(tets.add(&[0, 1, 2]).is_err());
    }

    #[test]
    fn remove_unlinks_adjacency() {
        let mut tets = CellTable::new(CellKind::Tet);
        let cell = tets.add(&[0, 1, 2, 3]).unwrap();
        tets.add(&[1, 2, 3, 4]).unwrap();
        tets.remove(cell).unwrap();
        assert_eq!(tets.n(), 1);
        assert!(!tets.valid(cell));
        assert!(tets.cells_having_node(0).next().is_none());
        assert_eq!(tets.cells_having_node(4).count(), 1);
    }

    #[test]
    fn cells_with_face_finds_both_sides() {
        let mut tets = CellTable::new(CellKind::Tet);
        let a = tets.add(&[0, 1, 2, 3]).unwrap();
        let b = tets.add(&[1, 2, 3, 4]).unwrap();
        let (c0, c1) = tets.cells_with_face(&[1, 2, 3, 1]);
        let mut pair = [c0.unwrap(), c1.unwrap()];
        pair.sort_unstable();
        assert_eq!(pair, [a, b]);
        let (only, none) = tets.cells_with_face(&[0, 1, 2, 0]);
        assert_eq!(only, Some(a));
        assert!(none.is_none());
    }

    #[test]
    fn side_and_around_queries() {
        let mut tets = CellTable::new(CellKind::Tet);
        tets.add(&[0, 1, 2, 3]).unwrap();
        tets.add(&[1, 2, 3, 4]).unwrap();
        assert_eq!(tets.cells_with_side(1, 2).len(), 2);
        assert_eq!(tets.cells_with_side(0, 4).len(), 0);
        let mut around = tets.node_list_around(1, 100).unwrap();
        around.sort_unstable();
        assert_eq!(around, vec![0, 2, 3, 4]);
        assert!(matches!(
            tets.node_list_around(1, 2),
            Err(Error::IncreaseLimit(_))
        ));
    }

    #[test]
    fn surface_ids_tracked_for_boundary_kinds() {
        let mut tris = CellTable::new(CellKind::Tri);
        let cell = tris.add_with_id(&[0, 1, 2], 7).unwrap();
        assert_eq!(tris.surface_id(cell).unwrap(), 7);
        let ids = tris.id_list_around(1, 10).unwrap();
        assert_eq!(ids, vec![7]);
    }

    #[test]
    fn renumber_drops_cells_on_dead_nodes() {
        let mut tets = CellTable::new(CellKind::Tet);
        tets.add(&[0, 1, 2, 3]).unwrap();
        tets.add(&[1, 2, 3, 4]).unwrap();
        // node 4 dropped, node k -> k for the rest
        let old_to_new = vec![0, 1, 2, 3, usize::MAX];
        tets.renumber(&old_to_new).unwrap();
        assert_eq!(tets.n(), 1);
        let cell = tets.valid_cells().next().unwrap();
        assert_eq!(tets.nodes_of(cell).unwrap(), &[0, 1, 2, 3]);
    }
}
