//! The mesh context: one value holding the node table, the per-kind cell
//! tables, geometry association, and this partition's comm endpoint. Every
//! operation in the crate threads a `Grid` (or pieces of it) explicitly;
//! there is no process-wide mesh state.

use std::sync::Arc;

use crate::cell::{CellKind, CellTable};
use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::geom::GeomTable;
use crate::node::NodeTable;

pub struct Grid {
    pub comm: Arc<Comm>,
    pub nodes: NodeTable,
    tet: CellTable,
    pyr: CellTable,
    pri: CellTable,
    hex: CellTable,
    tri: CellTable,
    qua: CellTable,
    edg: CellTable,
    pub geom: GeomTable,
    pub twod: bool,
    /// Opaque CAD representation carried through I/O (byte-flow section).
    pub cad_data: Vec<u8>,
}

impl Grid {
    pub fn create(comm: Comm) -> Grid {
        Grid::create_shared(Arc::new(comm))
    }

    /// Build a grid on an endpoint already shared with another grid of the
    /// same fabric (donor and receptor meshes exchange on one comm).
    pub fn create_shared(comm: Arc<Comm>) -> Grid {
        let rank = comm.rank();
        Grid {
            comm,
            nodes: NodeTable::new(rank),
            tet: CellTable::new(CellKind::Tet),
            pyr: CellTable::new(CellKind::Pyr),
            pri: CellTable::new(CellKind::Pri),
            hex: CellTable::new(CellKind::Hex),
            tri: CellTable::new(CellKind::Tri),
            qua: CellTable::new(CellKind::Qua),
            edg: CellTable::new(CellKind::Edg),
            geom: GeomTable::new(),
            twod: false,
            cad_data: Vec::new(),
        }
    }

    /// Single-partition grid, the common test fixture.
    pub fn solo() -> Grid {
        Grid::create(Comm::solo())
    }

    /// A full copy of the mesh sharing this partition's comm endpoint.
    pub fn deep_copy(&self) -> Grid {
        Grid {
            comm: Arc::clone(&self.comm),
            nodes: self.nodes.clone(),
            tet: self.tet.clone(),
            pyr: self.pyr.clone(),
            pri: self.pri.clone(),
            hex: self.hex.clone(),
            tri: self.tri.clone(),
            qua: self.qua.clone(),
            edg: self.edg.clone(),
            geom: self.geom.clone(),
            twod: self.twod,
            cad_data: self.cad_data.clone(),
        }
    }

    pub fn cells(&self, kind: CellKind) -> &CellTable {
        match kind {
            CellKind::Tet => &self.tet,
            CellKind::Pyr => &self.pyr,
            CellKind::Pri => &self.pri,
            CellKind::Hex => &self.hex,
            CellKind::Tri => &self.tri,
            CellKind::Qua => &self.qua,
            CellKind::Edg => &self.edg,
        }
    }

    pub fn cells_mut(&mut self, kind: CellKind) -> &mut CellTable {
        match kind {
            CellKind::Tet => &mut self.tet,
            CellKind::Pyr => &mut self.pyr,
            CellKind::Pri => &mut self.pri,
            CellKind::Hex => &mut self.hex,
            CellKind::Tri => &mut self.tri,
            CellKind::Qua => &mut self.qua,
            CellKind::Edg => &mut self.edg,
        }
    }

    pub fn tet(&self) -> &CellTable {
        &self.tet
    }

    pub fn tet_mut(&mut self) -> &mut CellTable {
        &mut self.tet
    }

    pub fn tri(&self) -> &CellTable {
        &self.tri
    }

    pub fn tri_mut(&mut self) -> &mut CellTable {
        &mut self.tri
    }

    pub fn edg(&self) -> &CellTable {
        &self.edg
    }

    pub fn all_cells(&self) -> impl Iterator<Item = &CellTable> {
        CellKind::ALL.iter().map(|&kind| self.cells(kind))
    }

    pub fn volume_cells(&self) -> impl Iterator<Item = &CellTable> {
        CellKind::VOLUME.iter().map(|&kind| self.cells(kind))
    }

    /// Add a cell after checking each node is a valid local slot.
    pub fn add_cell(&mut self, kind: CellKind, nodes: &[usize], id: i64) -> Result<usize> {
        for &node in nodes {
            if !self.nodes.valid(node) {
                return Err(Error::Invalid(format!(
                    "{kind:?} references invalid node {node}"
                )));
            }
        }
        self.cells_mut(kind).add_with_id(nodes, id)
    }

    /// A cell belongs to the lowest part id among its vertices.
    pub fn cell_owner(&self, kind: CellKind, cell: usize) -> Result<usize> {
        let nodes = self.cells(kind).nodes_of(cell)?;
        nodes
            .iter()
            .map(|&node| self.nodes.part(node))
            .min()
            .ok_or_else(|| Error::Invalid(format!("{kind:?} {cell} empty")))
    }

    /// True when some volume cell carries this (possibly degenerate) quad
    /// face.
    pub fn has_face(&self, face: &[usize; 4]) -> bool {
        self.volume_cells()
            .any(|table| table.cells_with_face(face).0.is_some())
    }

    /// Compact node storage and renumber every table; the interpolator must
    /// be reset afterwards. Returns (old_to_new, new_to_old).
    pub fn compact(&mut self) -> Result<(Vec<usize>, Vec<usize>)> {
        let (old_to_new, new_to_old) = self.nodes.compact();
        for kind in CellKind::ALL {
            self.cells_mut(kind).renumber(&old_to_new)?;
        }
        let mut remapped = GeomTable::new();
        for old in 0..old_to_new.len() {
            let new = old_to_new[old];
            if new == usize::MAX {
                continue;
            }
            for record in self.geom.records_of(old) {
                remapped.add(new, record.kind, record.id, &record.param)?;
                if let Some(gref) = record.gref {
                    remapped.set_gref(new, record.kind, record.id, gref)?;
                }
            }
        }
        self.geom = remapped;
        Ok((old_to_new, new_to_old))
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    /// Four corners, one tet, four boundary triangles; the smallest closed
    /// volume mesh.
    pub fn single_tet() -> Grid {
        let mut grid = Grid::solo();
        let corners = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        for (global, xyz) in corners.iter().enumerate() {
            let node = grid.nodes.add(global as i64).unwrap();
            grid.nodes.set_xyz(node, *xyz);
        }
        grid.add_cell(CellKind::Tet, &[0, 1, 2, 3], 0).unwrap();
        for face in [[0, 2, 1], [0, 1, 3], [1, 2, 3], [0, 3, 2]] {
            grid.add_cell(CellKind::Tri, &face, 1).unwrap();
        }
        grid
    }

    /// Unit cube as an n x n x n block, each sub-cube split into six tets
    /// around its main diagonal (the splits are face-to-face compatible).
    /// Boundary triangles carry side ids 1..=6.
    pub fn regular_cube(n: usize) -> Grid {
        use rustc_hash::FxHashMap;

        let mut grid = Grid::solo();
        let stride = n + 1;
        let index = |i: usize, j: usize, k: usize| i + stride * (j + stride * k);
        for k in 0..stride {
            for j in 0..stride {
                for i in 0..stride {
                    let node = grid.nodes.add(index(i, j, k) as i64).unwrap();
                    grid.nodes.set_xyz(
                        node,
                        [i as f64 / n as f64, j as f64 / n as f64, k as f64 / n as f64],
                    );
                }
            }
        }
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let c = [
                        index(i, j, k),
                        index(i + 1, j, k),
                        index(i + 1, j + 1, k),
                        index(i, j + 1, k),
                        index(i, j, k + 1),
                        index(i + 1, j, k + 1),
                        index(i + 1, j + 1, k + 1),
                        index(i, j + 1, k + 1),
                    ];
                    for tet in [
                        [0, 1, 2, 6],
                        [0, 2, 3, 6],
                        [0, 3, 7, 6],
                        [0, 7, 4, 6],
                        [0, 4, 5, 6],
                        [0, 5, 1, 6],
                    ] {
                        grid.add_cell(
                            CellKind::Tet,
                            &[c[tet[0]], c[tet[1]], c[tet[2]], c[tet[3]]],
                            0,
                        )
                        .unwrap();
                    }
                }
            }
        }
        // boundary faces are the tet faces owned by exactly one tet
        let mut census: FxHashMap<[usize; 3], (usize, [usize; 3])> = FxHashMap::default();
        for cell in grid.tet().valid_cells() {
            let nodes: Vec<usize> = grid.tet().nodes_of(cell).unwrap().to_vec();
            for face in CellKind::Tet.faces() {
                let tri = [nodes[face[0]], nodes[face[1]], nodes[face[2]]];
                let mut key = tri;
                key.sort_unstable();
                census.entry(key).or_insert((0, tri)).0 += 1;
            }
        }
        let mut boundary: Vec<[usize; 3]> = census
            .into_values()
            .filter(|&(count, _)| count == 1)
            .map(|(_, tri)| tri)
            .collect();
        boundary.sort_unstable();
        for tri in boundary {
            let side = |axis: usize, value: f64| {
                tri.iter()
                    .all(|&node| (grid.nodes.xyz(node)[axis] - value).abs() < 1e-12)
            };
            let id = if side(0, 0.0) {
                1
            } else if side(0, 1.0) {
                2
            } else if side(1, 0.0) {
                3
            } else if side(1, 1.0) {
                4
            } else if side(2, 0.0) {
                5
            } else {
                6
            };
            grid.add_cell(CellKind::Tri, &tri, id).unwrap();
        }
        grid
    }

    /// Unit cube split into six tets around the 0-6 diagonal, with twelve
    /// boundary triangles.
    pub fn six_tet_cube() -> Grid {
        let mut grid = Grid::solo();
        let corners = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        for (global, xyz) in corners.iter().enumerate() {
            let node = grid.nodes.add(global as i64).unwrap();
            grid.nodes.set_xyz(node, *xyz);
        }
        for tet in [
            [0, 1, 2, 6],
            [0, 2, 3, 6],
            [0, 3, 7, 6],
            [0, 7, 4, 6],
            [0, 4, 5, 6],
            [0, 5, 1, 6],
        ] {
            grid.add_cell(CellKind::Tet, &tet, 0).unwrap();
        }
        for face in [
            [0, 2, 1],
            [0, 3, 2],
            [0, 1, 5],
            [0, 5, 4],
            [1, 2, 6],
            [1, 6, 5],
            [2, 3, 6],
            [3, 7, 6],
            [0, 7, 3],
            [0, 4, 7],
            [4, 5, 6],
            [4, 6, 7],
        ] {
            grid.add_cell(CellKind::Tri, &face, 1).unwrap();
        }
        grid
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{single_tet, six_tet_cube};
    use super::*;
    use crate::math::tet_volume;

    #[test]
    fn add_cell_checks_node_validity() {
        let mut grid = Grid::solo();
        grid.nodes.add(0).unwrap();
        assert!(grid.add_cell(CellKind::Edg, &[0, 9], 0).is_err());
    }

    #[test]
    fn cell_owner_is_lowest_part() {
        let mut grid = Grid::solo();
        for global in 0..4 {
            grid.nodes.add(global).unwrap();
        }
        grid.nodes.set_part(1, 3);
        grid.nodes.set_part(2, 2);
        let cell = grid.add_cell(CellKind::Tet, &[0, 1, 2, 3], 0).unwrap();
        assert_eq!(grid.cell_owner(CellKind::Tet, cell).unwrap(), 0);
    }

    #[test]
    fn single_tet_fixture_is_closed() {
        let grid = single_tet();
        assert_eq!(grid.tet().n(), 1);
        assert_eq!(grid.tri().n(), 4);
        assert!(grid.has_face(&[0, 1, 2, 0]));
        assert!(grid.has_face(&[1, 2, 3, 1]));
        assert!(!grid.has_face(&[1, 2, 9, 1]));
    }

    #[test]
    fn cube_fixture_volumes_are_positive() {
        let grid = six_tet_cube();
        let mut total = 0.0;
        for cell in grid.tet().valid_cells() {
            let nodes = grid.tet().nodes_of(cell).unwrap();
            let volume = tet_volume(
                grid.nodes.xyz(nodes[0]),
                grid.nodes.xyz(nodes[1]),
                grid.nodes.xyz(nodes[2]),
                grid.nodes.xyz(nodes[3]),
            );
            assert!(volume > 0.0);
            total += volume;
        }
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn compact_renumbers_cells_and_geom() {
        let mut grid = single_tet();
        let orphan = grid.nodes.add(99).unwrap();
        grid.geom
            .add(0, crate::geom::GeomKind::Face, 1, &[0.5, 0.5])
            .unwrap();
        grid.nodes.remove(orphan).unwrap();
        let (old_to_new, new_to_old) = grid.compact().unwrap();
        assert_eq!(new_to_old.len(), 4);
        for (new, &old) in new_to_old.iter().enumerate() {
            assert_eq!(old_to_new[old], new);
        }
        assert_eq!(grid.tet().n(), 1);
        assert_eq!(grid.geom.n(), 1);
    }
}
