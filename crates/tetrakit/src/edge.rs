//! Undirected unique edge enumeration, rebuilt on demand from the cell
//! tables. Derived state for gradation and recovery passes.

use itertools::Itertools;

use crate::grid::Grid;

#[derive(Debug, Default)]
pub struct EdgeTable {
    /// Pairs stored with `e2n[0] < e2n[1]`.
    e2n: Vec<[usize; 2]>,
}

impl EdgeTable {
    pub fn create(grid: &Grid) -> EdgeTable {
        let mut pairs = Vec::new();
        for table in grid.all_cells() {
            let kind = table.kind();
            for cell in table.valid_cells() {
                let nodes = table.nodes_of(cell).unwrap();
                for pair in kind.edges() {
                    let n0 = nodes[pair[0]];
                    let n1 = nodes[pair[1]];
                    pairs.push([n0.min(n1), n0.max(n1)]);
                }
            }
        }
        let e2n = pairs.into_iter().sorted_unstable().dedup().collect();
        EdgeTable { e2n }
    }

    pub fn n(&self) -> usize {
        self.e2n.len()
    }

    pub fn nodes(&self, edge: usize) -> [usize; 2] {
        self.e2n[edge]
    }

    pub fn iter(&self) -> impl Iterator<Item = [usize; 2]> + '_ {
        self.e2n.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    #[test]
    fn unique_sorted_edges_from_two_tets() {
        let mut grid = Grid::solo();
        for global in 0..5 {
            let node = grid.nodes.add(global).unwrap();
            grid.nodes.set_xyz(node, [global as f64, 0.0, 0.0]);
        }
        grid.tet_mut().add(&[0, 1, 2, 3]).unwrap();
        grid.tet_mut().add(&[1, 2, 3, 4]).unwrap();
        let edges = EdgeTable::create(&grid);
        // 6 + 6 edges with the shared face (1,2,3) deduplicated
        assert_eq!(edges.n(), 9);
        for [n0, n1] in edges.iter() {
            assert!(n0 < n1);
        }
        assert!(edges.iter().any(|pair| pair == [1, 2]));
        assert!(!edges.iter().any(|pair| pair == [0, 4]));
    }

    #[test]
    fn every_edge_has_a_common_cell() {
        let grid = crate::grid::fixtures::six_tet_cube();
        let edges = EdgeTable::create(&grid);
        for [n0, n1] in edges.iter() {
            assert!(!grid.tet().cells_with_side(n0, n1).is_empty());
        }
    }
}
