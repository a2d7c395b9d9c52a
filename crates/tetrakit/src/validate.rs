//! Mesh invariant checks, run on demand between adaptation passes.

use robust as ro;
use rustc_hash::FxHashMap;
use tracing::error;

use crate::cell::{CellKind, CellNodes};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::math::{tet_volume, tri_area};

fn coord(xyz: &[f64; 3]) -> ro::Coord3D<f64> {
    ro::Coord3D {
        x: xyz[0],
        y: xyz[1],
        z: xyz[2],
    }
}

/// Every cell references valid nodes and keeps at least one node owned by
/// this partition.
pub fn cell_node(grid: &Grid) -> Result<()> {
    for table in grid.all_cells() {
        for cell in table.valid_cells() {
            let nodes = table.nodes_of(cell)?;
            let mut has_local = false;
            for &node in nodes {
                if !grid.nodes.valid(node) {
                    return Err(Error::Invalid(format!(
                        "{:?} {cell} references invalid node {node}",
                        table.kind()
                    )));
                }
                has_local = has_local || grid.nodes.part(node) == grid.comm.rank();
            }
            if !has_local {
                return Err(Error::Invalid(format!(
                    "{:?} {cell} has only ghost nodes",
                    table.kind()
                )));
            }
        }
    }
    Ok(())
}

/// Interior faces are shared by exactly two volume cells; boundary faces
/// match exactly one volume cell.
pub fn cell_face(grid: &Grid) -> Result<()> {
    let mut hits: FxHashMap<CellNodes, usize> = FxHashMap::default();
    for kind in CellKind::VOLUME {
        let table = grid.cells(kind);
        for cell in table.valid_cells() {
            let nodes = table.nodes_of(cell)?;
            for face in kind.faces() {
                let mut key: CellNodes = CellNodes::new();
                for &slot in face {
                    let node = nodes[slot];
                    if !key.contains(&node) {
                        key.push(node);
                    }
                }
                key.sort_unstable();
                *hits.entry(key).or_insert(0) += 1;
            }
        }
    }
    for kind in [CellKind::Tri, CellKind::Qua] {
        let table = grid.cells(kind);
        for cell in table.valid_cells() {
            let nodes = table.nodes_of(cell)?;
            let mut key: CellNodes = nodes.iter().copied().collect();
            key.sort_unstable();
            match hits.get_mut(&key) {
                Some(count) => *count += 1,
                None => {
                    for &node in nodes {
                        error!("{}", grid.nodes.location(node));
                    }
                    return Err(Error::Invalid(format!(
                        "{kind:?} {cell} matches no volume face"
                    )));
                }
            }
        }
    }
    for (key, count) in &hits {
        if *count != 2 {
            return Err(Error::Invalid(format!(
                "face {key:?} shared {count} times, expected 2"
            )));
        }
    }
    Ok(())
}

/// Strictly positive volumes, cross-checked against the adaptive-precision
/// orientation predicate (positive volume means a negative orient3d).
pub fn cell_volume(grid: &Grid) -> Result<()> {
    if grid.twod {
        let table = grid.cells(CellKind::Tri);
        for cell in table.valid_cells() {
            let nodes = table.nodes_of(cell)?;
            let area = tri_area(
                grid.nodes.xyz(nodes[0]),
                grid.nodes.xyz(nodes[1]),
                grid.nodes.xyz(nodes[2]),
            );
            if area <= 0.0 {
                return Err(Error::Invalid(format!("tri {cell} area {area:e}")));
            }
        }
        return Ok(());
    }
    let table = grid.cells(CellKind::Tet);
    for cell in table.valid_cells() {
        let nodes = table.nodes_of(cell)?;
        let corners = [
            grid.nodes.xyz(nodes[0]),
            grid.nodes.xyz(nodes[1]),
            grid.nodes.xyz(nodes[2]),
            grid.nodes.xyz(nodes[3]),
        ];
        let volume = tet_volume(corners[0], corners[1], corners[2], corners[3]);
        let orientation = ro::orient3d(
            coord(corners[0]),
            coord(corners[1]),
            coord(corners[2]),
            coord(corners[3]),
        );
        if volume <= 0.0 || orientation >= 0.0 {
            return Err(Error::Invalid(format!(
                "tet {cell} volume {volume:e} orientation {orientation:e}"
            )));
        }
    }
    Ok(())
}

/// No valid vertex may be orphaned from the volume mesh.
pub fn unused_node(grid: &Grid) -> Result<()> {
    for node in grid.nodes.iter_valid() {
        let used = if grid.twod {
            !grid.cells(CellKind::Tri).node_empty(node)
        } else {
            CellKind::VOLUME
                .iter()
                .any(|&kind| !grid.cells(kind).node_empty(node))
        };
        if !used {
            return Err(Error::Invalid(format!(
                "unused {}",
                grid.nodes.location(node)
            )));
        }
    }
    Ok(())
}

/// When geometry association is present: every boundary-triangle vertex
/// carries a face record matching the triangle's surface id, and both ends
/// of a geometry edge carry its edge record.
pub fn geom_topology(grid: &Grid) -> Result<()> {
    if grid.geom.n() == 0 {
        return Ok(());
    }
    let tris = grid.cells(CellKind::Tri);
    for cell in tris.valid_cells() {
        let id = tris.surface_id(cell)?;
        for &node in tris.nodes_of(cell)? {
            if grid.geom.find(node, crate::geom::GeomKind::Face, id).is_none() {
                return Err(Error::Invalid(format!(
                    "tri {cell} surface {id} missing face record at {}",
                    grid.nodes.location(node)
                )));
            }
        }
    }
    let edges = grid.cells(CellKind::Edg);
    for cell in edges.valid_cells() {
        let id = edges.surface_id(cell)?;
        for &node in edges.nodes_of(cell)? {
            if grid.geom.find(node, crate::geom::GeomKind::Edge, id).is_none() {
                return Err(Error::Invalid(format!(
                    "edg {cell} id {id} missing edge record at {}",
                    grid.nodes.location(node)
                )));
            }
        }
    }
    Ok(())
}

/// The full battery.
pub fn all(grid: &Grid) -> Result<()> {
    cell_node(grid)?;
    cell_face(grid)?;
    cell_volume(grid)?;
    unused_node(grid)?;
    geom_topology(grid)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::fixtures::{regular_cube, single_tet, six_tet_cube};

    #[test]
    fn fixtures_pass_the_battery() {
        all(&single_tet()).unwrap();
        all(&six_tet_cube()).unwrap();
        all(&regular_cube(2)).unwrap();
    }

    #[test]
    fn orientation_convention_matches_volume() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 1.0, 0.0];
        let d = [0.0, 0.0, 1.0];
        assert!(tet_volume(&a, &b, &c, &d) > 0.0);
        assert!(ro::orient3d(coord(&a), coord(&b), coord(&c), coord(&d)) < 0.0);
    }

    #[test]
    fn inverted_tet_is_rejected() {
        let mut grid = single_tet();
        // swap two nodes to invert the cell
        let cell = grid.tet().valid_cells().next().unwrap();
        let mut nodes: Vec<usize> = grid.tet().nodes_of(cell).unwrap().to_vec();
        grid.tet_mut().remove(cell).unwrap();
        nodes.swap(0, 1);
        grid.tet_mut().add(&nodes).unwrap();
        assert!(cell_volume(&grid).is_err());
    }

    #[test]
    fn missing_boundary_face_is_detected() {
        let mut grid = single_tet();
        let face = grid.tri().valid_cells().next().unwrap();
        grid.tri_mut().remove(face).unwrap();
        assert!(cell_face(&grid).is_err());
    }

    #[test]
    fn dangling_boundary_face_is_detected() {
        let mut grid = six_tet_cube();
        let extra = grid.nodes.add(100).unwrap();
        grid.nodes.set_xyz(extra, [5.0, 5.0, 5.0]);
        grid.add_cell(CellKind::Tri, &[0, 1, extra], 9).unwrap();
        assert!(cell_face(&grid).is_err());
        assert!(unused_node(&grid).is_err());
    }

    #[test]
    fn orphan_node_is_detected() {
        let mut grid = single_tet();
        grid.nodes.add(50).unwrap();
        assert!(unused_node(&grid).is_err());
    }

    #[test]
    fn geom_topology_wants_matching_face_records() {
        use crate::geom::GeomKind;
        let mut grid = single_tet();
        // no geometry at all is fine
        geom_topology(&grid).unwrap();
        // a partial cover is not
        grid.geom.add(0, GeomKind::Face, 1, &[0.0, 0.0]).unwrap();
        assert!(geom_topology(&grid).is_err());
        for node in 1..4 {
            grid.geom.add(node, GeomKind::Face, 1, &[0.0, 0.0]).unwrap();
        }
        geom_topology(&grid).unwrap();
    }
}
