//! One steady-state pass of the adaptation cycle, end to end: stream a mesh
//! in, build a metric from a scalar field, condition it, carry it through
//! the interpolator, rebalance, and validate.

use std::sync::Arc;

use approx::assert_abs_diff_eq;

use tetrakit::cell::CellKind;
use tetrakit::comm::{Comm, with_fabric};
use tetrakit::grid::Grid;
use tetrakit::interp::{Interp, create_identity};
use tetrakit::matrix;
use tetrakit::metric;
use tetrakit::migrate;
use tetrakit::part;
use tetrakit::recon::Reconstruction;
use tetrakit::validate;

/// Unit cube split n x n x n with six tets per sub-cube and side-tagged
/// boundary triangles.
fn block(n: usize) -> Grid {
    let mut grid = Grid::solo();
    let stride = n + 1;
    let index = |i: usize, j: usize, k: usize| (i + stride * (j + stride * k)) as i64;
    for k in 0..stride {
        for j in 0..stride {
            for i in 0..stride {
                let node = grid.nodes.add(index(i, j, k)).unwrap();
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
                let c: Vec<usize> = [
                    (i, j, k),
                    (i + 1, j, k),
                    (i + 1, j + 1, k),
                    (i, j + 1, k),
                    (i, j, k + 1),
                    (i + 1, j, k + 1),
                    (i + 1, j + 1, k + 1),
                    (i, j + 1, k + 1),
                ]
                .iter()
                .map(|&(a, b, d)| index(a, b, d) as usize)
                .collect();
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
    // boundary faces via a single-owner census over tet faces
    let mut census = std::collections::BTreeMap::new();
    for cell in grid.tet().valid_cells() {
        let nodes: Vec<usize> = grid.tet().nodes_of(cell).unwrap().to_vec();
        for face in CellKind::Tet.faces() {
            let tri = [nodes[face[0]], nodes[face[1]], nodes[face[2]]];
            let mut key = tri;
            key.sort_unstable();
            census.entry(key).or_insert((0usize, tri)).0 += 1;
        }
    }
    for (count, tri) in census.into_values() {
        if count != 1 {
            continue;
        }
        let id = (0..3)
            .flat_map(|axis| [(axis, 0.0), (axis, 1.0)])
            .position(|(axis, value)| {
                tri.iter()
                    .all(|&node| (grid.nodes.xyz(node)[axis] - value).abs() < 1e-12)
            })
            .unwrap() as i64
            + 1;
        grid.add_cell(CellKind::Tri, &tri, id).unwrap();
    }
    grid
}

#[test]
fn serial_cycle_from_field_to_conditioned_metric() {
    let grid = block(3);
    validate::all(&grid).unwrap();

    // a quadratic sensor recovers an exact constant Hessian
    let mut sensor = vec![0.0; grid.nodes.max()];
    for node in grid.nodes.iter_valid() {
        let xyz = grid.nodes.xyz(node);
        sensor[node] = xyz[0] * xyz[0] + 0.5 * xyz[1] * xyz[1] + 2.0 * xyz[2] * xyz[2];
    }
    let metric = metric::lp(
        &grid,
        &sensor,
        None,
        Reconstruction::KExact,
        2,
        1.5,
        2000.0,
    )
    .unwrap();

    let total = metric::complexity(&metric, &grid).unwrap();
    assert!((total / 2000.0 - 1.0).abs() <= 1e-6);
    for node in grid.nodes.iter_valid() {
        let sys = matrix::eig(&metric[node]).unwrap();
        assert!(sys.eig[0] > 0.0);
    }
}

#[test]
fn serial_cycle_carries_the_metric_through_location() {
    let mut grid = block(2);
    metric::olympic_node(&mut grid, 0.01).unwrap();

    let (background, mut interp) = create_identity(&grid).unwrap();
    let max_error = interp.max_error(&background, &grid).unwrap();
    assert!(max_error <= 1e-12);

    // a smoothing step moves an interior vertex; relocation and transfer
    // keep the carried metric consistent with the background field
    let moved = grid.nodes.local(13).unwrap();
    grid.nodes.set_xyz(moved, [0.45, 0.55, 0.5]);
    tetrakit::interp::metric_interpolate_node(&mut interp, &background, &mut grid, moved).unwrap();
    let m = grid.nodes.metric_get(moved).unwrap();
    assert_abs_diff_eq!(m[0], 100.0, epsilon = 1e-6);

    interp.synchronize(&background, &mut grid).unwrap();
    validate::all(&grid).unwrap();
}

#[test]
fn parallel_cycle_streams_balances_and_interpolates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("block.lb8.ugrid");
    part::write_ugrid(&block(2), &path, false).unwrap();

    let errors = with_fabric(2, |comm| {
        let mut grid = part::read_by_extension(Arc::new(comm), &path).unwrap();
        validate::cell_node(&grid).unwrap();
        validate::cell_volume(&grid).unwrap();

        metric::olympic_node(&mut grid, 0.01).unwrap();
        migrate::rebalance(&mut grid).unwrap();
        validate::cell_node(&grid).unwrap();
        validate::unused_node(&grid).unwrap();

        // self-location across the fabric: donor and receptor share the mesh
        let from = grid.deep_copy();
        let mut interp = Interp::create(&from, &grid).unwrap();
        interp.locate(&from, &grid).unwrap();
        interp.max_error(&from, &grid).unwrap()
    });
    for max_error in errors {
        assert!(max_error <= 1e-12, "max error {max_error:e}");
    }
}

#[test]
fn meshb_round_trip_preserves_the_cycle_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let mesh_path = dir.path().join("block.meshb");
    let metric_path = dir.path().join("block-metric.solb");

    let mut grid = block(2);
    metric::side_node(&mut grid).unwrap();
    part::write_meshb(&grid, &mesh_path).unwrap();
    part::write_metric(&grid, &metric_path).unwrap();

    let mut back = part::read_by_extension(Arc::new(Comm::solo()), &mesh_path).unwrap();
    part::read_metric(&mut back, &metric_path).unwrap();
    assert_eq!(back.nodes.n(), grid.nodes.n());
    assert_eq!(back.tet().n(), grid.tet().n());
    assert_eq!(back.tri().n(), grid.tri().n());
    for node in back.nodes.iter_valid() {
        let original = grid.nodes.local(back.nodes.global(node)).unwrap();
        let want = grid.nodes.metric_get(original).unwrap();
        let got = back.nodes.metric_get(node).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(got[i], want[i], epsilon = 1e-9 * want[i].abs().max(1.0));
        }
    }
    validate::all(&back).unwrap();
}
