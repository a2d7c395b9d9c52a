//! Gradient and Hessian recovery from a vertex scalar field.
//!
//! Two reconstructions: a double L2 projection (Alauzet and Loseille,
//! doi:10.1016/j.jcp.2009.09.020, section 2.2.4.1) with zeroth-order
//! boundary extrapolation, and a k-exact least-squares fit over a grown
//! vertex cloud.

use nalgebra as na;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cell::CellKind;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::math::{distance, divisible, tet_volume};
use crate::matrix::{self, SymMat};

const MAX_DEGREE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconstruction {
    L2Projection,
    KExact,
}

/// Constant gradient of the linear interpolant over one tet.
fn tet_grad(grid: &Grid, nodes: &[usize], scalar: &[f64]) -> Result<[f64; 3]> {
    let x0 = grid.nodes.xyz(nodes[0]);
    let mut edges = na::Matrix3::<f64>::zeros();
    let mut rhs = na::Vector3::<f64>::zeros();
    for row in 0..3 {
        let x = grid.nodes.xyz(nodes[row + 1]);
        for col in 0..3 {
            edges[(row, col)] = x[col] - x0[col];
        }
        rhs[row] = scalar[nodes[row + 1]] - scalar[nodes[0]];
    }
    let lu = edges.lu();
    if !lu.solve_mut(&mut rhs) {
        return Err(Error::DivZero("degenerate tet in gradient".to_string()));
    }
    Ok([rhs[0], rhs[1], rhs[2]])
}

/// Volume-weighted projection of cell gradients onto the vertices.
pub fn l2_projection_grad(grid: &Grid, scalar: &[f64]) -> Result<Vec<[f64; 3]>> {
    let max = grid.nodes.max();
    let mut grad = vec![[0.0; 3]; max];
    let mut volume = vec![0.0; max];

    let table = grid.cells(CellKind::Tet);
    for cell in table.valid_cells() {
        let nodes = table.nodes_of(cell)?;
        let cell_volume = tet_volume(
            grid.nodes.xyz(nodes[0]),
            grid.nodes.xyz(nodes[1]),
            grid.nodes.xyz(nodes[2]),
            grid.nodes.xyz(nodes[3]),
        );
        let cell_grad = tet_grad(grid, nodes, scalar)?;
        for &node in nodes {
            for i in 0..3 {
                grad[node][i] += cell_volume * cell_grad[i];
            }
            volume[node] += cell_volume;
        }
    }

    let mut div_by_zero = false;
    for node in grid.nodes.iter_valid() {
        if divisible(grad[node][0], volume[node])
            && divisible(grad[node][1], volume[node])
            && divisible(grad[node][2], volume[node])
        {
            for i in 0..3 {
                grad[node][i] /= volume[node];
            }
        } else {
            div_by_zero = true;
            grad[node] = [0.0; 3];
        }
    }
    let div_by_zero = grid.comm.all_or(div_by_zero);

    if grid.comm.para() {
        let mut flat = vec![0.0; 3 * max];
        for (node, g) in grad.iter().enumerate() {
            flat[3 * node..3 * node + 3].copy_from_slice(g);
        }
        grid.nodes.ghost_sync_dbl(&grid.comm, &mut flat, 3)?;
        for (node, g) in grad.iter_mut().enumerate() {
            g.copy_from_slice(&flat[3 * node..3 * node + 3]);
        }
    }

    if div_by_zero {
        return Err(Error::DivZero("node with zero projection volume".to_string()));
    }
    Ok(grad)
}

fn abs_eigenvalues(hessian: &mut [SymMat], grid: &Grid, owned_only: bool) -> Result<()> {
    for node in grid.nodes.iter_valid() {
        if owned_only && !grid.nodes.owned(node) {
            continue;
        }
        let mut sys = matrix::eig(&hessian[node])?;
        for value in &mut sys.eig {
            *value = value.abs();
        }
        hessian[node] = matrix::reform(&sys);
    }
    Ok(())
}

/// Hessian by projecting twice, averaging the off-diagonal pairs, then
/// symmetrizing with absolute eigenvalues.
fn l2_projection_hessian(grid: &Grid, scalar: &[f64]) -> Result<Vec<SymMat>> {
    let max = grid.nodes.max();
    let grad = l2_projection_grad(grid, scalar)?;
    let mut component = vec![0.0; max];
    let mut second: [Vec<[f64; 3]>; 3] = [const { Vec::new() }; 3];
    for axis in 0..3 {
        for node in grid.nodes.iter_valid() {
            component[node] = grad[node][axis];
        }
        second[axis] = l2_projection_grad(grid, &component)?;
    }

    let mut hessian = vec![[0.0; 6]; max];
    for node in grid.nodes.iter_valid() {
        hessian[node] = [
            second[0][node][0],
            0.5 * (second[0][node][1] + second[1][node][0]),
            0.5 * (second[0][node][2] + second[2][node][0]),
            second[1][node][1],
            0.5 * (second[1][node][2] + second[2][node][1]),
            second[2][node][2],
        ];
    }
    abs_eigenvalues(&mut hessian, grid, false)?;
    Ok(hessian)
}

/// Fill boundary vertices by repeatedly averaging interior neighbors; a
/// zeroth-order extrapolation that marches inward-out in at most ten passes.
pub fn extrapolate_boundary_multipass(recon: &mut [SymMat], grid: &Grid) -> Result<()> {
    let max = grid.nodes.max();
    let tris = grid.cells(CellKind::Tri);
    let tets = grid.cells(CellKind::Tet);
    let mut needs_donor = vec![0i64; max];
    for node in grid.nodes.iter_valid() {
        if !tris.node_empty(node) {
            needs_donor[node] = 1;
        }
    }
    grid.nodes.ghost_sync_int(&grid.comm, &mut needs_donor, 1)?;

    let mut remain = 0;
    for _pass in 0..10 {
        for node in grid.nodes.iter_valid() {
            if !grid.nodes.owned(node) || needs_donor[node] == 0 {
                continue;
            }
            let neighbors = tets.node_list_around(node, MAX_DEGREE)?;
            let interior: Vec<usize> = neighbors
                .into_iter()
                .filter(|&other| needs_donor[other] == 0)
                .collect();
            if !interior.is_empty() {
                let mut average = [0.0; 6];
                for &donor in &interior {
                    for i in 0..6 {
                        average[i] += recon[donor][i];
                    }
                }
                // Euclidean average, these are derivatives
                for value in &mut average {
                    *value /= interior.len() as f64;
                }
                recon[node] = average;
                needs_donor[node] = 0;
            }
        }

        grid.nodes.ghost_sync_int(&grid.comm, &mut needs_donor, 1)?;
        if grid.comm.para() {
            let mut flat = vec![0.0; 6 * max];
            for (node, m) in recon.iter().enumerate() {
                flat[6 * node..6 * node + 6].copy_from_slice(m);
            }
            grid.nodes.ghost_sync_dbl(&grid.comm, &mut flat, 6)?;
            for (node, m) in recon.iter_mut().enumerate() {
                m.copy_from_slice(&flat[6 * node..6 * node + 6]);
            }
        }

        remain = 0;
        for node in grid.nodes.iter_valid() {
            if grid.nodes.owned(node) && needs_donor[node] != 0 {
                remain += 1;
            }
        }
        remain = grid.comm.allsum_int(remain);
        if remain == 0 {
            break;
        }
    }
    if remain != 0 {
        return Err(Error::Invalid(format!(
            "{remain} boundary nodes never reached an interior donor"
        )));
    }
    Ok(())
}

/// One vertex's sampling cloud: global id to (x, y, z, scalar).
type Cloud = FxHashMap<i64, [f64; 4]>;

/// The immediate (1-ring) cloud of every valid node, self included.
fn immediate_clouds(grid: &Grid, scalar: &[f64]) -> Result<Vec<Cloud>> {
    let table = grid.cells(CellKind::Tet);
    let mut clouds: Vec<Cloud> = vec![Cloud::default(); grid.nodes.max()];
    for node in grid.nodes.iter_valid() {
        for cell in table.cells_having_node(node) {
            for &target in table.nodes_of(cell)? {
                let xyz = grid.nodes.xyz(target);
                clouds[node].insert(
                    grid.nodes.global(target),
                    [xyz[0], xyz[1], xyz[2], scalar[target]],
                );
            }
        }
    }
    Ok(clouds)
}

/// Complete ghost nodes' clouds with their owner's view, which sees cells
/// this part cannot.
fn ghost_clouds(grid: &Grid, clouds: &mut [Cloud]) -> Result<()> {
    if !grid.comm.para() {
        return Ok(());
    }
    let mut ghosts: Vec<usize> = grid
        .nodes
        .iter_valid()
        .filter(|&node| !grid.nodes.owned(node))
        .collect();
    ghosts.sort_by_key(|&node| grid.nodes.global(node));
    let owners: Vec<usize> = ghosts.iter().map(|&node| grid.nodes.part(node)).collect();
    let globals: Vec<i64> = ghosts.iter().map(|&node| grid.nodes.global(node)).collect();
    let ret: Vec<i64> = vec![grid.comm.rank() as i64; ghosts.len()];

    let asked_globals = grid.comm.blindsend_ints(&owners, &globals, 1);
    let asked_ret = grid.comm.blindsend_ints(&owners, &ret, 1);

    let mut reply_dest = Vec::new();
    let mut reply_ints = Vec::new();
    let mut reply_dbls = Vec::new();
    for (slot, &global) in asked_globals.iter().enumerate() {
        let local = grid.nodes.local(global)?;
        let mut entries: Vec<(i64, [f64; 4])> =
            clouds[local].iter().map(|(&g, &aux)| (g, aux)).collect();
        entries.sort_by_key(|&(g, _)| g);
        for (cloud_global, aux) in entries {
            reply_dest.push(asked_ret[slot] as usize);
            reply_ints.extend_from_slice(&[global, cloud_global]);
            reply_dbls.extend_from_slice(&aux);
        }
    }
    let got_ints = grid.comm.blindsend_ints(&reply_dest, &reply_ints, 2);
    let got_dbls = grid.comm.blindsend_dbls(&reply_dest, &reply_dbls, 4);

    for slot in 0..got_ints.len() / 2 {
        let local = grid.nodes.local(got_ints[2 * slot])?;
        let aux = [
            got_dbls[4 * slot],
            got_dbls[4 * slot + 1],
            got_dbls[4 * slot + 2],
            got_dbls[4 * slot + 3],
        ];
        clouds[local].insert(got_ints[2 * slot + 1], aux);
    }
    Ok(())
}

/// Merge the one-layer cloud of every member into `cloud`, one ring of
/// growth. Members living on other parts contribute nothing here; their
/// entries arrived with the ghost exchange.
fn grow_cloud_one_layer(cloud: &mut Cloud, one_layer: &[Cloud], grid: &Grid) {
    let members: Vec<i64> = cloud.keys().copied().collect();
    for global in members {
        if let Ok(local) = grid.nodes.local(global) {
            for (&g, &aux) in &one_layer[local] {
                cloud.entry(g).or_insert(aux);
            }
        }
    }
}

/// Least-squares fit of gradient and Hessian at the cloud center: nine
/// unknowns (six curvatures, three slopes) from second-order Taylor rows.
fn kexact_cloud_fit(center_global: i64, cloud: &Cloud) -> Result<([f64; 3], SymMat)> {
    let center = cloud
        .get(&center_global)
        .ok_or_else(|| Error::NotFound(format!("cloud center {center_global}")))?;
    let rows = cloud.len() - 1;
    let unknowns = 9;
    if rows < unknowns {
        // signal that the cloud must grow
        return Err(Error::DivZero(format!(
            "underdetermined cloud {rows}x{unknowns}"
        )));
    }
    let mut a = ndarray::Array2::<f64>::zeros((rows, unknowns));
    let mut b = vec![0.0; rows];
    let mut entries: Vec<(i64, [f64; 4])> = cloud
        .iter()
        .filter(|&(&g, _)| g != center_global)
        .map(|(&g, &aux)| (g, aux))
        .collect();
    entries.sort_by_key(|&(g, _)| g);
    for (row, (_, aux)) in entries.iter().enumerate() {
        let dx = aux[0] - center[0];
        let dy = aux[1] - center[1];
        let dz = aux[2] - center[2];
        let geom = [
            0.5 * dx * dx,
            dx * dy,
            dx * dz,
            0.5 * dy * dy,
            dy * dz,
            0.5 * dz * dz,
            dx,
            dy,
            dz,
        ];
        for (col, &value) in geom.iter().enumerate() {
            a[(row, col)] = value;
        }
        b[row] = aux[3] - center[3];
    }
    let (q, r) = matrix::qr(&a)?;
    let x = matrix::qr_solve(&q, &r, &b)?;
    let hessian = [x[0], x[1], x[2], x[3], x[4], x[5]];
    let gradient = [x[6], x[7], x[8]];
    Ok((gradient, hessian))
}

/// K-exact recovery: per owned vertex grow the cloud from the 1-ring until
/// the nine-unknown fit succeeds, retrying through ring eight.
fn kexact_gradient_hessian(
    grid: &Grid,
    scalar: &[f64],
) -> Result<(Vec<[f64; 3]>, Vec<SymMat>)> {
    let max = grid.nodes.max();
    let mut one_layer = immediate_clouds(grid, scalar)?;
    ghost_clouds(grid, &mut one_layer)?;

    let mut gradient = vec![[0.0; 3]; max];
    let mut hessian = vec![[0.0; 6]; max];
    for node in grid.nodes.iter_valid() {
        if !grid.nodes.owned(node) {
            continue;
        }
        let center_global = grid.nodes.global(node);
        let mut cloud = one_layer[node].clone();
        let mut fit = Err(Error::Invalid("cloud never grown".to_string()));
        for layer in 2..=8 {
            grow_cloud_one_layer(&mut cloud, &one_layer, grid);
            fit = kexact_cloud_fit(center_global, &cloud);
            match &fit {
                Ok(_) => break,
                Err(Error::DivZero(_)) | Err(Error::IllConditioned(_)) => {
                    debug!(
                        "cloud retry at layer {layer} for {}",
                        grid.nodes.location(node)
                    );
                }
                Err(_) => break,
            }
        }
        let (g, h) = fit?;
        gradient[node] = g;
        hessian[node] = h;
    }

    abs_eigenvalues(&mut hessian, grid, true)?;

    if grid.comm.para() {
        let mut flat = vec![0.0; 3 * max];
        for (node, g) in gradient.iter().enumerate() {
            flat[3 * node..3 * node + 3].copy_from_slice(g);
        }
        grid.nodes.ghost_sync_dbl(&grid.comm, &mut flat, 3)?;
        for (node, g) in gradient.iter_mut().enumerate() {
            g.copy_from_slice(&flat[3 * node..3 * node + 3]);
        }
        let mut flat = vec![0.0; 6 * max];
        for (node, h) in hessian.iter().enumerate() {
            flat[6 * node..6 * node + 6].copy_from_slice(h);
        }
        grid.nodes.ghost_sync_dbl(&grid.comm, &mut flat, 6)?;
        for (node, h) in hessian.iter_mut().enumerate() {
            h.copy_from_slice(&flat[6 * node..6 * node + 6]);
        }
    }

    Ok((gradient, hessian))
}

/// Recover a vertex gradient with the requested reconstruction.
pub fn gradient(grid: &Grid, scalar: &[f64], recon: Reconstruction) -> Result<Vec<[f64; 3]>> {
    match recon {
        Reconstruction::L2Projection => l2_projection_grad(grid, scalar),
        Reconstruction::KExact => Ok(kexact_gradient_hessian(grid, scalar)?.0),
    }
}

/// Recover a symmetrized vertex Hessian with the requested reconstruction.
pub fn hessian(grid: &Grid, scalar: &[f64], recon: Reconstruction) -> Result<Vec<SymMat>> {
    match recon {
        Reconstruction::L2Projection => {
            let mut hessian = l2_projection_hessian(grid, scalar)?;
            extrapolate_boundary_multipass(&mut hessian, grid)?;
            Ok(hessian)
        }
        Reconstruction::KExact => Ok(kexact_gradient_hessian(grid, scalar)?.1),
    }
}

/// Floor each eigenvalue at 4e-12 / r_min^2, the second-order central
/// difference round-off limit at the shortest incident edge.
pub fn roundoff_limit(recon: &mut [SymMat], grid: &Grid) -> Result<()> {
    let kind = if grid.twod { CellKind::Tri } else { CellKind::Tet };
    let table = grid.cells(kind);
    let round_off_jitter = 1.0e-12;
    for node in grid.nodes.iter_valid() {
        let neighbors = table.node_list_around(node, MAX_DEGREE)?;
        let mut radius = 0.0;
        for (slot, &other) in neighbors.iter().enumerate() {
            let dist = distance(grid.nodes.xyz(node), grid.nodes.xyz(other));
            radius = if slot == 0 { dist } else { radius.min(dist) };
        }
        if radius <= 0.0 {
            continue;
        }
        let eig_floor = 4.0 * round_off_jitter / radius / radius;
        let mut sys = matrix::eig(&recon[node])?;
        for value in &mut sys.eig {
            *value = value.max(eig_floor);
        }
        recon[node] = matrix::reform(&sys);
    }

    if grid.comm.para() {
        let mut flat = vec![0.0; 6 * recon.len()];
        for (node, m) in recon.iter().enumerate() {
            flat[6 * node..6 * node + 6].copy_from_slice(m);
        }
        grid.nodes.ghost_sync_dbl(&grid.comm, &mut flat, 6)?;
        for (node, m) in recon.iter_mut().enumerate() {
            m.copy_from_slice(&flat[6 * node..6 * node + 6]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::fixtures::regular_cube;
    use approx::assert_abs_diff_eq;

    fn field(grid: &Grid, f: impl Fn(&[f64; 3]) -> f64) -> Vec<f64> {
        let mut scalar = vec![0.0; grid.nodes.max()];
        for node in grid.nodes.iter_valid() {
            scalar[node] = f(grid.nodes.xyz(node));
        }
        scalar
    }

    #[test]
    fn l2_gradient_of_linear_field_is_exact() {
        let grid = regular_cube(2);
        let scalar = field(&grid, |x| 2.0 * x[0] - 3.0 * x[1] + 0.5 * x[2]);
        let grad = l2_projection_grad(&grid, &scalar).unwrap();
        for node in grid.nodes.iter_valid() {
            assert_abs_diff_eq!(grad[node][0], 2.0, epsilon = 1e-11);
            assert_abs_diff_eq!(grad[node][1], -3.0, epsilon = 1e-11);
            assert_abs_diff_eq!(grad[node][2], 0.5, epsilon = 1e-11);
        }
    }

    #[test]
    fn l2_hessian_of_linear_field_is_zero() {
        let grid = regular_cube(2);
        let scalar = field(&grid, |x| x[0] + x[1] + x[2]);
        let hess = hessian(&grid, &scalar, Reconstruction::L2Projection).unwrap();
        for node in grid.nodes.iter_valid() {
            for i in 0..6 {
                assert_abs_diff_eq!(hess[node][i], 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn kexact_recovers_quadratic_hessian() {
        let grid = regular_cube(3);
        let scalar = field(&grid, |x| {
            x[0] * x[0] + 2.0 * x[1] * x[1] + 3.0 * x[2] * x[2] + x[0] * x[1]
        });
        let hess = hessian(&grid, &scalar, Reconstruction::KExact).unwrap();
        let expected = [2.0, 1.0, 0.0, 4.0, 0.0, 6.0];
        for node in grid.nodes.iter_valid() {
            for i in 0..6 {
                assert_abs_diff_eq!(hess[node][i], expected[i], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn kexact_gradient_of_quadratic_at_center() {
        let grid = regular_cube(2);
        let scalar = field(&grid, |x| x[0] * x[0]);
        let grad = gradient(&grid, &scalar, Reconstruction::KExact).unwrap();
        // center vertex of the 2x2x2 block sits at (0.5, 0.5, 0.5)
        let center = grid.nodes.local(13).unwrap();
        assert_abs_diff_eq!(grad[center][0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(grad[center][1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn roundoff_limit_floors_flat_hessians() {
        let grid = regular_cube(2);
        let mut hess = vec![[0.0; 6]; grid.nodes.max()];
        roundoff_limit(&mut hess, &grid).unwrap();
        // shortest incident edge is the sub-cube edge 0.5
        let floor = 4.0e-12 / 0.25;
        for node in grid.nodes.iter_valid() {
            let sys = matrix::eig(&hess[node]).unwrap();
            assert!(sys.eig[0] >= floor * (1.0 - 1e-12));
        }
    }
}
