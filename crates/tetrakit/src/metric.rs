//! Metric-field construction and conditioning.
//!
//! Work arrays carry the physical metric (one [`SymMat`] per node slot);
//! averaging and interpolation happen in log space and return to physical
//! form through the matrix exponential. Gradation and complexity control
//! follow Alauzet, "Size gradation control of anisotropic meshes"
//! (doi:10.1016/j.finel.2009.06.028).

use tracing::warn;

use crate::cell::CellKind;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::math::{cross, divisible, sub, tet_volume, tri_area};
use crate::matrix::{self, DiagSys, SymMat};
use crate::recon::{self, Reconstruction};

/// Pull the per-node physical metric into a work array sized to the slot
/// range.
pub fn from_node(grid: &Grid) -> Result<Vec<SymMat>> {
    let mut metric = vec![[0.0; 6]; grid.nodes.max()];
    for node in grid.nodes.iter_valid() {
        metric[node] = grid.nodes.metric_get(node)?;
    }
    Ok(metric)
}

/// Store a work array back onto the nodes.
pub fn to_node(metric: &[SymMat], grid: &mut Grid) -> Result<()> {
    let valid: Vec<usize> = grid.nodes.iter_valid().collect();
    for node in valid {
        grid.nodes.metric_set(node, &metric[node])?;
    }
    Ok(())
}

/// Refresh ghost copies of a metric work array from each node's owner.
fn ghost_metric(metric: &mut [SymMat], grid: &Grid) -> Result<()> {
    if !grid.comm.para() {
        return Ok(());
    }
    let mut flat = vec![0.0; 6 * metric.len()];
    for (node, m) in metric.iter().enumerate() {
        flat[6 * node..6 * node + 6].copy_from_slice(m);
    }
    grid.nodes.ghost_sync_dbl(&grid.comm, &mut flat, 6)?;
    for (node, m) in metric.iter_mut().enumerate() {
        m.copy_from_slice(&flat[6 * node..6 * node + 6]);
    }
    Ok(())
}

/// Log-Euclidean blend of two log metrics at parameter `t` in [0, 1].
pub fn interpolate_log_segment(log0: &SymMat, log1: &SymMat, t: f64) -> SymMat {
    let mut blended = [0.0; 6];
    for i in 0..6 {
        blended[i] = (1.0 - t) * log0[i] + t * log1[i];
    }
    blended
}

/// Log-Euclidean blend over a cell at barycentric weights.
pub fn interpolate_log_cell(logs: &[SymMat], bary: &[f64]) -> SymMat {
    let mut blended = [0.0; 6];
    for (log_m, &weight) in logs.iter().zip(bary) {
        for i in 0..6 {
            blended[i] += weight * log_m[i];
        }
    }
    blended
}

/// Constant-spacing tensor diag(1/h^2).
pub fn isotropic(h: f64) -> SymMat {
    let eig = 1.0 / (h * h);
    [eig, 0.0, 0.0, eig, 0.0, eig]
}

/// Layered test field: spacing 0.1 in x and y, h(z) pinching to `h` at the
/// z = 0.5 midplane.
pub fn olympic_node(grid: &mut Grid, h: f64) -> Result<()> {
    let valid: Vec<usize> = grid.nodes.iter_valid().collect();
    for node in valid {
        let z = grid.nodes.xyz(node)[2];
        let hh = h + (0.1 - h) * (z - 0.5).abs() / 0.5;
        let m = [
            1.0 / (0.1 * 0.1),
            0.0,
            0.0,
            1.0 / (0.1 * 0.1),
            0.0,
            1.0 / (hh * hh),
        ];
        grid.nodes.metric_set(node, &m)?;
    }
    Ok(())
}

/// Test field: spacing tightening toward the z = 0 side.
pub fn side_node(grid: &mut Grid) -> Result<()> {
    let h0 = 0.1;
    let h = 0.01;
    let valid: Vec<usize> = grid.nodes.iter_valid().collect();
    for node in valid {
        let z = grid.nodes.xyz(node)[2];
        let hh = h + (h0 - h) * z.abs();
        let m = [
            1.0 / (0.1 * 0.1),
            0.0,
            0.0,
            1.0 / (0.1 * 0.1),
            0.0,
            1.0 / (hh * hh),
        ];
        grid.nodes.metric_set(node, &m)?;
    }
    Ok(())
}

/// Test field: x spacing pinching on the ring x = 1.
pub fn ring_node(grid: &mut Grid) -> Result<()> {
    let h = 0.01;
    let valid: Vec<usize> = grid.nodes.iter_valid().collect();
    for node in valid {
        let x = grid.nodes.xyz(node)[0];
        let hh = h + (0.1 - h) * (2.0 * (x - 1.0).abs()).min(1.0);
        let m = [
            1.0 / (hh * hh),
            0.0,
            0.0,
            1.0 / (0.1 * 0.1),
            0.0,
            1.0 / (0.1 * 0.1),
        ];
        grid.nodes.metric_set(node, &m)?;
    }
    Ok(())
}

fn accumulate_sub_tet(
    picks: [usize; 4],
    nodes: &[usize],
    grid: &Grid,
    metric: &mut [SymMat],
    total_volume: &mut [f64],
) -> Result<()> {
    let xyz: [&[f64; 3]; 4] = [
        grid.nodes.xyz(nodes[picks[0]]),
        grid.nodes.xyz(nodes[picks[1]]),
        grid.nodes.xyz(nodes[picks[2]]),
        grid.nodes.xyz(nodes[picks[3]]),
    ];
    let volume = tet_volume(xyz[0], xyz[1], xyz[2], xyz[3]);
    let implied = matrix::imply_m(xyz[0], xyz[1], xyz[2], xyz[3]);
    match implied {
        Ok(m) if volume > 0.0 => {
            let log_m = matrix::log_m(&m)?;
            for &node in nodes {
                total_volume[node] += volume;
                for i in 0..6 {
                    metric[node][i] += volume * log_m[i];
                }
            }
        }
        _ => {} // singular contribution skipped
    }
    Ok(())
}

const PRI_SUB_TETS: [[usize; 4]; 3] = [[0, 4, 5, 3], [0, 1, 5, 4], [0, 1, 2, 5]];
const PYR_SUB_TETS: [[usize; 4]; 2] = [[0, 4, 1, 2], [0, 3, 4, 2]];
const HEX_SUB_TETS: [[usize; 4]; 6] = [
    [0, 5, 7, 4],
    [0, 1, 7, 5],
    [1, 6, 7, 5],
    [0, 7, 2, 3],
    [0, 7, 1, 2],
    [1, 7, 6, 2],
];

fn sub_tets_of(kind: CellKind) -> &'static [[usize; 4]] {
    match kind {
        CellKind::Tet => &[[0, 1, 2, 3]],
        CellKind::Pri => &PRI_SUB_TETS,
        CellKind::Pyr => &PYR_SUB_TETS,
        CellKind::Hex => &HEX_SUB_TETS,
        _ => &[],
    }
}

/// The metric implied by the mesh itself: per vertex, the volume-weighted
/// log average of the unit-tet metric of every incident sub-tet.
pub fn imply_from(grid: &Grid) -> Result<Vec<SymMat>> {
    let max = grid.nodes.max();
    let mut metric = vec![[0.0; 6]; max];
    let mut total_volume = vec![0.0; max];

    for kind in CellKind::VOLUME {
        let table = grid.cells(kind);
        for cell in table.valid_cells() {
            let nodes = table.nodes_of(cell)?;
            for &picks in sub_tets_of(kind) {
                accumulate_sub_tet(picks, nodes, grid, &mut metric, &mut total_volume)?;
            }
        }
    }

    for node in grid.nodes.iter_valid() {
        if !grid.nodes.owned(node) {
            continue;
        }
        if total_volume[node] <= 0.0 {
            return Err(Error::Invalid(format!(
                "no metric contributions at {}",
                grid.nodes.location(node)
            )));
        }
        let mut log_m = [0.0; 6];
        for i in 0..6 {
            if !divisible(metric[node][i], total_volume[node]) {
                return Err(Error::DivZero("zero imply volume".to_string()));
            }
            log_m[i] = metric[node][i] / total_volume[node];
        }
        metric[node] = matrix::exp_m(&log_m)?;
    }

    ghost_metric(&mut metric, grid)?;
    Ok(metric)
}

/// Override the metric near mixed elements with the one their sub-tets
/// imply, leaving pure-tet territory untouched.
pub fn imply_non_tet(metric: &mut [SymMat], grid: &Grid) -> Result<()> {
    let max = grid.nodes.max();
    let backup = metric.to_vec();
    let mut total_volume = vec![0.0; max];

    let touches_mixed = |node: usize| {
        !grid.cells(CellKind::Pyr).node_empty(node)
            || !grid.cells(CellKind::Pri).node_empty(node)
            || !grid.cells(CellKind::Hex).node_empty(node)
    };

    for node in grid.nodes.iter_valid() {
        if touches_mixed(node) {
            metric[node] = [0.0; 6];
        }
    }

    for kind in [CellKind::Pri, CellKind::Pyr, CellKind::Hex] {
        let table = grid.cells(kind);
        for cell in table.valid_cells() {
            let nodes = table.nodes_of(cell)?;
            for &picks in sub_tets_of(kind) {
                accumulate_sub_tet(picks, nodes, grid, metric, &mut total_volume)?;
            }
        }
    }

    for node in grid.nodes.iter_valid() {
        if !touches_mixed(node) {
            continue;
        }
        if !grid.nodes.owned(node) {
            continue;
        }
        if total_volume[node] > 0.0 {
            let mut log_m = [0.0; 6];
            for i in 0..6 {
                if !divisible(metric[node][i], total_volume[node]) {
                    return Err(Error::DivZero("zero imply volume".to_string()));
                }
                log_m[i] = metric[node][i] / total_volume[node];
            }
            metric[node] = matrix::exp_m(&log_m)?;
        } else {
            metric[node] = backup[node];
        }
        for value in &metric[node] {
            if !value.is_finite() {
                return Err(Error::DivZero("imply not finite".to_string()));
            }
        }
    }

    ghost_metric(metric, grid)
}

/// SMR combination: in each joint eigendirection of (implied, user), keep
/// the user spacing clamped to [0.25, 4] times the implied spacing.
pub fn smr(implied: &[SymMat], user: &[SymMat], grid: &Grid) -> Result<Vec<SymMat>> {
    let mut combined = vec![[0.0; 6]; grid.nodes.max()];
    for node in grid.nodes.iter_valid() {
        let s = matrix::sqrt_m(&implied[node])?;
        let s_inv = matrix::inv_m(&s)?;
        let pencil =
            matrix::from_na(&(matrix::to_na(&s_inv) * matrix::to_na(&user[node]) * matrix::to_na(&s_inv)));
        let joint = matrix::eig(&pencil)?;
        let mut sys = DiagSys {
            eig: [0.0; 3],
            vec: joint.vec,
        };
        for dir in 0..3 {
            // joint direction back in physical coordinates
            let v = &joint.vec[dir];
            let mut direction = [0.0; 3];
            let s_inv_na = matrix::to_na(&s_inv);
            for row in 0..3 {
                direction[row] =
                    s_inv_na[(row, 0)] * v[0] + s_inv_na[(row, 1)] * v[1] + s_inv_na[(row, 2)] * v[2];
            }
            let len0 = matrix::sqrt_vt_m_v(&implied[node], &direction);
            if !divisible(1.0, len0) {
                return Err(Error::DivZero("smr implied spacing".to_string()));
            }
            let h0 = 1.0 / len0;
            let len1 = matrix::sqrt_vt_m_v(&user[node], &direction);
            if !divisible(1.0, len1) {
                return Err(Error::DivZero("smr user spacing".to_string()));
            }
            let h1 = 1.0 / len1;
            let h = h1.clamp(0.25 * h0, 4.0 * h0);
            if !divisible(1.0, h * h) {
                return Err(Error::DivZero("smr spacing squared".to_string()));
            }
            sys.eig[dir] = 1.0 / (h * h);
        }
        // assemble S V diag S V^T to return to physical coordinates
        let v_na = nalgebra::Matrix3::from_fn(|row, col| sys.vec[col][row]);
        let d_na = nalgebra::Matrix3::from_diagonal(&nalgebra::Vector3::new(
            sys.eig[0],
            sys.eig[1],
            sys.eig[2],
        ));
        let s_na = matrix::to_na(&s);
        combined[node] = matrix::from_na(&(s_na * v_na * d_na * v_na.transpose() * s_na));
    }
    Ok(combined)
}

fn edge_direction(grid: &Grid, node0: usize, node1: usize) -> [f64; 3] {
    sub(grid.nodes.xyz(node1), grid.nodes.xyz(node0))
}

fn limit_one_end(
    metric: &mut [SymMat],
    orig: &[SymMat],
    limited_node: usize,
    limiter_node: usize,
    limit_metric: &SymMat,
    grid: &Grid,
    context: &str,
) {
    match matrix::intersect(&orig[limited_node], limit_metric)
        .and_then(|limited| matrix::intersect(&metric[limited_node], &limited))
    {
        Ok(updated) => metric[limited_node] = updated,
        Err(_) => {
            warn!(
                "recover {context}: {} limited by {}",
                grid.nodes.location(limited_node),
                grid.nodes.location(limiter_node)
            );
        }
    }
}

/// Metric-space homogeneous gradation: limit each end of every edge by the
/// other end's metric shrunk by (1 + ratio log r)^-2.
pub fn metric_space_gradation(metric: &mut [SymMat], grid: &Grid, r: f64) -> Result<()> {
    let log_r = r.ln();
    let edges = crate::edge::EdgeTable::create(grid);
    let orig = metric.to_vec();

    for [node0, node1] in edges.iter() {
        let direction = edge_direction(grid, node0, node1);

        let ratio = matrix::sqrt_vt_m_v(&orig[node1], &direction);
        let enlarge = (1.0 + ratio * log_r).powi(-2);
        let mut limit_metric = orig[node1];
        for value in &mut limit_metric {
            *value *= enlarge;
        }
        limit_one_end(metric, &orig, node0, node1, &limit_metric, grid, "gradation");

        let ratio = matrix::sqrt_vt_m_v(&orig[node0], &direction);
        let enlarge = (1.0 + ratio * log_r).powi(-2);
        let mut limit_metric = orig[node0];
        for value in &mut limit_metric {
            *value *= enlarge;
        }
        limit_one_end(metric, &orig, node1, node0, &limit_metric, grid, "gradation");
    }

    ghost_metric(metric, grid)
}

/// Mixed-space homogeneous gradation blending physical and metric distance
/// with exponent `t` (defaults to 1/8 when out of range; `r` below one
/// defaults to 1.5).
pub fn mixed_space_gradation(metric: &mut [SymMat], grid: &Grid, r: f64, t: f64) -> Result<()> {
    let r = if r < 1.0 { 1.5 } else { r };
    let t = if (0.0..=1.0).contains(&t) { t } else { 0.125 };
    let log_r = r.ln();
    let edges = crate::edge::EdgeTable::create(grid);
    let orig = metric.to_vec();

    let limit_from = |limiter: usize, dist: f64, direction: &[f64; 3]| -> Result<SymMat> {
        let ratio = matrix::sqrt_vt_m_v(&orig[limiter], direction);
        let mut sys = matrix::eig(&orig[limiter])?;
        for dir in 0..3 {
            let metric_space = 1.0 + log_r * ratio;
            let phys_space = 1.0 + sys.eig[dir].sqrt() * dist * log_r;
            let enlarge = (phys_space.powf(t) * metric_space.powf(1.0 - t)).powi(-2);
            sys.eig[dir] *= enlarge;
        }
        Ok(matrix::reform(&sys))
    };

    for [node0, node1] in edges.iter() {
        let direction = edge_direction(grid, node0, node1);
        let dist = crate::math::dot(&direction, &direction).sqrt();

        let limit_metric = limit_from(node1, dist, &direction)?;
        limit_one_end(metric, &orig, node0, node1, &limit_metric, grid, "mixed gradation");

        let limit_metric = limit_from(node0, dist, &direction)?;
        limit_one_end(metric, &orig, node1, node0, &limit_metric, grid, "mixed gradation");
    }

    ghost_metric(metric, grid)
}

fn global_tet_count(grid: &Grid) -> i64 {
    let mut owned = 0i64;
    let table = grid.cells(CellKind::Tet);
    for cell in table.valid_cells() {
        if grid
            .cell_owner(CellKind::Tet, cell)
            .map(|part| part == grid.comm.rank())
            .unwrap_or(false)
        {
            owned += 1;
        }
    }
    grid.comm.allsum_int(owned)
}

/// Continuous complexity of the field: integral of sqrt(det M), accumulated
/// per owning vertex over incident tet volumes (triangle areas in 2D).
pub fn complexity(metric: &[SymMat], grid: &Grid) -> Result<f64> {
    let have_tet = global_tet_count(grid) > 0;
    let kind = if have_tet { CellKind::Tet } else { CellKind::Tri };
    let table = grid.cells(kind);
    let node_per = kind.node_per() as f64;
    let mut total = 0.0;
    for cell in table.valid_cells() {
        let nodes = table.nodes_of(cell)?;
        let volume = if have_tet {
            tet_volume(
                grid.nodes.xyz(nodes[0]),
                grid.nodes.xyz(nodes[1]),
                grid.nodes.xyz(nodes[2]),
                grid.nodes.xyz(nodes[3]),
            )
        } else {
            tri_area(
                grid.nodes.xyz(nodes[0]),
                grid.nodes.xyz(nodes[1]),
                grid.nodes.xyz(nodes[2]),
            )
        };
        for &node in nodes {
            if grid.nodes.owned(node) {
                let det = matrix::det(&metric[node]);
                if det > 0.0 {
                    total += det.sqrt() * volume / node_per;
                }
            }
        }
    }
    Ok(grid.comm.allsum_dbl(total))
}

fn complexity_scale_exponent(grid: &Grid) -> f64 {
    if grid.twod { 1.0 } else { 2.0 / 3.0 }
}

fn rescale_to_complexity(metric: &mut [SymMat], grid: &Grid, target: f64) -> Result<()> {
    let current = complexity(metric, grid)?;
    if !divisible(target, current) {
        return Err(Error::DivZero(format!(
            "complexity target {target:e} over current {current:e}"
        )));
    }
    let scale = (target / current).powf(complexity_scale_exponent(grid));
    for node in grid.nodes.iter_valid() {
        for value in &mut metric[node] {
            *value *= scale;
        }
        if grid.twod {
            metric[node][2] = 0.0;
            metric[node][4] = 0.0;
            metric[node][5] = 1.0;
        }
    }
    Ok(())
}

/// One global rescale to the target complexity.
pub fn set_complexity(metric: &mut [SymMat], grid: &Grid, target: f64) -> Result<()> {
    rescale_to_complexity(metric, grid, target)
}

/// Interleave global complexity scaling with the gradation limiter until
/// both settle; a `gradation` below one selects the mixed-space limiter.
pub fn gradation_at_complexity(
    metric: &mut [SymMat],
    grid: &Grid,
    gradation: f64,
    target: f64,
) -> Result<()> {
    for _relaxation in 0..20 {
        rescale_to_complexity(metric, grid, target)?;
        if gradation < 1.0 {
            mixed_space_gradation(metric, grid, -1.0, -1.0)?;
        } else {
            metric_space_gradation(metric, grid, gradation)?;
        }
        if grid.twod {
            for node in grid.nodes.iter_valid() {
                metric[node][2] = 0.0;
                metric[node][4] = 0.0;
                metric[node][5] = 1.0;
            }
        }
    }
    rescale_to_complexity(metric, grid, target)
}

/// Clamp every eigenvalue's spacing into [hmin, hmax]; non-positive bounds
/// are ignored. Applying the clamp twice equals applying it once.
pub fn limit_h(metric: &mut [SymMat], grid: &Grid, hmin: f64, hmax: f64) -> Result<()> {
    for node in grid.nodes.iter_valid() {
        let mut sys = matrix::eig(&metric[node])?;
        if hmin > 0.0 {
            let ceiling = 1.0 / (hmin * hmin);
            for value in &mut sys.eig {
                *value = value.min(ceiling);
            }
        }
        if hmax > 0.0 {
            let floor = 1.0 / (hmax * hmax);
            for value in &mut sys.eig {
                *value = value.max(floor);
            }
        }
        metric[node] = matrix::reform(&sys);
    }
    Ok(())
}

/// Relax global scaling against the h clamp.
pub fn limit_h_at_complexity(
    metric: &mut [SymMat],
    grid: &Grid,
    hmin: f64,
    hmax: f64,
    target: f64,
) -> Result<()> {
    for _relaxation in 0..10 {
        rescale_to_complexity(metric, grid, target)?;
        limit_h(metric, grid, hmin, hmax)?;
    }
    Ok(())
}

/// Raise the smallest eigenvalue so no direction is more than
/// `aspect_ratio` times coarser than the finest.
pub fn limit_aspect_ratio(metric: &mut [SymMat], grid: &Grid, aspect_ratio: f64) -> Result<()> {
    for node in grid.nodes.iter_valid() {
        let mut sys = matrix::eig(&metric[node])?;
        let max_eig = sys.eig[0].max(sys.eig[1]).max(sys.eig[2]);
        if !divisible(max_eig, aspect_ratio * aspect_ratio) {
            return Err(Error::DivZero("aspect ratio limit".to_string()));
        }
        let limit_eig = max_eig / (aspect_ratio * aspect_ratio);
        for value in &mut sys.eig {
            *value = value.max(limit_eig);
        }
        metric[node] = matrix::reform(&sys);
    }
    Ok(())
}

/// Per-vertex det^{-1/(2p+dim)} scaling of a recovered Hessian, the local
/// step of the Lp multiscale metric; an optional spacing weight divides in
/// afterwards.
pub fn local_scale(
    metric: &mut [SymMat],
    weight: Option<&[f64]>,
    grid: &Grid,
    p_norm: i32,
) -> Result<()> {
    let dimension = if grid.twod { 2.0 } else { 3.0 };
    if grid.twod {
        for node in grid.nodes.iter_valid() {
            metric[node][2] = 0.0;
            metric[node][4] = 0.0;
            metric[node][5] = 1.0;
        }
    }
    let exponent = -1.0 / (2.0 * f64::from(p_norm) + dimension);
    for node in grid.nodes.iter_valid() {
        let det = matrix::det(&metric[node]);
        if det > 0.0 {
            let scale = det.powf(exponent);
            for value in &mut metric[node] {
                *value *= scale;
            }
        }
    }
    if grid.twod {
        for node in grid.nodes.iter_valid() {
            metric[node][2] = 0.0;
            metric[node][4] = 0.0;
            metric[node][5] = 1.0;
        }
    }
    if let Some(weight) = weight {
        for node in grid.nodes.iter_valid() {
            if weight[node] > 0.0 {
                for value in &mut metric[node] {
                    *value /= weight[node] * weight[node];
                }
            }
        }
    }
    Ok(())
}

/// The Lp multiscale metric generator: Hessian recovery, round-off floor,
/// local scaling, then gradation at the target complexity.
pub fn lp(
    grid: &Grid,
    scalar: &[f64],
    weight: Option<&[f64]>,
    reconstruction: Reconstruction,
    p_norm: i32,
    gradation: f64,
    target_complexity: f64,
) -> Result<Vec<SymMat>> {
    if !(1..=10).contains(&p_norm) {
        return Err(Error::Invalid(format!("p norm {p_norm} outside 1..=10")));
    }
    let mut metric = recon::hessian(grid, scalar, reconstruction)?;
    recon::roundoff_limit(&mut metric, grid)?;
    local_scale(&mut metric, weight, grid, p_norm)?;
    gradation_at_complexity(&mut metric, grid, gradation, target_complexity)?;
    Ok(metric)
}

/// Principal-curvature data provided by the CAD collaborator.
pub trait CurvatureSource {
    /// Diagonal of the model's bounding box.
    fn diagonal(&self) -> Result<f64>;
    /// Target segments per radian of turning.
    fn segments_per_radian(&self) -> f64;
    /// Target segments along the bounding-box diagonal.
    fn segments_per_diagonal(&self) -> f64 {
        10.0
    }
    /// Principal curvature frame of `face_id` at a vertex: (kr, r, ks, s).
    fn face_curvature(
        &self,
        grid: &Grid,
        node: usize,
        face_id: i64,
    ) -> Result<(f64, [f64; 3], f64, [f64; 3])>;
    /// One-dimensional curvature of `edge_id` at a vertex.
    fn edge_curvature(&self, grid: &Grid, node: usize, edge_id: i64) -> Result<f64>;
    /// Smallest trustworthy spacing on a face; non-positive disables.
    fn face_min_length(&self, _face_id: i64) -> f64 {
        -1.0
    }
    /// Prescribed initial normal spacing on a face; non-positive disables.
    fn face_initial_cell_height(&self, _face_id: i64) -> f64 {
        -1.0
    }
}

/// Build a curvature-driven metric on the boundary vertices and intersect
/// it into an isotropic background at the bounding-box spacing.
pub fn from_curvature(grid: &Grid, source: &dyn CurvatureSource) -> Result<Vec<SymMat>> {
    let hmax = source.diagonal()? / source.segments_per_diagonal().max(1.0);
    let delta_radian = 1.0 / source.segments_per_radian();
    let aspect_ratio = 20.0;
    let curvature_ratio = 1.0 / aspect_ratio;
    let norm_ratio = 2.0;
    let slop = 1.0e-5 * hmax;

    let mut metric = vec![isotropic(hmax); grid.nodes.max()];

    for node in grid.nodes.iter_valid() {
        if !grid.nodes.owned(node) {
            continue;
        }
        for record in grid.geom.records_of(node).to_vec() {
            match record.kind {
                crate::geom::GeomKind::Face => {
                    let (kr, r, ks, s) = source.face_curvature(grid, node, record.id)?;
                    // curvature is 1/radius, sign discarded
                    let mut kr = kr.abs();
                    let mut ks = ks.abs();
                    kr = kr.max(curvature_ratio * ks);
                    ks = ks.max(curvature_ratio * kr);
                    let rlimit = hmax / delta_radian;
                    let mut hr = hmax;
                    if 1.0 / rlimit < kr {
                        hr = delta_radian / kr;
                    }
                    let mut hs = hmax;
                    if 1.0 / rlimit < ks {
                        hs = delta_radian / ks;
                    }
                    if hr < slop || hs < slop {
                        continue;
                    }
                    let min_length = source.face_min_length(record.id);
                    if min_length > 0.0 && (hr < min_length || hs < min_length) {
                        continue;
                    }
                    let mut hn = hmax;
                    let initial = source.face_initial_cell_height(record.id);
                    if initial > 0.0 {
                        hn = initial;
                    }
                    hn = hn.min(norm_ratio * hr).min(norm_ratio * hs);
                    let n = cross(&r, &s);
                    let sys = DiagSys {
                        eig: [1.0 / (hr * hr), 1.0 / (hs * hs), 1.0 / (hn * hn)],
                        vec: [r, s, n],
                    };
                    let curvature_metric = matrix::reform(&sys);
                    metric[node] = matrix::intersect(&metric[node], &curvature_metric)?;
                }
                crate::geom::GeomKind::Edge => {
                    let k = source.edge_curvature(grid, node, record.id)?.abs();
                    let rlimit = hmax / delta_radian;
                    let mut hr = hmax;
                    if 1.0 / rlimit < k {
                        hr = delta_radian / k;
                    }
                    if hr < slop {
                        continue;
                    }
                    let curvature_metric = isotropic(hr);
                    metric[node] = matrix::intersect(&metric[node], &curvature_metric)?;
                }
                crate::geom::GeomKind::Node => {}
            }
        }
    }

    ghost_metric(&mut metric, grid)?;
    Ok(metric)
}

/// Replace the carried metric with the gradation-smoothed curvature metric.
pub fn interpolated_curvature(grid: &mut Grid, source: &dyn CurvatureSource) -> Result<()> {
    let mut curvature = from_curvature(grid, source)?;
    for _pass in 0..20 {
        mixed_space_gradation(&mut curvature, grid, -1.0, -1.0)?;
    }
    to_node(&curvature, grid)
}

/// Constrain the carried metric by the curvature metric after smoothing the
/// latter with repeated mixed-space gradation.
pub fn constrain_curvature(grid: &mut Grid, source: &dyn CurvatureSource) -> Result<()> {
    let mut curvature = from_curvature(grid, source)?;
    for _pass in 0..20 {
        mixed_space_gradation(&mut curvature, grid, -1.0, -1.0)?;
    }
    let valid: Vec<usize> = grid.nodes.iter_valid().collect();
    for node in valid {
        let carried = grid.nodes.metric_get(node)?;
        let constrained = matrix::intersect(&curvature[node], &carried)?;
        grid.nodes.metric_set(node, &constrained)?;
    }
    Ok(())
}
