//! Symmetric 3x3 tensor kernel.
//!
//! Metrics are carried as the upper triangle in the order
//! (m11, m12, m13, m22, m23, m33). Every routine here is pure on its inputs;
//! decompositions route through nalgebra and re-symmetrize on the way out.

use nalgebra as na;

use crate::error::{Error, Result};
use crate::math::divisible;

/// Upper triangle of a symmetric 3x3 matrix: (11, 12, 13, 22, 23, 33).
pub type SymMat = [f64; 6];

/// Eigen-decomposition of a [`SymMat`]: ascending eigenvalues with the
/// matching right-eigenvectors in columns.
#[derive(Debug, Clone, Copy)]
pub struct DiagSys {
    pub eig: [f64; 3],
    /// `vec[j]` is the unit eigenvector paired with `eig[j]`.
    pub vec: [[f64; 3]; 3],
}

pub fn to_na(m: &SymMat) -> na::Matrix3<f64> {
    na::Matrix3::new(m[0], m[1], m[2], m[1], m[3], m[4], m[2], m[4], m[5])
}

pub fn from_na(m: &na::Matrix3<f64>) -> SymMat {
    // averaging the off-diagonal pairs scrubs round-off asymmetry
    [
        m[(0, 0)],
        0.5 * (m[(0, 1)] + m[(1, 0)]),
        0.5 * (m[(0, 2)] + m[(2, 0)]),
        m[(1, 1)],
        0.5 * (m[(1, 2)] + m[(2, 1)]),
        m[(2, 2)],
    ]
}

pub fn det(m: &SymMat) -> f64 {
    m[0] * (m[3] * m[5] - m[4] * m[4]) - m[1] * (m[1] * m[5] - m[4] * m[2])
        + m[2] * (m[1] * m[4] - m[3] * m[2])
}

/// Length of `v` measured in the metric `m`: sqrt(v^T M v).
pub fn sqrt_vt_m_v(m: &SymMat, v: &[f64; 3]) -> f64 {
    (v[0] * (m[0] * v[0] + m[1] * v[1] + m[2] * v[2])
        + v[1] * (m[1] * v[0] + m[3] * v[1] + m[4] * v[2])
        + v[2] * (m[2] * v[0] + m[4] * v[1] + m[5] * v[2]))
        .sqrt()
}

/// Eigen-decomposition with eigenvalues sorted ascending.
pub fn eig(m: &SymMat) -> Result<DiagSys> {
    for value in m {
        if !value.is_finite() {
            return Err(Error::DivZero("non-finite metric entry".to_string()));
        }
    }
    let se = na::linalg::SymmetricEigen::new(to_na(m));
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| se.eigenvalues[a].total_cmp(&se.eigenvalues[b]));
    let mut sys = DiagSys {
        eig: [0.0; 3],
        vec: [[0.0; 3]; 3],
    };
    for (slot, &col) in order.iter().enumerate() {
        sys.eig[slot] = se.eigenvalues[col];
        for row in 0..3 {
            sys.vec[slot][row] = se.eigenvectors[(row, col)];
        }
    }
    Ok(sys)
}

/// Reassemble V diag(eig) V^T.
pub fn reform(sys: &DiagSys) -> SymMat {
    let mut m = [0.0; 6];
    let index = [(0, 0), (0, 1), (0, 2), (1, 1), (1, 2), (2, 2)];
    for (slot, &(row, col)) in index.iter().enumerate() {
        let mut sum = 0.0;
        for j in 0..3 {
            sum += sys.eig[j] * sys.vec[j][row] * sys.vec[j][col];
        }
        m[slot] = sum;
    }
    m
}

fn map_eigenvalues(m: &SymMat, f: impl Fn(f64) -> Result<f64>) -> Result<SymMat> {
    let mut sys = eig(m)?;
    for value in &mut sys.eig {
        *value = f(*value)?;
    }
    Ok(reform(&sys))
}

/// Matrix logarithm of an SPD metric.
pub fn log_m(m: &SymMat) -> Result<SymMat> {
    map_eigenvalues(m, |eigenvalue| {
        if eigenvalue <= 0.0 || !eigenvalue.is_finite() {
            return Err(Error::DivZero(format!(
                "log of non-positive eigenvalue {eigenvalue:e}"
            )));
        }
        Ok(eigenvalue.ln())
    })
}

/// Matrix exponential; always SPD for finite input.
pub fn exp_m(m: &SymMat) -> Result<SymMat> {
    map_eigenvalues(m, |eigenvalue| {
        let exp = eigenvalue.exp();
        if !exp.is_finite() {
            return Err(Error::DivZero(format!("exp overflow at {eigenvalue:e}")));
        }
        Ok(exp)
    })
}

/// Principal square root of an SPD metric.
pub fn sqrt_m(m: &SymMat) -> Result<SymMat> {
    map_eigenvalues(m, |eigenvalue| {
        if eigenvalue < 0.0 {
            return Err(Error::DivZero(format!(
                "sqrt of negative eigenvalue {eigenvalue:e}"
            )));
        }
        Ok(eigenvalue.sqrt())
    })
}

/// Inverse of an SPD metric.
pub fn inv_m(m: &SymMat) -> Result<SymMat> {
    let inv = to_na(m)
        .try_inverse()
        .ok_or_else(|| Error::DivZero("singular metric".to_string()))?;
    Ok(from_na(&inv))
}

/// Dense product of two symmetric matrices (the result is not symmetric).
pub fn mult_m(m0: &SymMat, m1: &SymMat) -> na::Matrix3<f64> {
    to_na(m0) * to_na(m1)
}

/// Metric intersection of Alauzet: diagonalize in the joint basis of m0 and
/// m1 and keep the larger eigenvalue in each direction.
///
/// Implemented by simultaneous reduction: with S = m0^{1/2}, the symmetric
/// pencil T = S^{-1} m1 S^{-1} shares eigenvectors with m0^{-1} m1, and the
/// intersection is S V max(diag, I) V^T S.
pub fn intersect(m0: &SymMat, m1: &SymMat) -> Result<SymMat> {
    let s = sqrt_m(m0)?;
    let s_inv = inv_m(&s)?;
    let t = from_na(&(to_na(&s_inv) * to_na(m1) * to_na(&s_inv)));
    let mut sys = eig(&t)?;
    for value in &mut sys.eig {
        *value = value.max(1.0);
    }
    let joined = to_na(&s) * to_na(&reform(&sys)) * to_na(&s);
    let joined = from_na(&joined);
    for value in &joined {
        if !value.is_finite() {
            return Err(Error::DivZero("non-finite intersection".to_string()));
        }
    }
    Ok(joined)
}

/// Modified Gram-Schmidt QR of a column-major m x n system.
///
/// Returns (q, r) with q m x n and r n x n upper triangular. A pivot below
/// `1e-13` of the largest column norm reports `IllConditioned`.
pub fn qr(a: &ndarray::Array2<f64>) -> Result<(ndarray::Array2<f64>, ndarray::Array2<f64>)> {
    let (m, n) = a.dim();
    if m < n {
        return Err(Error::Invalid(format!("underdetermined qr {m}x{n}")));
    }
    let mut q = a.clone();
    let mut r = ndarray::Array2::<f64>::zeros((n, n));
    let scale = a.iter().fold(0.0f64, |acc, &v| acc.max(v.abs())).max(1.0);
    for j in 0..n {
        for i in 0..j {
            let mut proj = 0.0;
            for k in 0..m {
                proj += q[(k, i)] * q[(k, j)];
            }
            r[(i, j)] = proj;
            for k in 0..m {
                q[(k, j)] -= proj * q[(k, i)];
            }
        }
        let mut norm = 0.0;
        for k in 0..m {
            norm += q[(k, j)] * q[(k, j)];
        }
        let norm = norm.sqrt();
        if norm <= 1.0e-13 * scale {
            return Err(Error::IllConditioned(format!(
                "qr pivot {norm:e} at column {j}"
            )));
        }
        r[(j, j)] = norm;
        for k in 0..m {
            q[(k, j)] /= norm;
        }
    }
    Ok((q, r))
}

/// Solve R x = Q^T b for the QR pair produced by [`qr`].
pub fn qr_solve(
    q: &ndarray::Array2<f64>,
    r: &ndarray::Array2<f64>,
    b: &[f64],
) -> Result<Vec<f64>> {
    let (m, n) = q.dim();
    if b.len() != m {
        return Err(Error::Invalid(format!(
            "rhs length {} for {m}x{n} system",
            b.len()
        )));
    }
    let mut qtb = vec![0.0; n];
    for j in 0..n {
        for k in 0..m {
            qtb[j] += q[(k, j)] * b[k];
        }
    }
    let mut x = vec![0.0; n];
    for jj in (0..n).rev() {
        let mut sum = qtb[jj];
        for kk in jj + 1..n {
            sum -= r[(jj, kk)] * x[kk];
        }
        if !divisible(sum, r[(jj, jj)]) {
            return Err(Error::IllConditioned(format!("singular r at {jj}")));
        }
        x[jj] = sum / r[(jj, jj)];
    }
    Ok(x)
}

/// The SPD matrix that maps the tet (xyz0..xyz3) onto the reference regular
/// tet: solve the six-unknown system requiring unit metric length on each of
/// the six edges.
pub fn imply_m(
    xyz0: &[f64; 3],
    xyz1: &[f64; 3],
    xyz2: &[f64; 3],
    xyz3: &[f64; 3],
) -> Result<SymMat> {
    let corners = [xyz0, xyz1, xyz2, xyz3];
    let edges = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
    let mut a = na::Matrix6::<f64>::zeros();
    let mut rhs = na::Vector6::<f64>::from_element(1.0);
    for (row, &(n0, n1)) in edges.iter().enumerate() {
        let dx = corners[n1][0] - corners[n0][0];
        let dy = corners[n1][1] - corners[n0][1];
        let dz = corners[n1][2] - corners[n0][2];
        a[(row, 0)] = dx * dx;
        a[(row, 1)] = 2.0 * dx * dy;
        a[(row, 2)] = 2.0 * dx * dz;
        a[(row, 3)] = dy * dy;
        a[(row, 4)] = 2.0 * dy * dz;
        a[(row, 5)] = dz * dz;
    }
    let lu = a.lu();
    if !lu.solve_mut(&mut rhs) {
        return Err(Error::DivZero("implied metric system singular".to_string()));
    }
    let m = [rhs[0], rhs[1], rhs[2], rhs[3], rhs[4], rhs[5]];
    for value in &m {
        if !value.is_finite() {
            return Err(Error::DivZero("implied metric not finite".to_string()));
        }
    }
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    pub fn assert_sym_eq(a: &SymMat, b: &SymMat, tol: f64) {
        for i in 0..6 {
            assert_abs_diff_eq!(a[i], b[i], epsilon = tol);
        }
    }

    #[test]
    fn eig_identity() {
        let sys = eig(&[1.0, 0.0, 0.0, 1.0, 0.0, 1.0]).unwrap();
        for value in sys.eig {
            assert_abs_diff_eq!(value, 1.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn eig_sorted_ascending() {
        let m = [4.0, 0.0, 0.0, 9.0, 0.0, 1.0];
        let sys = eig(&m).unwrap();
        assert_abs_diff_eq!(sys.eig[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sys.eig[1], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sys.eig[2], 9.0, epsilon = 1e-12);
    }

    #[test]
    fn log_exp_round_trip() {
        let m = [10.0, 1.0, 0.5, 8.0, 0.25, 4.0];
        let back = exp_m(&log_m(&m).unwrap()).unwrap();
        assert_sym_eq(&m, &back, 1e-12);
    }

    #[test]
    fn sqrt_squares_back() {
        let m = [4.0, 0.0, 0.0, 9.0, 0.0, 16.0];
        let s = sqrt_m(&m).unwrap();
        let squared = from_na(&(to_na(&s) * to_na(&s)));
        assert_sym_eq(&m, &squared, 1e-12);
    }

    #[test]
    fn intersect_self_is_identity_operation() {
        let m = [2.0, 0.4, 0.1, 3.0, 0.2, 5.0];
        let joined = intersect(&m, &m).unwrap();
        assert_sym_eq(&m, &joined, 1e-12);
    }

    #[test]
    fn intersect_takes_max_spacing() {
        let coarse = [1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let fine = [100.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let joined = intersect(&coarse, &fine).unwrap();
        assert_sym_eq(&joined, &fine, 1e-10);
    }

    #[test]
    fn intersect_commutes() {
        let m0 = [2.0, 0.3, 0.0, 1.5, 0.1, 4.0];
        let m1 = [1.0, -0.2, 0.4, 5.0, 0.0, 2.0];
        let ab = intersect(&m0, &m1).unwrap();
        let ba = intersect(&m1, &m0).unwrap();
        assert_sym_eq(&ab, &ba, 1e-10);
    }

    #[test]
    fn inv_mult_recovers_identity() {
        let m = [3.0, 0.5, 0.1, 2.0, 0.2, 4.0];
        let inv = inv_m(&m).unwrap();
        let product = mult_m(&m, &inv);
        for row in 0..3 {
            for col in 0..3 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[(row, col)], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn metric_edge_length() {
        let m = [4.0, 0.0, 0.0, 9.0, 0.0, 16.0];
        assert_abs_diff_eq!(sqrt_vt_m_v(&m, &[1.0, 0.0, 0.0]), 2.0);
        assert_abs_diff_eq!(sqrt_vt_m_v(&m, &[0.0, 1.0, 0.0]), 3.0);
        assert_abs_diff_eq!(sqrt_vt_m_v(&m, &[0.0, 0.0, 1.0]), 4.0);
    }

    #[test]
    fn imply_unit_tet() {
        // regular reference mapping of the right unit tet, spacing-one edges
        let m = imply_m(
            &[0.0, 0.0, 0.0],
            &[1.0, 0.0, 0.0],
            &[0.0, 1.0, 0.0],
            &[0.0, 0.0, 1.0],
        )
        .unwrap();
        let expected = [1.0, 0.5, 0.5, 1.0, 0.5, 1.0];
        assert_sym_eq(&m, &expected, 1e-10);
    }

    #[test]
    fn qr_reconstructs() {
        let a = ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let (q, r) = qr(&a).unwrap();
        let mut qr_product = ndarray::Array2::<f64>::zeros((3, 2));
        for i in 0..3 {
            for j in 0..2 {
                for k in 0..2 {
                    qr_product[(i, j)] += q[(i, k)] * r[(k, j)];
                }
            }
        }
        for i in 0..3 {
            for j in 0..2 {
                assert_abs_diff_eq!(qr_product[(i, j)], a[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn qr_flags_rank_deficiency() {
        let a = ndarray::arr2(&[[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]]);
        assert!(matches!(qr(&a), Err(Error::IllConditioned(_))));
    }

    #[test]
    fn qr_solves_least_squares() {
        let a = ndarray::arr2(&[[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]]);
        let (q, r) = qr(&a).unwrap();
        let x = qr_solve(&q, &r, &[3.0, 4.0, 9.0]).unwrap();
        assert_abs_diff_eq!(x[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 4.0, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn log_exp_round_trip_random_spd(
            l1 in 1.0e-3..1.0e3f64,
            l2 in 1.0e-3..1.0e3f64,
            l3 in 1.0e-3..1.0e3f64,
            angle in 0.0..std::f64::consts::PI,
        ) {
            // rotation about z keeps conditioning bounded by the ranges above
            let (sin, cos) = angle.sin_cos();
            let sys = DiagSys {
                eig: [l1, l2, l3],
                vec: [[cos, sin, 0.0], [-sin, cos, 0.0], [0.0, 0.0, 1.0]],
            };
            let m = reform(&sys);
            let back = exp_m(&log_m(&m).unwrap()).unwrap();
            let scale = m.iter().fold(1.0f64, |acc, v| acc.max(v.abs()));
            for i in 0..6 {
                prop_assert!((m[i] - back[i]).abs() <= 1e-12 * scale.max(1.0));
            }
        }
    }
}
