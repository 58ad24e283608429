/// Computes the dot-product of `a` and `b`.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&ai, &bi)| ai * bi)
        .reduce(|x, y| x + y)
        .unwrap_or(0.0)
}

/// Computes the infinity norm: `max(abs(a))`
pub fn norm_inf(a: &[f64]) -> f64 {
    let mut max = 0.0;
    for i in 0..a.len() {
        let absvi = a[i].abs();
        if absvi > max {
            max = absvi
        }
    }
    max
}

/// Returns the 2-norm (Euclidean) of `a`.
pub fn norm(a: &[f64]) -> f64 {
    let mut sqsum = 0.0;
    for i in 0..a.len() {
        sqsum += a[i] * a[i];
    }
    f64::sqrt(sqsum)
}

/// Returns `x + s*y`.
pub fn add_scaled(x: &[f64], s: f64, y: &[f64]) -> Vec<f64> {
    x.iter().zip(y).map(|(xi, yi)| xi + s * yi).collect()
}

/// Returns `x - y`.
pub fn sub(x: &[f64], y: &[f64]) -> Vec<f64> {
    x.iter().zip(y).map(|(xi, yi)| xi - yi).collect()
}

/// Replaces `H` with `(H + H')/2`.
pub fn symmetrize(h_mat: &mut [Vec<f64>]) {
    let n = h_mat.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (h_mat[i][j] + h_mat[j][i]);
            h_mat[i][j] = v;
            h_mat[j][i] = v;
        }
    }
}

/// Attempts a Cholesky factorization of the symmetric matrix `H`,
/// returning `false` if it is not positive definite.
pub fn is_positive_definite(h_mat: &[Vec<f64>]) -> bool {
    let n = h_mat.len();
    let mut l = vec![vec![0.0; n]; n];
    for j in 0..n {
        let mut d = h_mat[j][j];
        for k in 0..j {
            d -= l[j][k] * l[j][k];
        }
        if !(d > 0.0) {
            return false;
        }
        l[j][j] = d.sqrt();
        for i in (j + 1)..n {
            let mut s = h_mat[i][j];
            for k in 0..j {
                s -= l[i][k] * l[j][k];
            }
            l[i][j] = s / l[j][j];
        }
    }
    true
}
