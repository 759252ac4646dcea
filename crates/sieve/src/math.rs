//! Numerical primitives used by the survival model: Savitzky-Golay
//! smoothing and an ordinary least squares line fit.

/// Solve the square system `a * x = b` by Gaussian elimination with
/// partial pivoting. Returns `None` for a singular matrix.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        // Pivot on the largest remaining value in this column
        let mut pivot = col;
        for row in col + 1..n {
            if a[row][col].abs() > a[pivot][col].abs() {
                pivot = row;
            }
        }
        if a[pivot][col] == 0.0 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= a[col][k] * factor;
            }
            b[row] -= b[col] * factor;
        }
    }
    // Back substitution
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = b[row];
        for k in row + 1..n {
            acc -= a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
    }
    Some(x)
}

/// Least-squares convolution weights for a window of `2 * half + 1` points
/// fit with a polynomial of degree `order`, evaluated at offset `t` from the
/// window center. `t = 0` yields the classic smoothing weights.
fn savgol_weights(half: usize, order: usize, t: isize) -> Vec<f64> {
    let width = 2 * half + 1;
    let order = order.min(width - 1);

    // Normal equations N[a][b] = sum_j j^(a+b) over j in [-half, half]
    let mut normal = vec![vec![0.0; order + 1]; order + 1];
    for a in 0..=order {
        for b in 0..=order {
            let mut acc = 0.0;
            for j in -(half as isize)..=(half as isize) {
                acc += (j as f64).powi((a + b) as i32);
            }
            normal[a][b] = acc;
        }
    }

    // One solve per polynomial coefficient: N * c_a = e_a
    let mut inv_rows = Vec::with_capacity(order + 1);
    for a in 0..=order {
        let mut e = vec![0.0; order + 1];
        e[a] = 1.0;
        // The normal matrix of a Vandermonde system is nonsingular
        // whenever order < width, which the clamp above guarantees.
        inv_rows.push(solve(normal.clone(), e).unwrap_or_else(|| vec![0.0; order + 1]));
    }

    let mut weights = vec![0.0; width];
    for (w, j) in weights.iter_mut().zip(-(half as isize)..) {
        for a in 0..=order {
            let mut basis = 0.0;
            for b in 0..=order {
                basis += inv_rows[a][b] * (j as f64).powi(b as i32);
            }
            *w += (t as f64).powi(a as i32) * basis;
        }
    }
    weights
}

/// Savitzky-Golay smoothing of `y` with window half-width `half` and
/// polynomial degree `order`. Window edges are handled by anchoring the
/// window at the boundary and evaluating the fitted polynomial off-center,
/// so the output has the same length as the input.
pub fn savgol_smooth(y: &[f64], half: usize, order: usize) -> Vec<f64> {
    let n = y.len();
    let width = 2 * half + 1;
    if n < width || half == 0 {
        return y.to_vec();
    }

    let center = savgol_weights(half, order, 0);
    let mut out = vec![0.0; n];

    for i in half..n - half {
        let window = &y[i - half..=i + half];
        out[i] = window.iter().zip(&center).map(|(v, w)| v * w).sum();
    }
    for i in 0..half {
        let t = i as isize - half as isize;
        let w = savgol_weights(half, order, t);
        out[i] = y[..width].iter().zip(&w).map(|(v, w)| v * w).sum();
        let w = savgol_weights(half, order, -t);
        out[n - 1 - i] = y[n - width..].iter().zip(&w).map(|(v, w)| v * w).sum();
    }
    out
}

/// Closed-form ordinary least squares fit of `y = slope * x + intercept`.
///
/// A single observation fits a flat line through it.
pub fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len().min(y.len());
    if n == 1 {
        return (0.0, y[0]);
    }

    let xbar = x[..n].iter().sum::<f64>() / n as f64;
    let ybar = y[..n].iter().sum::<f64>() / n as f64;

    let mut top = 0.0;
    let mut bot = 0.0;
    for i in 0..n {
        top += (x[i] - xbar) * (y[i] - ybar);
        bot += (x[i] - xbar) * (x[i] - xbar);
    }
    let slope = top / bot;
    (slope, ybar - slope * xbar)
}

#[cfg(test)]
mod test {
    use super::*;

    fn all_close(lhs: &[f64], rhs: &[f64], eps: f64) -> bool {
        lhs.iter()
            .zip(rhs.iter())
            .all(|(l, r)| (l - r).abs() <= eps)
    }

    #[test]
    fn smoothing_preserves_polynomials() {
        // A cubic is reproduced exactly by any window of order >= 3
        let y = (0..20)
            .map(|x| {
                let x = x as f64;
                0.5 * x * x * x - 2.0 * x * x + x - 3.0
            })
            .collect::<Vec<_>>();
        let smoothed = savgol_smooth(&y, 3, 3);
        assert!(all_close(&y, &smoothed, 1e-6));
    }

    #[test]
    fn smoothing_reduces_noise() {
        // Alternating noise around a line should shrink toward the line
        let y = (0..30)
            .map(|x| x as f64 + if x % 2 == 0 { 0.5 } else { -0.5 })
            .collect::<Vec<_>>();
        let smoothed = savgol_smooth(&y, 3, 1);
        for i in 3..27 {
            assert!((smoothed[i] - i as f64).abs() < 0.2, "bin {}", i);
        }
    }

    #[test]
    fn short_input_is_left_alone() {
        let y = [1.0, 2.0, 3.0];
        assert_eq!(savgol_smooth(&y, 3, 2), y.to_vec());
    }

    #[test]
    fn line_fit_recovers_slope() {
        let x = (0..10).map(|v| v as f64).collect::<Vec<_>>();
        let y = x.iter().map(|v| 3.0 * v - 7.0).collect::<Vec<_>>();
        let (slope, intercept) = linear_fit(&x, &y);
        assert!((slope - 3.0).abs() < 1e-9);
        assert!((intercept + 7.0).abs() < 1e-9);
    }

    #[test]
    fn line_fit_single_point() {
        assert_eq!(linear_fit(&[5.0], &[2.5]), (0.0, 2.5));
    }
}
