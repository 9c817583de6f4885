//! Trapezoid-rule integration over (possibly non-uniform) axes.

/// Quadrature weights `w` such that `Σ w[i] f(x[i])` is the trapezoid
/// integral of `f` over `x`.
pub fn trapezoid_weights(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut w = vec![0.0; n];
    for i in 1..n {
        let half = 0.5 * (x[i] - x[i - 1]);
        w[i - 1] += half;
        w[i] += half;
    }
    w
}

/// Trapezoid integral of `y` over `x`.
pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}

/// Running trapezoid integral; the first entry is zero.
pub fn cumulative_trapezoid(x: &[f64], y: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(x.len());
    let mut total = 0.0;
    if !x.is_empty() {
        out.push(0.0);
    }
    for i in 1..x.len() {
        total += 0.5 * (x[i] - x[i - 1]) * (y[i] + y[i - 1]);
        out.push(total);
    }
    out
}

/// The step of `x` if it is evenly spaced (relative tolerance 1e-9).
pub fn uniform_step(x: &[f64]) -> Option<f64> {
    if x.len() < 2 {
        return None;
    }
    let step = x[1] - x[0];
    let uniform = x
        .windows(2)
        .all(|w| ((w[1] - w[0]) - step).abs() <= 1e-9 * step.abs().max(1.0));
    uniform.then_some(step)
}

/// Position on `x` where the non-decreasing `cumulative` first reaches `p`.
///
/// Linearly interpolates between the two samples bracketing `p` instead of
/// snapping to the nearest sample. Returns `None` if `p` is never reached.
pub fn crossing(x: &[f64], cumulative: &[f64], p: f64) -> Option<f64> {
    let k = cumulative.iter().position(|c| *c >= p)?;
    if k == 0 {
        return Some(x[0]);
    }
    let (c0, c1) = (cumulative[k - 1], cumulative[k]);
    if c1 == c0 {
        return Some(x[k]);
    }
    Some(x[k - 1] + (p - c0) / (c1 - c0) * (x[k] - x[k - 1]))
}
