//! Shape preserving piecewise cubic Hermite interpolation (Fritsch–Carlson).

/// Monotone cubic interpolant through a set of knots. Between two knots the
/// curve never overshoots, so it is monotone wherever the data is.
#[derive(Debug, Clone)]
pub struct Pchip {
    xs:     Vec<f64>,
    ys:     Vec<f64>,
    slopes: Vec<f64>,
}

impl Pchip {
    /// Returns `None` unless there are at least two knots with strictly
    /// increasing `xs`.
    #[inline]
    pub fn new(xs: &[f64], ys: &[f64]) -> Option<Self> {
        let n = xs.len();
        if n < 2 || n != ys.len() || xs.windows(2).any(|w| !(w[1] > w[0])) {
            return None;
        }

        let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
        let delta: Vec<f64> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / h[i]).collect();

        let slopes = if n == 2 {
            vec![delta[0]; 2]
        } else {
            let mut d = vec![0.0; n];
            for i in 1..n - 1 {
                if delta[i - 1] * delta[i] > 0.0 {
                    let w1 = 2.0 * h[i] + h[i - 1];
                    let w2 = h[i] + 2.0 * h[i - 1];
                    d[i] = (w1 + w2) / (w1 / delta[i - 1] + w2 / delta[i]);
                }
            }
            d[0] = end_slope(h[0], h[1], delta[0], delta[1]);
            d[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
            d
        };

        Some(Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            slopes,
        })
    }

    /// Value at `x`, clamped to the knot range.
    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        let last = self.xs.len() - 1;
        let x = x.clamp(self.xs[0], self.xs[last]);
        let i = self.xs.partition_point(|&k| k <= x).clamp(1, last) - 1;

        let h = self.xs[i + 1] - self.xs[i];
        let t = (x - self.xs[i]) / h;
        let t2 = t * t;
        let t3 = t2 * t;

        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        h00 * self.ys[i]
            + h10 * h * self.slopes[i]
            + h01 * self.ys[i + 1]
            + h11 * h * self.slopes[i + 1]
    }

    #[inline]
    pub fn domain(&self) -> (f64, f64) {
        (self.xs[0], self.xs[self.xs.len() - 1])
    }
}

/// Three point end slope, limited so the end interval stays monotone.
fn end_slope(h0: f64, h1: f64, delta0: f64, delta1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * delta0 - h0 * delta1) / (h0 + h1);
    if d.signum() != delta0.signum() {
        0.0
    } else if delta0.signum() != delta1.signum() && d.abs() > 3.0 * delta0.abs() {
        3.0 * delta0
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_knots() {
        let xs = [80.0, 85.0, 91.0, 95.0, 97.0];
        let ys = [40.0, 34.0, 27.0, 20.0, 12.0];
        let pchip = Pchip::new(&xs, &ys).unwrap();
        for (x, y) in xs.iter().zip(ys) {
            assert!((pchip.eval(*x) - y).abs() < 1e-9);
        }
    }

    #[test]
    fn reproduces_a_line() {
        let pchip = Pchip::new(&[0.0, 1.0, 3.0, 4.0], &[1.0, 3.0, 7.0, 9.0]).unwrap();
        assert!((pchip.eval(2.0) - 5.0).abs() < 1e-9);
        assert!((pchip.eval(0.5) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn monotone_data_gives_monotone_curve() {
        // steep step in the middle, a plain cubic spline would overshoot here
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [0.0, 0.1, 0.2, 5.0, 5.1, 5.2];
        let pchip = Pchip::new(&xs, &ys).unwrap();

        let mut prev = pchip.eval(0.0);
        for i in 1..=500 {
            let y = pchip.eval(f64::from(i) / 100.0);
            assert!(y >= prev - 1e-12, "not monotone at {i}: {y} < {prev}");
            assert!((0.0..=5.2).contains(&y));
            prev = y;
        }
    }

    #[test]
    fn rejects_unsorted_knots() {
        assert!(Pchip::new(&[1.0, 1.0], &[2.0, 3.0]).is_none());
        assert!(Pchip::new(&[1.0], &[2.0]).is_none());
        assert!(Pchip::new(&[2.0, 1.0], &[2.0, 3.0]).is_none());
    }
}
