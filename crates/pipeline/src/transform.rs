//! Similarity transforms (uniform scale, rotation, translation).
//!
//! Parameterised as
//!
//! ```text
//! x' = a*x - b*y + tx
//! y' = b*x + a*y + ty
//! ```
//!
//! so `scale = hypot(a, b)` and `rotation = atan2(b, a)`.

use serde::{Deserialize, Serialize};

/// A 2D point in pixel coordinates.
pub type Point = (f64, f64);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for Similarity {
    fn default() -> Self {
        Self::identity()
    }
}

impl Similarity {
    pub fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn from_params(scale: f64, rotation_degrees: f64, tx: f64, ty: f64) -> Self {
        let theta = rotation_degrees.to_radians();
        Self {
            a: scale * theta.cos(),
            b: scale * theta.sin(),
            tx,
            ty,
        }
    }

    /// Read back a matrix produced by [`Similarity::to_matrix`].
    pub fn from_matrix(m: &[[f64; 3]; 3]) -> Self {
        Self {
            a: m[0][0],
            b: m[1][0],
            tx: m[0][2],
            ty: m[1][2],
        }
    }

    pub fn to_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.a, -self.b, self.tx],
            [self.b, self.a, self.ty],
            [0.0, 0.0, 1.0],
        ]
    }

    pub fn scale(&self) -> f64 {
        self.a.hypot(self.b)
    }

    pub fn rotation_degrees(&self) -> f64 {
        self.b.atan2(self.a).to_degrees()
    }

    pub fn is_finite(&self) -> bool {
        self.a.is_finite() && self.b.is_finite() && self.tx.is_finite() && self.ty.is_finite()
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> Point {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// `self ∘ inner`: apply `inner` first, then `self`.
    pub fn compose(&self, inner: &Similarity) -> Similarity {
        Similarity {
            a: self.a * inner.a - self.b * inner.b,
            b: self.b * inner.a + self.a * inner.b,
            tx: self.a * inner.tx - self.b * inner.ty + self.tx,
            ty: self.b * inner.tx + self.a * inner.ty + self.ty,
        }
    }

    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if !(det > f64::EPSILON) || !det.is_finite() {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    /// Distance between `apply(p)` and `q`.
    #[inline]
    pub fn reprojection_error(&self, p: Point, q: Point) -> f64 {
        let (x, y) = self.apply(p.0, p.1);
        (x - q.0).hypot(y - q.1)
    }
}

/// Closed-form least-squares similarity mapping `src[i]` onto `dst[i]`.
///
/// Returns `None` for fewer than two pairs or when the source points are
/// coincident.
pub fn fit_similarity(src: &[Point], dst: &[Point]) -> Option<Similarity> {
    let n = src.len().min(dst.len());
    if n < 2 {
        return None;
    }
    let (msx, msy) = centroid(&src[..n]);
    let (mdx, mdy) = centroid(&dst[..n]);

    let mut denom = 0.0;
    let mut num_a = 0.0;
    let mut num_b = 0.0;
    for (p, q) in src[..n].iter().zip(&dst[..n]) {
        let (px, py) = (p.0 - msx, p.1 - msy);
        let (qx, qy) = (q.0 - mdx, q.1 - mdy);
        denom += px * px + py * py;
        num_a += px * qx + py * qy;
        num_b += px * qy - py * qx;
    }
    if denom < 1e-9 {
        return None;
    }
    let a = num_a / denom;
    let b = num_b / denom;
    let t = Similarity {
        a,
        b,
        tx: mdx - (a * msx - b * msy),
        ty: mdy - (b * msx + a * msy),
    };
    t.is_finite().then_some(t)
}

pub(crate) fn centroid(points: &[Point]) -> Point {
    let n = points.len().max(1) as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.0, sy + p.1));
    (sx / n, sy / n)
}

/// Root-mean-square reprojection error over the given index set.
pub fn rms_error(t: &Similarity, src: &[Point], dst: &[Point], indices: &[usize]) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let sum: f64 = indices
        .iter()
        .map(|&i| t.reprojection_error(src[i], dst[i]).powi(2))
        .sum();
    (sum / indices.len() as f64).sqrt()
}
