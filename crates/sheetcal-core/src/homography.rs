use crate::{sample_bilinear_u8, Frame, FrameView};
use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Planar projective transform acting on homogeneous 2D points.
///
/// Serialized as a row-major `[[f64; 3]; 3]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[[f64; 3]; 3]", into = "[[f64; 3]; 3]")]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::from_row_slice(&[
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
            rows[2][1], rows[2][2],
        ]))
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.h[(0, 0)], self.h[(0, 1)], self.h[(0, 2)]],
            [self.h[(1, 0)], self.h[(1, 1)], self.h[(1, 2)]],
            [self.h[(2, 0)], self.h[(2, 1)], self.h[(2, 2)]],
        ]
    }

    /// Axis-aligned scale followed by a translation: `p -> (sx * x + tx, sy * y + ty)`.
    pub fn scale_translate(sx: f64, sy: f64, tx: f64, ty: f64) -> Self {
        Self::new(Matrix3::new(sx, 0.0, tx, 0.0, sy, ty, 0.0, 0.0, 1.0))
    }

    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        let w = v[2];
        Point2::new(v[0] / w, v[1] / w)
    }

    /// Like [`Homography::apply`] but returns `None` for points mapped to (or
    /// behind) the line at infinity.
    #[inline]
    pub fn try_apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        let w = v[2];
        if w.abs() < 1e-12 {
            return None;
        }
        Some(Point2::new(v[0] / w, v[1] / w))
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }
}

impl From<[[f64; 3]; 3]> for Homography {
    fn from(rows: [[f64; 3]; 3]) -> Self {
        Self::from_array(rows)
    }
}

impl From<Homography> for [[f64; 3]; 3] {
    fn from(h: Homography) -> Self {
        h.to_array()
    }
}

/// `a * b` maps a point through `b` first, then `a`.
impl Mul for Homography {
    type Output = Homography;

    fn mul(self, rhs: Homography) -> Homography {
        Homography::new(self.h * rhs.h)
    }
}

/// Hartley normalization: translate to the centroid and scale so the mean
/// distance from it is `sqrt(2)`. Returns the normalized points and `T`.
pub fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len().max(1) as f64;
    let centroid = pts
        .iter()
        .fold(Vector2::zeros(), |acc: Vector2<f64>, p| acc + p.coords)
        / n;
    let spread = pts.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    let s = if spread > 1e-12 {
        std::f64::consts::SQRT_2 / spread
    } else {
        1.0
    };

    let t = Matrix3::new(
        s, 0.0, -s * centroid.x, //
        0.0, s, -s * centroid.y, //
        0.0, 0.0, 1.0,
    );
    let out = pts
        .iter()
        .map(|p| Point2::from((p.coords - centroid) * s))
        .collect();
    (out, t)
}

/// The two DLT equations contributed by `src -> dst`, over the row-major
/// entries of H.
fn dlt_rows(src: Point2<f64>, dst: Point2<f64>) -> [[f64; 9]; 2] {
    let (x, y, u, v) = (src.x, src.y, dst.x, dst.y);
    [
        [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u],
        [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v],
    ]
}

/// Undo the normalizations, `H = T_dst^-1 * Hn * T_src`, and fix `H[2][2] = 1`.
fn denormalize(
    hn: Matrix3<f64>,
    t_src: &Matrix3<f64>,
    t_dst: &Matrix3<f64>,
) -> Option<Homography> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let scale = h[(2, 2)];
    (scale.abs() >= 1e-12).then(|| Homography::new(h / scale))
}

/// Estimate H such that `dst ~ H * src`.
///
/// Exactly four correspondences use [`homography_from_4pt`]; more use the
/// normalized DLT, which minimizes the algebraic error in least squares.
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }
    if let (Ok(s), Ok(d)) = (
        <&[Point2<f64>; 4]>::try_from(src),
        <&[Point2<f64>; 4]>::try_from(dst),
    ) {
        return homography_from_4pt(s, d);
    }

    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (k, (s, d)) in src_n.iter().zip(&dst_n).enumerate() {
        for (r, row) in dlt_rows(*s, *d).iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                a[(2 * k + r, c)] = *value;
            }
        }
    }

    // null vector of A: right singular vector of the smallest singular value
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|l, r| l.1.total_cmp(r.1))
        .map(|(i, _)| i)?;
    let hn = Matrix3::from_iterator(v_t.row(smallest).iter().copied()).transpose();

    denormalize(hn, &t_src, &t_dst)
}

/// Compute H such that `dst ~ H * src` from exactly four correspondences.
///
/// Solves the 8x8 system with `H[2][2] = 1` on normalized points. Corner
/// order must be consistent between `src` and `dst`.
pub fn homography_from_4pt(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Homography> {
    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (k, (s, d)) in src_n.iter().zip(&dst_n).enumerate() {
        for (r, row) in dlt_rows(*s, *d).iter().enumerate() {
            for (c, value) in row[..8].iter().enumerate() {
                a[(2 * k + r, c)] = *value;
            }
            b[2 * k + r] = -row[8];
        }
    }

    let x = a.lu().solve(&b)?;
    let mut entries = [1.0; 9];
    entries[..8].copy_from_slice(x.as_slice());
    denormalize(Matrix3::from_row_slice(&entries), &t_src, &t_dst)
}

/// Warp into an `out_w x out_h` frame: for each destination pixel, map to the
/// source via `h_src_from_dst` and sample bilinearly. Unmapped pixels are black.
pub fn warp_perspective(
    src: &FrameView<'_>,
    h_src_from_dst: &Homography,
    out_w: usize,
    out_h: usize,
) -> Frame {
    let mut out = Frame::filled(out_w, out_h, src.channels, 0);

    for y in 0..out_h {
        for x in 0..out_w {
            let Some(ps) = h_src_from_dst.try_apply(Point2::new(x as f64, y as f64)) else {
                continue;
            };
            let px = out.pixel_mut(x, y);
            for (c, v) in px.iter_mut().enumerate() {
                *v = sample_bilinear_u8(src, ps.x as f32, ps.y as f32, c);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A sheet seen from a tilted camera.
    fn tilted() -> Homography {
        Homography::from_array([
            [31.0, 1.5, 180.0],
            [-0.8, 27.0, 40.0],
            [0.0004, 0.0011, 1.0],
        ])
    }

    fn assert_maps_like(h: &Homography, truth: &Homography, points: &[Point2<f64>], eps: f64) {
        for &p in points {
            let (got, want) = (h.apply(p), truth.apply(p));
            assert_relative_eq!(got.x, want.x, epsilon = eps);
            assert_relative_eq!(got.y, want.y, epsilon = eps);
        }
    }

    #[test]
    fn inverse_undoes_apply() {
        let h = tilted();
        let back = h.inverse().expect("invertible");
        for p in [Point2::new(0.0, 0.0), Point2::new(7.25, 16.0), Point2::new(14.5, 37.0)] {
            let q = back.apply(h.apply(p));
            assert_relative_eq!(q.x, p.x, epsilon = 1e-9);
            assert_relative_eq!(q.y, p.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn sheet_corners_determine_the_mapping() {
        let truth = tilted();
        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(14.5, 0.0),
            Point2::new(14.5, 37.0),
            Point2::new(0.0, 37.0),
        ];
        let pixels = corners.map(|p| truth.apply(p));
        let h = homography_from_4pt(&corners, &pixels).expect("four corners");
        assert_maps_like(
            &h,
            &truth,
            &[Point2::new(7.25, 16.0), Point2::new(3.0, 30.0)],
            1e-6,
        );
    }

    #[test]
    fn least_squares_fit_over_a_grid() {
        let truth = tilted();
        let metric: Vec<Point2<f64>> = [0.0, 7.25, 14.5]
            .iter()
            .flat_map(|&x| [10.0, 16.0, 37.0].map(|y| Point2::new(x, y)))
            .collect();
        let pixels: Vec<Point2<f64>> = metric.iter().map(|&p| truth.apply(p)).collect();
        let h = estimate_homography(&metric, &pixels).expect("dlt");
        assert_maps_like(
            &h,
            &truth,
            &[Point2::new(2.0, 12.0), Point2::new(12.0, 30.0)],
            1e-6,
        );
        assert_relative_eq!(h.h[(2, 2)], 1.0);
    }

    #[test]
    fn too_few_or_unpaired_points_fail() {
        let three = [Point2::new(0.0, 0.0); 3];
        assert!(estimate_homography(&three, &three).is_none());
        let four = [Point2::new(1.0, 2.0); 4];
        assert!(estimate_homography(&four, &three).is_none());
    }

    #[test]
    fn json_form_is_row_major() {
        let h = Homography::scale_translate(2.0, 3.0, 5.0, 7.0);
        let json = serde_json::to_string(&h).expect("serialize");
        assert_eq!(json, "[[2.0,0.0,5.0],[0.0,3.0,7.0],[0.0,0.0,1.0]]");
        let back: Homography = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, h);
    }

    #[test]
    fn product_applies_right_operand_first() {
        let scale = Homography::scale_translate(2.0, 2.0, 0.0, 0.0);
        let shift = Homography::scale_translate(1.0, 1.0, 3.0, 4.0);
        let p = (scale * shift).apply(Point2::new(1.0, 1.0));
        assert_eq!((p.x, p.y), (8.0, 10.0));
    }

    #[test]
    fn points_on_the_horizon_do_not_map() {
        let h = Homography::new(Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0));
        assert!(h.try_apply(Point2::new(0.0, 5.0)).is_none());
        assert!(h.try_apply(Point2::new(2.0, 5.0)).is_some());
    }

    #[test]
    fn warp_with_translation_shifts_content() {
        let mut src = Frame::filled(8, 8, 1, 0);
        src.fill_rect(2, 2, 3, 3, 255);
        let shift = Homography::scale_translate(1.0, 1.0, 2.0, 2.0);
        let out = warp_perspective(&src.view(), &shift, 4, 4);
        assert_eq!(out.pixel(0, 0), &[255]);
        assert_eq!(out.pixel(1, 1), &[0]);
    }
}
