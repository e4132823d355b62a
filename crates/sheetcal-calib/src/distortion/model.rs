//! Brown-Conrady lens model: radial `k1, k2, k3` and tangential `p1, p2`,
//! applied to normalized camera coordinates.

use nalgebra::{Matrix2, Matrix3, Point2, Vector2};
use serde::{Deserialize, Serialize};

const UNDISTORT_MAX_ITERS: usize = 50;
const UNDISTORT_TOL: f64 = 1e-14;

/// Pinhole intrinsics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraMatrix {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraMatrix {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Square pixels with focal length `f`.
    pub fn from_focal(f: f64, cx: f64, cy: f64) -> Self {
        Self::new(f, f, cx, cy)
    }

    #[inline]
    pub fn normalize(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    #[inline]
    pub fn denormalize(&self, n: Point2<f64>) -> Point2<f64> {
        Point2::new(n.x * self.fx + self.cx, n.y * self.fy + self.cy)
    }

    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    /// First radial coefficient (barrel < 0, pincushion > 0).
    pub k1: f64,
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    #[serde(default)]
    pub k3: f64,
}

impl DistortionCoefficients {
    pub fn radial(k1: f64, k2: f64) -> Self {
        Self {
            k1,
            k2,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.k3 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0
    }

    /// Forward model: ideal normalized point -> distorted normalized point.
    #[inline]
    pub fn distort(&self, n: Point2<f64>) -> Point2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        Point2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Inverse model via Newton iterations on the forward map.
    ///
    /// Returns `None` when the iteration leaves the region where the forward
    /// map is invertible (strong barrel distortion far off-axis).
    pub fn undistort(&self, d: Point2<f64>) -> Option<Point2<f64>> {
        if self.is_zero() {
            return Some(d);
        }
        let target = d.coords;
        let mut p = target;

        for _ in 0..UNDISTORT_MAX_ITERS {
            let (x, y) = (p.x, p.y);
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
            let err = self.distort(Point2::from(p)).coords - target;
            if err.norm() < UNDISTORT_TOL {
                break;
            }

            // d(radial)/dx = 2x * dr, with dr = k1 + 2 k2 r2 + 3 k3 r4
            let dr = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r4;
            let j = Matrix2::new(
                radial + 2.0 * x * x * dr + 2.0 * self.p1 * y + 6.0 * self.p2 * x,
                2.0 * x * y * dr + 2.0 * self.p1 * x + 2.0 * self.p2 * y,
                2.0 * x * y * dr + 2.0 * self.p1 * x + 2.0 * self.p2 * y,
                radial + 2.0 * y * y * dr + 6.0 * self.p1 * y + 2.0 * self.p2 * x,
            );
            let step: Vector2<f64> = j.try_inverse()? * err;
            p -= step;
            if !p.x.is_finite() || !p.y.is_finite() {
                return None;
            }
        }

        let back = self.distort(Point2::from(p)).coords - target;
        (back.norm() < 1e-9).then_some(Point2::from(p))
    }
}

/// Lens model of one camera: raw intrinsics, distortion, and the intrinsics
/// of the undistorted output frame (same size as the source frame).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistortionModel {
    pub camera: CameraMatrix,
    pub coefficients: DistortionCoefficients,
    pub optimal: CameraMatrix,
    pub image_width: usize,
    pub image_height: usize,
}

impl DistortionModel {
    /// Model with no distortion; undistorted and raw pixels coincide.
    pub fn identity(image_width: usize, image_height: usize, focal: f64) -> Self {
        let camera =
            CameraMatrix::from_focal(focal, image_width as f64 / 2.0, image_height as f64 / 2.0);
        Self {
            camera,
            coefficients: DistortionCoefficients::default(),
            optimal: camera,
            image_width,
            image_height,
        }
    }

    /// Build a model and derive its output intrinsics with the given `alpha`
    /// (0 keeps only valid pixels, 1 keeps every source pixel).
    pub fn with_optimal(
        camera: CameraMatrix,
        coefficients: DistortionCoefficients,
        image_width: usize,
        image_height: usize,
        alpha: f64,
    ) -> Self {
        let optimal =
            optimal_camera_matrix(&camera, &coefficients, image_width, image_height, alpha);
        Self {
            camera,
            coefficients,
            optimal,
            image_width,
            image_height,
        }
    }

    /// Raw pixel -> undistorted pixel in the output (`optimal`) frame.
    pub fn undistort_pixel(&self, raw: Point2<f64>) -> Option<Point2<f64>> {
        let n = self.coefficients.undistort(self.camera.normalize(raw))?;
        Some(self.optimal.denormalize(n))
    }

    /// Undistorted output pixel -> raw pixel.
    pub fn distort_pixel(&self, undistorted: Point2<f64>) -> Point2<f64> {
        let n = self.coefficients.distort(self.optimal.normalize(undistorted));
        self.camera.denormalize(n)
    }
}

/// Intrinsics for the undistorted frame, blending the rectangle of valid
/// pixels (`alpha = 0`) and the rectangle containing all source pixels
/// (`alpha = 1`). Zero distortion returns `camera` unchanged.
pub fn optimal_camera_matrix(
    camera: &CameraMatrix,
    coefficients: &DistortionCoefficients,
    width: usize,
    height: usize,
    alpha: f64,
) -> CameraMatrix {
    const N: usize = 9;
    if coefficients.is_zero() || width < 2 || height < 2 {
        return *camera;
    }

    let (w, h) = ((width - 1) as f64, (height - 1) as f64);
    let mut grid = [[Point2::origin(); N]; N];
    for (j, row) in grid.iter_mut().enumerate() {
        for (i, cell) in row.iter_mut().enumerate() {
            let raw = Point2::new(w * i as f64 / (N - 1) as f64, h * j as f64 / (N - 1) as f64);
            let n = camera.normalize(raw);
            *cell = coefficients.undistort(n).unwrap_or(n);
        }
    }

    // Outer: bounding box of everything. Inner: box bounded by the border rows/columns.
    let (mut ox0, mut oy0, mut ox1, mut oy1) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for p in grid.iter().flatten() {
        ox0 = ox0.min(p.x);
        oy0 = oy0.min(p.y);
        ox1 = ox1.max(p.x);
        oy1 = oy1.max(p.y);
    }
    let (mut ix0, mut iy0, mut ix1, mut iy1) = (f64::MIN, f64::MIN, f64::MAX, f64::MAX);
    for k in 0..N {
        ix0 = ix0.max(grid[k][0].x);
        ix1 = ix1.min(grid[k][N - 1].x);
        iy0 = iy0.max(grid[0][k].y);
        iy1 = iy1.min(grid[N - 1][k].y);
    }

    let fit = |x0: f64, y0: f64, x1: f64, y1: f64| {
        let fx = w / (x1 - x0);
        let fy = h / (y1 - y0);
        (fx, fy, -fx * x0, -fy * y0)
    };
    let inner = fit(ix0, iy0, ix1, iy1);
    let outer = fit(ox0, oy0, ox1, oy1);
    let a = alpha.clamp(0.0, 1.0);
    let lerp = |i: f64, o: f64| i * (1.0 - a) + o * a;

    let blended = CameraMatrix::new(
        lerp(inner.0, outer.0),
        lerp(inner.1, outer.1),
        lerp(inner.2, outer.2),
        lerp(inner.3, outer.3),
    );
    if [blended.fx, blended.fy, blended.cx, blended.cy]
        .iter()
        .all(|v| v.is_finite())
        && blended.fx > 0.0
        && blended.fy > 0.0
    {
        blended
    } else {
        *camera
    }
}
