//! Rigid and affine transforms
//!
//! 4x4 affine matrices stored row-major as `[f64; 16]`, matching the
//! NIfTI affine convention used in `nifti_io`. Rigid motion parameters
//! are 6-vectors `(tx, ty, tz, rx, ry, rz)`: translation in scanner mm
//! followed by intrinsic X-then-Y-then-Z Euler rotation in radians.

pub type Affine = [f64; 16];

pub const IDENTITY: Affine = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// Rotation matrix for intrinsic X-then-Y-then-Z Euler angles
///
/// Equals Rx(a1) * Ry(a2) * Rz(a3).
pub fn rotation_xyz(a1: f64, a2: f64, a3: f64) -> [[f64; 3]; 3] {
    let (s1, c1) = a1.sin_cos();
    let (s2, c2) = a2.sin_cos();
    let (s3, c3) = a3.sin_cos();

    [
        [c2 * c3, -c2 * s3, s2],
        [c1 * s3 + c3 * s1 * s2, c1 * c3 - s1 * s2 * s3, -c2 * s1],
        [s1 * s3 - c1 * c3 * s2, c3 * s1 + c1 * s2 * s3, c1 * c2],
    ]
}

/// Rotate a 3-vector
pub fn rotate(r: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
        r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
        r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
    ]
}

/// Rigid scanner-space transform from a 6-parameter motion row
pub fn rigid_transform(p: &[f64]) -> Affine {
    debug_assert!(p.len() >= 6);
    let r = rotation_xyz(p[3], p[4], p[5]);
    [
        r[0][0], r[0][1], r[0][2], p[0],
        r[1][0], r[1][1], r[1][2], p[1],
        r[2][0], r[2][1], r[2][2], p[2],
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Affine product a * b
pub fn compose(a: &Affine, b: &Affine) -> Affine {
    let mut out = [0.0; 16];
    for i in 0..4 {
        for j in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += a[i * 4 + k] * b[k * 4 + j];
            }
            out[i * 4 + j] = sum;
        }
    }
    out
}

/// Invert an affine transform (3x3 block + translation)
///
/// The linear block is inverted through its adjugate; the bottom row is
/// assumed to be (0, 0, 0, 1).
pub fn invert(a: &Affine) -> Affine {
    let m = [
        [a[0], a[1], a[2]],
        [a[4], a[5], a[6]],
        [a[8], a[9], a[10]],
    ];
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    let inv_det = 1.0 / det;

    let inv = [
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ];

    let t = [a[3], a[7], a[11]];
    let ti = rotate(&inv, t);
    [
        inv[0][0], inv[0][1], inv[0][2], -ti[0],
        inv[1][0], inv[1][1], inv[1][2], -ti[1],
        inv[2][0], inv[2][1], inv[2][2], -ti[2],
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Apply an affine transform to a point
pub fn apply(a: &Affine, p: [f64; 3]) -> [f64; 3] {
    [
        a[0] * p[0] + a[1] * p[1] + a[2] * p[2] + a[3],
        a[4] * p[0] + a[5] * p[1] + a[6] * p[2] + a[7],
        a[8] * p[0] + a[9] * p[1] + a[10] * p[2] + a[11],
    ]
}

/// Voxel/scanner transform pair attached to an image grid
#[derive(Debug, Clone)]
pub struct GridTransform {
    pub voxel2scanner: Affine,
    pub scanner2voxel: Affine,
}

impl GridTransform {
    /// Build from the image affine (voxel-to-scanner)
    pub fn new(voxel2scanner: Affine) -> Self {
        let scanner2voxel = invert(&voxel2scanner);
        GridTransform { voxel2scanner, scanner2voxel }
    }
}
