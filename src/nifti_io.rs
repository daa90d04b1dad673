//! NIfTI file I/O
//!
//! Reads .nii / .nii.gz images up to 5-D and writes float32 NIfTI-1
//! files with a hand-assembled 348-byte header. Data is kept in
//! Fortran raster order (x fastest, then y, z, volume, coefficient),
//! matching the index convention of the reconstruction grids.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::{Array, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{SvrError, SvrResult};

/// NIfTI image with up to five dimensions
#[derive(Debug, Clone)]
pub struct NiftiImage {
    /// Values in Fortran raster order
    pub data: Vec<f64>,
    /// Dimensions, between 3 and 5 entries
    pub dims: Vec<usize>,
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Voxel-to-scanner affine (4x4, row-major)
    pub affine: [f64; 16],
}

impl NiftiImage {
    pub fn new(data: Vec<f64>, dims: Vec<usize>, voxel_size: (f64, f64, f64), affine: [f64; 16]) -> Self {
        debug_assert_eq!(data.len(), dims.iter().product::<usize>());
        NiftiImage { data, dims, voxel_size, affine }
    }

    /// Size of axis i, or `default` beyond the stored dimensions
    pub fn dim_or(&self, i: usize, default: usize) -> usize {
        self.dims.get(i).copied().unwrap_or(default)
    }

    pub fn spatial_dims(&self) -> [usize; 3] {
        [self.dims[0], self.dims[1], self.dims[2]]
    }

    pub fn nvoxels(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Load a NIfTI image from bytes
///
/// Supports .nii and .nii.gz (gzip is auto-detected); images of 3 to 5
/// dimensions are accepted.
pub fn load_nifti(bytes: &[u8]) -> SvrResult<NiftiImage> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder)
            .map_err(|e| SvrError::Io(format!("failed to read gzipped NIfTI: {}", e)))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| SvrError::Io(format!("failed to read NIfTI: {}", e)))?
    };

    let header = obj.header();
    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let affine = get_affine(header);

    let volume = obj.into_volume();
    let array: Array<f64, _> = volume
        .into_ndarray()
        .map_err(|e| SvrError::Io(format!("failed to convert NIfTI volume: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 || shape.len() > 5 {
        return Err(SvrError::InvalidArgument(format!(
            "expected a 3-D to 5-D image, got {}-D", shape.len()
        )));
    }

    // Flatten to Fortran raster order, x varying fastest
    let ndim = shape.len();
    let mut padded = [1usize; 5];
    padded[..ndim].copy_from_slice(&shape);
    let mut data = Vec::with_capacity(shape.iter().product());
    let mut idx = vec![0usize; ndim];
    for c in 0..padded[4] {
        for v in 0..padded[3] {
            for k in 0..padded[2] {
                for j in 0..padded[1] {
                    for i in 0..padded[0] {
                        idx[0] = i;
                        idx[1] = j;
                        idx[2] = k;
                        if ndim > 3 {
                            idx[3] = v;
                        }
                        if ndim > 4 {
                            idx[4] = c;
                        }
                        data.push(array[IxDyn(&idx)]);
                    }
                }
            }
        }
    }

    Ok(NiftiImage { data, dims: shape, voxel_size, affine })
}

/// Get the voxel-to-scanner affine from a header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Serialise an image as uncompressed NIfTI-1 bytes (float32 data)
pub fn save_nifti(img: &NiftiImage) -> SvrResult<Vec<u8>> {
    use std::io::Write;

    let ndim = img.dims.len();
    if !(3..=5).contains(&ndim) {
        return Err(SvrError::InvalidArgument(format!(
            "can only write 3-D to 5-D images, got {}-D", ndim
        )));
    }
    if img.data.len() != img.nvoxels() {
        return Err(SvrError::InvalidArgument(format!(
            "image data has {} values but dimensions {:?} require {}",
            img.data.len(), img.dims, img.nvoxels()
        )));
    }

    // NIfTI-1 header (348 bytes)
    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let mut dim = [1i16; 8];
    dim[0] = ndim as i16;
    for (i, &d) in img.dims.iter().enumerate() {
        dim[i + 1] = d as i16;
    }
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let (vsx, vsy, vsz) = img.voxel_size;
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 byte extension flag)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for i in 0..4 {
        let offset = 280 + i * 4;
        header[offset..offset + 4].copy_from_slice(&(img.affine[i] as f32).to_le_bytes());
    }
    for i in 0..4 {
        let offset = 296 + i * 4;
        header[offset..offset + 4].copy_from_slice(&(img.affine[4 + i] as f32).to_le_bytes());
    }
    for i in 0..4 {
        let offset = 312 + i * 4;
        header[offset..offset + 4].copy_from_slice(&(img.affine[8 + i] as f32).to_le_bytes());
    }

    // magic = "n+1\0" for single-file NIfTI-1
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + img.data.len() * 4);
    buffer.write_all(&header).map_err(|e| SvrError::Io(format!("write header failed: {}", e)))?;
    // extension flag (none)
    buffer.write_all(&[0u8; 4]).map_err(|e| SvrError::Io(format!("write extension failed: {}", e)))?;
    for &val in &img.data {
        buffer
            .write_all(&(val as f32).to_le_bytes())
            .map_err(|e| SvrError::Io(format!("write data failed: {}", e)))?;
    }

    Ok(buffer)
}

/// Serialise an image as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(img: &NiftiImage) -> SvrResult<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_nifti(img)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| SvrError::Io(format!("gzip compression failed: {}", e)))?;
    encoder.finish().map_err(|e| SvrError::Io(format!("gzip finish failed: {}", e)))
}

/// Read a NIfTI image from a filesystem path
pub fn read_nifti_file(path: &Path) -> SvrResult<NiftiImage> {
    let bytes = std::fs::read(path)
        .map_err(|e| SvrError::Io(format!("failed to read '{}': {}", path.display(), e)))?;
    load_nifti(&bytes)
}

/// Save an image to a file, gzip-compressed when the path ends .nii.gz
pub fn save_nifti_to_file(path: &Path, img: &NiftiImage) -> SvrResult<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(img)?
    } else {
        save_nifti(img)?
    };
    std::fs::write(path, &bytes)
        .map_err(|e| SvrError::Io(format!("failed to write '{}': {}", path.display(), e)))
}
