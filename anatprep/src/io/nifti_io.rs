//! NIfTI volume read/write.
//!
//! Volumes are loaded as `f32` in `[x, y, z]` order together with their
//! header, so outputs can be written with the spatial transform and
//! metadata of the image they were derived from. 4D inputs contribute their
//! first volume.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::volume::ndarray::IntoNdArray;
use nifti::writer::WriterOptions;
use nifti::{NiftiHeader, NiftiObject, ReaderOptions};
use tracing::debug;

/// A scalar volume plus the header it was read with.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub header: NiftiHeader,
}

impl Volume {
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Voxels strictly greater than zero.
    pub fn binarize(&self) -> Array3<bool> {
        binarize(&self.data)
    }
}

/// Read a `.nii` / `.nii.gz` file.
pub fn read_volume(path: &Path) -> Result<Volume> {
    debug!(path = %path.display(), "reading volume");
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|err| anyhow!("read NIfTI {}: {err}", path.display()))?;
    let header = obj.header().clone();
    let array: ArrayD<f32> = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|err| anyhow!("decode voxels of {}: {err}", path.display()))?;
    let data = to_3d(array).with_context(|| format!("volume shape of {}", path.display()))?;
    debug!(dim = ?data.dim(), "volume loaded");
    Ok(Volume { data, header })
}

/// Read a mask file as booleans (`> 0`).
pub fn read_mask(path: &Path) -> Result<Array3<bool>> {
    Ok(read_volume(path)?.binarize())
}

/// Write `data` with the spatial metadata of `reference`.
///
/// The file appears atomically: it is written next to `path` and renamed.
pub fn write_volume(path: &Path, data: &Array3<f32>, reference: &NiftiHeader) -> Result<()> {
    let header = output_header(reference);
    write_atomic(path, |tmp| {
        WriterOptions::new(tmp)
            .reference_header(&header)
            .write_nifti(data)
            .map_err(|err| anyhow!("{err}"))
    })
}

/// Write a binary mask as `uint8` with the spatial metadata of `reference`.
pub fn write_mask(path: &Path, mask: &Array3<bool>, reference: &NiftiHeader) -> Result<()> {
    let header = output_header(reference);
    let bytes: Array3<u8> = mask.mapv(u8::from);
    write_atomic(path, |tmp| {
        WriterOptions::new(tmp)
            .reference_header(&header)
            .write_nifti(&bytes)
            .map_err(|err| anyhow!("{err}"))
    })
}

/// Voxels strictly greater than zero.
pub fn binarize(data: &Array3<f32>) -> Array3<bool> {
    data.mapv(|v| v > 0.0)
}

/// Count of set voxels in a mask file.
pub fn count_mask_voxels(path: &Path) -> Result<usize> {
    Ok(read_mask(path)?.iter().filter(|&&v| v).count())
}

fn to_3d(array: ArrayD<f32>) -> Result<Array3<f32>> {
    match array.ndim() {
        3 => Ok(array.into_dimensionality::<Ix3>()?),
        4 => Ok(array
            .index_axis(Axis(3), 0)
            .to_owned()
            .into_dimensionality::<Ix3>()?),
        n => Err(anyhow!("expected a 3D or 4D volume, got {n}D")),
    }
}

/// Reference header with scaling reset: voxel values are written as-is.
fn output_header(reference: &NiftiHeader) -> NiftiHeader {
    let mut header = reference.clone();
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}

fn write_atomic(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("volume path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp = partial_path(path);
    debug!(path = %path.display(), "writing volume");
    if let Err(err) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("write NIfTI {}", path.display()));
    }
    fs::rename(&tmp, path).with_context(|| format!("replace volume {}", path.display()))?;
    Ok(())
}

/// `name.nii.gz` → `name.partial.nii.gz` (same compression, ignored by scans).
fn partial_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = match file_name.find('.') {
        Some(dot) => format!("{}.partial{}", &file_name[..dot], &file_name[dot..]),
        None => format!("{file_name}.partial"),
    };
    path.with_file_name(partial)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> NiftiHeader {
        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, 0.7, 0.7, 0.7, 1.0, 1.0, 1.0, 1.0];
        header.sform_code = 1;
        header.srow_x = [0.7, 0.0, 0.0, -10.0];
        header.srow_y = [0.0, 0.7, 0.0, -20.0];
        header.srow_z = [0.0, 0.0, 0.7, -30.0];
        header
    }

    #[test]
    fn volume_keeps_values_and_spatial_header() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("sub-01_ses-1_desc-denoised_T1w.nii.gz");
        let data = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| (i * 100 + j * 10 + k) as f32);

        write_volume(&path, &data, &header()).expect("write");
        let loaded = read_volume(&path).expect("read");

        assert_eq!(loaded.data, data);
        assert_eq!(loaded.header.srow_x, header().srow_x);
        assert_eq!(loaded.header.srow_z, header().srow_z);
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn mask_is_written_as_binary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mask.nii.gz");
        let mut mask = Array3::from_elem((4, 4, 4), false);
        mask[[1, 2, 3]] = true;
        mask[[0, 0, 0]] = true;

        write_mask(&path, &mask, &header()).expect("write");
        assert_eq!(read_mask(&path).expect("read"), mask);
        assert_eq!(count_mask_voxels(&path).expect("count"), 2);
    }

    #[test]
    fn scaled_reference_is_not_rescaled_on_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scaled.nii.gz");
        let mut reference = header();
        reference.scl_slope = 2.0;
        reference.scl_inter = 5.0;
        let data = Array3::from_elem((2, 2, 2), 7.0f32);

        write_volume(&path, &data, &reference).expect("write");
        assert_eq!(read_volume(&path).expect("read").data, data);
    }

    #[test]
    fn partial_path_keeps_double_extension() {
        assert_eq!(
            partial_path(Path::new("/d/sub-01_desc-x_mask.nii.gz")),
            PathBuf::from("/d/sub-01_desc-x_mask.partial.nii.gz")
        );
    }

    #[test]
    fn missing_file_is_an_error_with_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_volume(&temp.path().join("absent.nii.gz")).unwrap_err();
        assert!(format!("{err:#}").contains("absent.nii.gz"));
    }
}
