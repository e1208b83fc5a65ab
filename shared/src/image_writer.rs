//! Persisting exposures to disk.
//!
//! Writes an exposure's pixels and header keywords as FITS, multi-extension
//! FITS (one extension per amplifier) or raw little-endian 16-bit binary.

#[cfg(feature = "frame-writer")]
use fitsio::compat::fitsfile::FitsFile;
#[cfg(feature = "frame-writer")]
use fitsio::compat::images::{ImageDescription, ImageType, WriteImage};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::filename::FileType;
use crate::header::Header;
use crate::pixel_buffer::{PixelBuffer, PixelError};

/// Errors from writing image files.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FITS error: {0}")]
    Fits(String),

    #[error("Pixel error: {0}")]
    Pixel(#[from] PixelError),

    #[error("File type {0:?} not supported by this build")]
    Unsupported(FileType),
}

#[cfg(feature = "frame-writer")]
impl From<fitsio::compat::errors::Error> for ImageError {
    fn from(err: fitsio::compat::errors::Error) -> Self {
        ImageError::Fits(err.to_string())
    }
}

/// Result type for image writing.
pub type ImageResult<T> = Result<T, ImageError>;

/// Destination for completed exposures.
pub trait ImageWriter: Send {
    /// Write `image` with `header` to `path` in the given format.
    ///
    /// Binary output requires the frame to be assembled, so implementations
    /// may assemble the buffer in place.
    fn write(
        &mut self,
        image: &mut PixelBuffer,
        header: &Header,
        path: &Path,
        file_type: FileType,
    ) -> ImageResult<()>;
}

/// Writes image files to the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FileImageWriter;

impl FileImageWriter {
    pub fn new() -> Self {
        Self
    }
}

impl ImageWriter for FileImageWriter {
    fn write(
        &mut self,
        image: &mut PixelBuffer,
        header: &Header,
        path: &Path,
        file_type: FileType,
    ) -> ImageResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        debug!("Writing {:?} image to {}", file_type, path.display());
        match file_type {
            FileType::Binary => save_as_binary(image, path),
            FileType::Fits => save_as_fits(image, header, path),
            FileType::Mef => save_as_mef(image, header, path),
        }
    }
}

fn save_as_binary(image: &mut PixelBuffer, path: &Path) -> ImageResult<()> {
    let frame = image.assemble()?;
    let bytes: Vec<u8> = frame.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(feature = "frame-writer")]
fn save_as_fits(image: &mut PixelBuffer, header: &Header, path: &Path) -> ImageResult<()> {
    let frame = image.assemble()?;
    let (height, width) = frame.dim();
    let description = ImageDescription {
        data_type: ImageType::Long,
        dimensions: vec![width, height],
    };

    let mut fptr = FitsFile::create(path).overwrite().open()?;
    let hdu = fptr.create_image("PRIMARY", &description)?;
    let data: Vec<i32> = frame.iter().map(|&v| v as i32).collect();
    i32::write_image(&mut fptr, &hdu, &data)?;
    for keyword in header.iter() {
        hdu.write_key(&mut fptr, keyword.name.as_str(), &keyword.value.to_string())?;
    }
    Ok(())
}

#[cfg(feature = "frame-writer")]
fn save_as_mef(image: &mut PixelBuffer, header: &Header, path: &Path) -> ImageResult<()> {
    if !image.is_valid() {
        return Err(PixelError::NotValid.into());
    }
    let amp_size = image.geometry().amp_size();
    let description = ImageDescription {
        data_type: ImageType::Long,
        dimensions: vec![amp_size.width, amp_size.height],
    };

    let mut fptr = FitsFile::create(path).overwrite().open()?;
    for amp in 0..image.num_amps() {
        let samples = image.channel(amp).ok_or(PixelError::NotValid)?;
        let extname = format!("im{}", amp + 1);
        let hdu = fptr.create_image(&extname, &description)?;
        let data: Vec<i32> = samples.iter().map(|&v| v as i32).collect();
        i32::write_image(&mut fptr, &hdu, &data)?;
        hdu.write_key(&mut fptr, "EXTNAME", &extname)?;
        if amp == 0 {
            for keyword in header.iter() {
                hdu.write_key(&mut fptr, keyword.name.as_str(), &keyword.value.to_string())?;
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "frame-writer"))]
fn save_as_fits(_image: &mut PixelBuffer, _header: &Header, _path: &Path) -> ImageResult<()> {
    Err(ImageError::Unsupported(FileType::Fits))
}

#[cfg(not(feature = "frame-writer"))]
fn save_as_mef(_image: &mut PixelBuffer, _header: &Header, _path: &Path) -> ImageResult<()> {
    Err(ImageError::Unsupported(FileType::Mef))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DetectorFormat, Geometry};
    use tempfile::TempDir;

    fn ramp_image(width: i64, height: i64) -> PixelBuffer {
        let format = DetectorFormat::from_values([width, 0, 0, 0, height, 0, 0, 0, 0]).unwrap();
        let mut image = PixelBuffer::new(&Geometry::new(format));
        image.fill_ramp();
        image
    }

    #[test]
    fn test_binary_write_is_raw_frame() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/frame.bin");
        let mut image = ramp_image(4, 2);

        FileImageWriter::new()
            .write(&mut image, &Header::new(), &path, FileType::Binary)
            .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(u16::from_le_bytes([bytes[14], bytes[15]]), 7);
    }

    #[test]
    fn test_write_refuses_invalid_data() {
        let temp_dir = TempDir::new().unwrap();
        let format = DetectorFormat::from_values([4, 0, 0, 0, 2, 0, 0, 0, 0]).unwrap();
        let mut image = PixelBuffer::new(&Geometry::new(format));

        let result = FileImageWriter::new().write(
            &mut image,
            &Header::new(),
            &temp_dir.path().join("frame.bin"),
            FileType::Binary,
        );
        assert!(matches!(result, Err(ImageError::Pixel(PixelError::NotValid))));
    }

    #[cfg(feature = "frame-writer")]
    #[test]
    fn test_fits_write_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("frame.fits");
        let mut image = ramp_image(16, 8);
        let mut header = Header::new();
        header.set("OBJECT", "test", "");

        FileImageWriter::new()
            .write(&mut image, &header, &path, FileType::Fits)
            .unwrap();
        assert!(path.exists());
    }
}
