//! Pixel storage for a single exposure.
//!
//! Holds the raw per-amplifier sample streams delivered by the controller and
//! the assembled full frame built from them. The buffer is reallocated when the
//! readout geometry changes and reused otherwise.
//!
//! Validity is tracked with an atomic flag so that a transfer running on
//! another thread can publish completion; nothing may read, transmit or
//! persist pixels while the flag is clear.

use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::geometry::{Geometry, ImageSize};

/// Counter ceiling used by the demo ramp pattern.
///
/// The counter wraps at 65,355 rather than 65,536; kept as-is so simulated
/// frames match those produced by existing tooling.
pub const DEMO_RAMP_MODULUS: usize = 65_355;

/// Errors from pixel buffer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PixelError {
    /// Incoming transfer does not match the allocated buffer.
    #[error("Pixel data size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Pixel data requested before the transfer completed.
    #[error("Pixel data is not valid")]
    NotValid,
}

/// Result type for pixel buffer operations.
pub type PixelResult<T> = Result<T, PixelError>;

/// Raw and assembled pixel data for one exposure.
#[derive(Debug)]
pub struct PixelBuffer {
    geometry: Geometry,
    /// One sample stream per amplifier, in readout order
    channels: Vec<Vec<u16>>,
    /// Full frame, present once assembled
    assembled: Option<Array2<u16>>,
    valid: Arc<AtomicBool>,
    written: bool,
    /// Set once image data and file are ready for consumers
    toggle: bool,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer for the given geometry.
    pub fn new(geometry: &Geometry) -> Self {
        let per_amp = geometry.num_pix_amp();
        let channels = (0..geometry.num_amps()).map(|_| vec![0u16; per_amp]).collect();
        Self {
            geometry: geometry.clone(),
            channels,
            assembled: None,
            valid: Arc::new(AtomicBool::new(false)),
            written: false,
            toggle: false,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// True when the buffer was allocated for exactly this geometry.
    pub fn matches(&self, geometry: &Geometry) -> bool {
        &self.geometry == geometry
    }

    /// Dimensions of the assembled frame.
    pub fn size(&self) -> ImageSize {
        self.geometry.image_size()
    }

    pub fn num_amps(&self) -> usize {
        self.channels.len()
    }

    /// Number of bytes a full readout transfers (16-bit samples).
    pub fn transfer_bytes(&self) -> usize {
        self.geometry.num_pix_image() * 2
    }

    /// Clear all per-cycle state ahead of a new exposure.
    pub fn reset_flags(&mut self) {
        self.valid.store(false, Ordering::Release);
        self.written = false;
        self.toggle = false;
        self.assembled = None;
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Shared handle to the validity flag for an asynchronous receiver.
    pub fn validity_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.valid)
    }

    /// Poll the validity flag up to `polls` times, sleeping `interval` between.
    ///
    /// Returns whether the data became valid within the window.
    pub fn wait_until_valid(&self, polls: u32, interval: Duration) -> bool {
        for _ in 0..polls {
            if self.is_valid() {
                return true;
            }
            std::thread::sleep(interval);
        }
        self.is_valid()
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn mark_written(&mut self) {
        self.written = true;
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled.is_some()
    }

    pub fn toggle(&self) -> bool {
        self.toggle
    }

    pub fn set_toggle(&mut self, toggle: bool) {
        self.toggle = toggle;
    }

    /// Samples received through one amplifier.
    pub fn channel(&self, amp: usize) -> Option<&[u16]> {
        self.channels.get(amp).map(|c| c.as_slice())
    }

    /// The assembled frame, if [`assemble`](Self::assemble) has run.
    pub fn assembled(&self) -> Option<&Array2<u16>> {
        self.assembled.as_ref()
    }

    /// Load a little-endian 16-bit transfer, de-interleaving amplifiers.
    ///
    /// Sample `i` of the stream belongs to amplifier `i % num_amps`. The
    /// buffer becomes valid once the whole transfer is stored.
    pub fn load_interleaved(&mut self, bytes: &[u8]) -> PixelResult<()> {
        let expected = self.transfer_bytes();
        if bytes.len() != expected {
            return Err(PixelError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let num_amps = self.channels.len();
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let value = u16::from_le_bytes([pair[0], pair[1]]);
            self.channels[i % num_amps][i / num_amps] = value;
        }
        self.assembled = None;
        self.mark_valid();
        Ok(())
    }

    /// Fill the frame with the deterministic demo ramp and mark it valid.
    ///
    /// Pixel (0, 0) is zero and values rise by one per pixel in row-major
    /// order, wrapping at [`DEMO_RAMP_MODULUS`].
    pub fn fill_ramp(&mut self) {
        let size = self.size();
        let frame = Array2::from_shape_fn((size.height, size.width), |(row, col)| {
            ((row * size.width + col) % DEMO_RAMP_MODULUS) as u16
        });
        for amp in 0..self.channels.len() {
            for k in 0..self.channels[amp].len() {
                let (row, col) = self.frame_position(amp, k);
                self.channels[amp][k] = frame[[row, col]];
            }
        }
        self.assembled = Some(frame);
        self.mark_valid();
    }

    /// Assemble the amplifier streams into a full frame.
    pub fn assemble(&mut self) -> PixelResult<&Array2<u16>> {
        if !self.is_valid() {
            return Err(PixelError::NotValid);
        }
        if self.assembled.is_none() {
            let size = self.size();
            let mut frame = Array2::<u16>::zeros((size.height, size.width));
            for (amp, samples) in self.channels.iter().enumerate() {
                for (k, value) in samples.iter().enumerate() {
                    let (row, col) = self.frame_position(amp, k);
                    frame[[row, col]] = *value;
                }
            }
            self.assembled = Some(frame);
        }
        self.assembled.as_ref().ok_or(PixelError::NotValid)
    }

    /// Little-endian bytes of the image as sent to raw-pixel consumers.
    ///
    /// A single amplifier is sent as read; multiple amplifiers are assembled
    /// first.
    pub fn frame_bytes(&mut self) -> PixelResult<Vec<u8>> {
        if !self.is_valid() {
            return Err(PixelError::NotValid);
        }
        if self.channels.len() == 1 && self.assembled.is_none() {
            return Ok(self.channels[0].iter().flat_map(|v| v.to_le_bytes()).collect());
        }
        let frame = self.assemble()?;
        Ok(frame.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Row/column in the assembled frame of sample `k` from amplifier `amp`.
    fn frame_position(&self, amp: usize, k: usize) -> (usize, usize) {
        let amp_size = self.geometry.amp_size();
        let amps_x = self.geometry.focal_plane.total_amps_x();
        let flip = self.geometry.focal_plane.amp_flip(amp);

        let mut row = k / amp_size.width;
        let mut col = k % amp_size.width;
        if flip.flip_x {
            col = amp_size.width - 1 - col;
        }
        if flip.flip_y {
            row = amp_size.height - 1 - row;
        }
        let origin_row = (amp / amps_x) * amp_size.height;
        let origin_col = (amp % amps_x) * amp_size.width;
        (origin_row + row, origin_col + col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DetectorFormat, FocalPlane};

    fn small_geometry(width: usize, height: usize) -> Geometry {
        let format =
            DetectorFormat::from_values([width as i64, 0, 0, 0, height as i64, 0, 0, 0, 0])
                .unwrap();
        Geometry::new(format)
    }

    #[test]
    fn test_new_buffer_is_invalid() {
        let buffer = PixelBuffer::new(&small_geometry(8, 4));
        assert!(!buffer.is_valid());
        assert!(!buffer.is_written());
        assert!(!buffer.is_assembled());
        assert_eq!(buffer.transfer_bytes(), 64);
    }

    #[test]
    fn test_ramp_pattern_wraps_at_modulus() {
        let mut buffer = PixelBuffer::new(&small_geometry(300, 300));
        buffer.fill_ramp();
        assert!(buffer.is_valid());

        let frame = buffer.assembled().unwrap();
        assert_eq!(frame[[0, 0]], 0);
        assert_eq!(frame[[0, 1]], 1);
        assert_eq!(frame[[1, 0]], 300);

        // Pixel index 65354 is the last before wrap
        let last = DEMO_RAMP_MODULUS - 1;
        assert_eq!(frame[[last / 300, last % 300]], 65354);
        let wrapped = DEMO_RAMP_MODULUS;
        assert_eq!(frame[[wrapped / 300, wrapped % 300]], 0);
    }

    #[test]
    fn test_load_interleaved_single_amp() {
        let mut buffer = PixelBuffer::new(&small_geometry(2, 2));
        let bytes: Vec<u8> = [1u16, 2, 3, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        buffer.load_interleaved(&bytes).unwrap();

        assert!(buffer.is_valid());
        assert_eq!(buffer.channel(0).unwrap(), &[1, 2, 3, 4]);
        let frame = buffer.assemble().unwrap();
        assert_eq!(frame[[1, 0]], 3);
    }

    #[test]
    fn test_load_rejects_short_transfer() {
        let mut buffer = PixelBuffer::new(&small_geometry(2, 2));
        let err = buffer.load_interleaved(&[0u8; 6]).unwrap_err();
        assert_eq!(
            err,
            PixelError::SizeMismatch {
                expected: 8,
                actual: 6
            }
        );
        assert!(!buffer.is_valid());
    }

    #[test]
    fn test_two_amp_assembly_with_flip() {
        let mut geometry = small_geometry(4, 1);
        geometry.focal_plane = FocalPlane::new(1, 1, 2, 1, "01").unwrap();
        let mut buffer = PixelBuffer::new(&geometry);

        // Interleaved stream: amp0 gets 10, 11; amp1 gets 20, 21
        let bytes: Vec<u8> = [10u16, 20, 11, 21]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        buffer.load_interleaved(&bytes).unwrap();

        let frame = buffer.assemble().unwrap();
        // amp1 is flipped in x so its first sample lands at the far right
        assert_eq!(frame.row(0).to_vec(), vec![10, 11, 21, 20]);
    }

    #[test]
    fn test_assemble_requires_valid_data() {
        let mut buffer = PixelBuffer::new(&small_geometry(2, 2));
        assert_eq!(buffer.assemble().unwrap_err(), PixelError::NotValid);
        assert_eq!(buffer.frame_bytes().unwrap_err(), PixelError::NotValid);
    }

    #[test]
    fn test_reset_flags_clears_cycle_state() {
        let mut buffer = PixelBuffer::new(&small_geometry(2, 2));
        buffer.fill_ramp();
        buffer.mark_written();
        buffer.set_toggle(true);

        buffer.reset_flags();
        assert!(!buffer.is_valid());
        assert!(!buffer.is_written());
        assert!(!buffer.toggle());
        assert!(!buffer.is_assembled());
    }

    #[test]
    fn test_wait_until_valid_sees_other_thread() {
        let buffer = PixelBuffer::new(&small_geometry(2, 2));
        let flag = buffer.validity_flag();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Release);
        });
        assert!(buffer.wait_until_valid(100, Duration::from_millis(5)));
        handle.join().unwrap();
    }
}
