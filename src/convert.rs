//! I420 to packed 32-bit pixel conversion.
//!
//! Output pixels are four bytes in memory order B, G, R, A with alpha fixed at
//! 255 (the little-endian `0xAARRGGBB` layout). Colors use the BT.601
//! limited-range matrix in 8.8 fixed point.

use crate::codec::{Plane, RawFrame};
use crate::{ReplayError, Result};

/// Bytes per output pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Size of a tightly packed output image, or `None` on overflow.
pub fn packed_len(width: u32, height: u32) -> Option<usize> {
    (width as usize).checked_mul(height as usize)?.checked_mul(BYTES_PER_PIXEL)
}

fn check_plane(name: &str, plane: &Plane<'_>, width: usize, height: usize) -> Result<()> {
    if plane.stride < width {
        return Err(ReplayError::frame_geometry(format!(
            "{} plane stride {} is smaller than its width {}",
            name, plane.stride, width
        )));
    }
    let required = plane.stride * (height - 1) + width;
    if plane.data.len() < required {
        return Err(ReplayError::frame_geometry(format!(
            "{} plane holds {} bytes, {} required",
            name,
            plane.data.len(),
            required
        )));
    }
    Ok(())
}

/// Validate plane and destination sizes for a conversion of `frame` into a
/// buffer of `dst_len` bytes with rows `dst_stride` bytes apart.
pub fn check_geometry(frame: &RawFrame<'_>, dst_len: usize, dst_stride: usize) -> Result<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ReplayError::frame_geometry(format!(
            "empty frame {}x{}",
            frame.width, frame.height
        )));
    }

    let width = frame.width as usize;
    let height = frame.height as usize;
    check_plane("Y", &frame.y, width, height)?;
    check_plane("U", &frame.u, frame.chroma_width(), frame.chroma_height())?;
    check_plane("V", &frame.v, frame.chroma_width(), frame.chroma_height())?;

    let row_bytes = width
        .checked_mul(BYTES_PER_PIXEL)
        .ok_or_else(|| ReplayError::frame_geometry("frame row size overflows"))?;
    if dst_stride < row_bytes {
        return Err(ReplayError::frame_geometry(format!(
            "destination stride {} is smaller than a row of {} bytes",
            dst_stride, row_bytes
        )));
    }
    let required = dst_stride
        .checked_mul(height - 1)
        .and_then(|rows| rows.checked_add(row_bytes))
        .ok_or_else(|| ReplayError::frame_geometry("destination size overflows"))?;
    if dst_len < required {
        return Err(ReplayError::frame_geometry(format!(
            "destination holds {} bytes, {}x{} needs {}",
            dst_len, frame.width, frame.height, required
        )));
    }
    Ok(())
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert one YUV sample to B, G, R, A bytes.
#[inline]
pub fn yuv_to_bgra(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = clamp((c + 409 * e + 128) >> 8);
    let g = clamp((c - 100 * d - 208 * e + 128) >> 8);
    let b = clamp((c + 516 * d + 128) >> 8);
    [b, g, r, 255]
}

/// Convert `frame` into `dst`, writing `frame.height` rows `dst_stride` bytes
/// apart. Nothing is written when the geometry check fails.
pub fn i420_to_argb(frame: &RawFrame<'_>, dst: &mut [u8], dst_stride: usize) -> Result<()> {
    check_geometry(frame, dst.len(), dst_stride)?;

    let width = frame.width as usize;
    let chroma_width = frame.chroma_width();

    for row in 0..frame.height as usize {
        let y_row = &frame.y.data[row * frame.y.stride..][..width];
        let chroma_row = row / 2;
        let u_row = &frame.u.data[chroma_row * frame.u.stride..][..chroma_width];
        let v_row = &frame.v.data[chroma_row * frame.v.stride..][..chroma_width];
        let out = &mut dst[row * dst_stride..][..width * BYTES_PER_PIXEL];

        for (col, (pixel, &luma)) in out.chunks_exact_mut(BYTES_PER_PIXEL).zip(y_row).enumerate()
        {
            pixel.copy_from_slice(&yuv_to_bgra(luma, u_row[col / 2], v_row[col / 2]));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::PlanarImage;
    use proptest::prelude::*;

    #[test]
    fn reference_colors() {
        assert_eq!(yuv_to_bgra(16, 128, 128), [0, 0, 0, 255]);
        assert_eq!(yuv_to_bgra(235, 128, 128), [255, 255, 255, 255]);
        // Saturated red
        assert_eq!(yuv_to_bgra(81, 90, 240), [0, 0, 255, 255]);
        // Saturated blue
        let [b, g, r, _] = yuv_to_bgra(41, 240, 110);
        assert!(b > 250 && g < 5 && r < 5, "got {:?}", (b, g, r));
    }

    #[test]
    fn chroma_is_shared_by_2x2_blocks() {
        let mut image = PlanarImage::solid(4, 4, 128, 128, 128);
        image.set_chroma(1, 0, 240, 90);

        let frame = image.frame();
        let mut dst = vec![0u8; 4 * 4 * 4];
        i420_to_argb(&frame, &mut dst, 16).unwrap();

        let pixel = |x: usize, y: usize| &dst[y * 16 + x * 4..][..4];
        assert_eq!(pixel(2, 0), pixel(3, 1));
        assert_ne!(pixel(1, 0), pixel(2, 0));
        assert_eq!(pixel(0, 0), pixel(1, 1));
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let image = PlanarImage::solid(5, 3, 200, 128, 128);
        let frame = image.frame();
        assert_eq!(frame.chroma_width(), 3);
        assert_eq!(frame.chroma_height(), 2);

        let mut dst = vec![0u8; 5 * 3 * 4];
        i420_to_argb(&frame, &mut dst, 20).unwrap();
        assert!(dst.chunks_exact(4).all(|p| p == yuv_to_bgra(200, 128, 128)));
    }

    #[test]
    fn padded_strides_are_honored() {
        let image = PlanarImage::solid(6, 2, 100, 128, 128).with_padding(10);
        let frame = image.frame();
        assert_eq!(frame.y.stride, 16);

        // Destination rows padded as well; padding stays untouched
        let mut dst = vec![0xAAu8; 2 * 32];
        i420_to_argb(&frame, &mut dst, 32).unwrap();
        assert!(dst[24..32].iter().all(|&b| b == 0xAA));
        assert_eq!(&dst[0..4], &yuv_to_bgra(100, 128, 128));
        assert_eq!(&dst[32..36], &yuv_to_bgra(100, 128, 128));
    }

    #[test]
    fn short_destination_is_rejected_before_writing() {
        let image = PlanarImage::solid(4, 4, 100, 128, 128);
        let mut dst = vec![7u8; 4 * 4 * 4 - 1];
        let err = i420_to_argb(&image.frame(), &mut dst, 16).unwrap_err();

        assert!(matches!(err, ReplayError::FrameGeometry { .. }));
        assert!(dst.iter().all(|&b| b == 7));
    }

    #[test]
    fn short_planes_are_rejected() {
        let image = PlanarImage::solid(4, 4, 100, 128, 128);
        let mut frame = image.frame();
        frame.v.data = &frame.v.data[..3];
        assert!(check_geometry(&frame, 64, 16).is_err());

        let mut frame = image.frame();
        frame.y.stride = 2;
        assert!(check_geometry(&frame, 64, 16).is_err());

        let mut frame = image.frame();
        frame.height = 0;
        assert!(check_geometry(&frame, 64, 16).is_err());
    }

    #[test]
    fn packed_len_overflow() {
        assert_eq!(packed_len(640, 480), Some(640 * 480 * 4));
        assert_eq!(packed_len(0, 480), Some(0));
        if usize::BITS == 64 {
            assert!(packed_len(u32::MAX, u32::MAX).is_none());
        }
    }

    proptest! {
      #[test]
      fn alpha_is_opaque_and_luma_is_monotonic(y in 16u8..235, u in any::<u8>(), v in any::<u8>()) {
        let lower = yuv_to_bgra(y, u, v);
        let upper = yuv_to_bgra(y + 1, u, v);
        prop_assert_eq!(lower[3], 255);
        for channel in 0..3 {
          prop_assert!(upper[channel] >= lower[channel]);
        }
      }

      #[test]
      fn conversion_fills_every_pixel(width in 1u32..24, height in 1u32..24, luma in any::<u8>()) {
        let image = PlanarImage::solid(width, height, luma, 128, 128);
        let frame = image.frame();
        let mut dst = vec![0u8; packed_len(width, height).unwrap()];
        i420_to_argb(&frame, &mut dst, width as usize * BYTES_PER_PIXEL).unwrap();
        prop_assert!(dst.chunks_exact(4).all(|p| p == yuv_to_bgra(luma, 128, 128)));
      }
    }
}
