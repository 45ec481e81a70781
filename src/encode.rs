//! Per-frame JPEG encoding

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::{GrayImage, ImageBuffer, RgbImage};

use crate::capture::{PixelFormat, RawFrame};
use crate::error::EncodeError;

/// Turns a raw device frame into JPEG bytes
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, EncodeError>;
}

/// JPEG encoder backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegEncoder;

impl JpegEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, EncodeError> {
        // The codec rejects 0
        let quality = quality.clamp(1, 100);

        match frame.format {
            PixelFormat::Mjpeg => passthrough(frame),
            PixelFormat::Rgb24 => {
                check_len(frame)?;
                let image: RgbImage =
                    ImageBuffer::from_raw(frame.width, frame.height, frame.data.to_vec())
                        .ok_or_else(|| invalid_dimensions(frame))?;
                write_jpeg(&image, quality)
            }
            PixelFormat::Gray8 => {
                check_len(frame)?;
                let image: GrayImage =
                    ImageBuffer::from_raw(frame.width, frame.height, frame.data.to_vec())
                        .ok_or_else(|| invalid_dimensions(frame))?;
                write_jpeg(&image, quality)
            }
            PixelFormat::Yuyv => {
                check_len(frame)?;
                let image: RgbImage = ImageBuffer::from_raw(
                    frame.width,
                    frame.height,
                    yuyv_to_rgb(&frame.data),
                )
                .ok_or_else(|| invalid_dimensions(frame))?;
                write_jpeg(&image, quality)
            }
        }
    }
}

fn write_jpeg<P>(image: &ImageBuffer<P, Vec<u8>>, quality: u8) -> Result<Bytes, EncodeError>
where
    P: image::Pixel<Subpixel = u8> + image::PixelWithColorType,
{
    let mut jpeg_bytes = Vec::new();
    let mut encoder = ImageJpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
    encoder
        .encode_image(image)
        .map_err(|e| EncodeError::Codec(e.to_string()))?;

    Ok(Bytes::from(jpeg_bytes))
}

/// Camera-side JPEG is forwarded untouched once it looks complete
fn passthrough(frame: &RawFrame) -> Result<Bytes, EncodeError> {
    let data = &frame.data;
    if data.len() < 4 || data[..2] != [0xff, 0xd8] {
        return Err(EncodeError::InvalidFrame(
            "MJPEG frame is missing the SOI marker".to_string(),
        ));
    }

    // Some drivers pad the buffer after EOI
    let body = &data[2..];
    if !body.windows(2).any(|w| w == [0xff, 0xd9]) {
        return Err(EncodeError::InvalidFrame(
            "MJPEG frame is truncated (no EOI marker)".to_string(),
        ));
    }

    Ok(data.clone())
}

fn check_len(frame: &RawFrame) -> Result<(), EncodeError> {
    let expected = frame
        .format
        .frame_len(frame.width, frame.height)
        .ok_or(EncodeError::Unsupported(frame.format))?;

    if frame.data.len() < expected {
        return Err(EncodeError::InvalidFrame(format!(
            "{:?} frame {}x{} needs {} bytes, got {}",
            frame.format,
            frame.width,
            frame.height,
            expected,
            frame.data.len()
        )));
    }

    Ok(())
}

fn invalid_dimensions(frame: &RawFrame) -> EncodeError {
    EncodeError::InvalidFrame(format!(
        "buffer does not match {}x{}",
        frame.width, frame.height
    ))
}

/// BT.601 limited-range YUYV to packed RGB
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);

    for chunk in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    rgb
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}
