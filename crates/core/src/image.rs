//! Borrowed views of caller-owned interleaved pixel buffers.

use crate::error::{Result, SrError};

fn validate(len: usize, width: usize, height: usize, channels: usize) -> Result<()> {
    if channels != 3 && channels != 4 {
        return Err(SrError::unsupported(format!(
            "{channels}-channel images are not supported (expected 3 or 4)"
        )));
    }
    if width == 0 || height == 0 {
        return Err(SrError::unsupported(format!("empty {width}x{height} image")));
    }
    let expected = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(|| SrError::unsupported(format!("{width}x{height} image is too large")))?;
    if len != expected {
        return Err(SrError::unsupported(format!(
            "buffer of {len} bytes does not hold a {width}x{height}x{channels} image ({expected} bytes)"
        )));
    }
    Ok(())
}

/// Read-only interleaved 8-bit image, rows packed without padding.
#[derive(Clone, Copy, Debug)]
pub struct HostImage<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    channels: usize,
}

impl<'a> HostImage<'a> {
    pub fn new(data: &'a [u8], width: usize, height: usize, channels: usize) -> Result<Self> {
        validate(data.len(), width, height, channels)?;
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn row_bytes(&self) -> usize {
        self.width * self.channels
    }

    /// Bytes of rows `[y0, y1)`.
    pub fn rows(&self, y0: usize, y1: usize) -> &'a [u8] {
        let stride = self.row_bytes();
        &self.data[y0 * stride..y1 * stride]
    }
}

/// Writable interleaved 8-bit image the session fills.
#[derive(Debug)]
pub struct HostImageMut<'a> {
    data: &'a mut [u8],
    width: usize,
    height: usize,
    channels: usize,
}

impl<'a> HostImageMut<'a> {
    pub fn new(data: &'a mut [u8], width: usize, height: usize, channels: usize) -> Result<Self> {
        validate(data.len(), width, height, channels)?;
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn row_bytes(&self) -> usize {
        self.width * self.channels
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn rows_mut(&mut self, y0: usize, y1: usize) -> &mut [u8] {
        let stride = self.row_bytes();
        &mut self.data[y0 * stride..y1 * stride]
    }
}
