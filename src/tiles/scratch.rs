use crate::core::constants::DEFAULT_SCRATCH_RETAINED;
use image::{Rgba, RgbaImage};
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Reusable stitch canvases for reprojection.
///
/// A canvas is checked out for the duration of one warp and returned when the
/// [`ScratchCanvas`] guard drops, so no two warps ever share a buffer.
#[derive(Debug)]
pub struct ScratchPool {
    buffers: Mutex<Vec<RgbaImage>>,
    retained: usize,
}

impl ScratchPool {
    /// Pool keeping at most `retained` idle canvases
    pub fn new(retained: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            retained,
        }
    }

    /// Transparent canvas of exactly `width` x `height`
    pub fn acquire(&self, width: u32, height: u32) -> ScratchCanvas<'_> {
        let reused = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers
                .iter()
                .position(|b| b.dimensions() == (width, height))
                .map(|index| buffers.swap_remove(index))
        };
        let image = match reused {
            Some(mut image) => {
                for pixel in image.pixels_mut() {
                    *pixel = Rgba([0, 0, 0, 0]);
                }
                image
            }
            None => RgbaImage::new(width, height),
        };
        ScratchCanvas { pool: self, image }
    }

    pub fn idle_count(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn give_back(&self, image: RgbaImage) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.retained {
            buffers.push(image);
        }
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(DEFAULT_SCRATCH_RETAINED)
    }
}

/// Checked-out canvas; returns to its pool on drop
pub struct ScratchCanvas<'a> {
    pool: &'a ScratchPool,
    image: RgbaImage,
}

impl Deref for ScratchCanvas<'_> {
    type Target = RgbaImage;

    fn deref(&self) -> &RgbaImage {
        &self.image
    }
}

impl DerefMut for ScratchCanvas<'_> {
    fn deref_mut(&mut self) -> &mut RgbaImage {
        &mut self.image
    }
}

impl Drop for ScratchCanvas<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.image));
    }
}
