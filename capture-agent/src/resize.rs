// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Parallel RGBA8 resizer
//!
//! The destination is cut into row bands that run as independent workloads
//! on a [`WorkerPool`]. Every band runs the separable Lanczos-3 convolution
//! of `fast_image_resize` (horizontal then vertical) over its own crop of
//! the source; the caller blocks until every band has been written.

use std::io;
use std::sync::Mutex;

use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use log::debug;

use crate::error::{CaptureError, Result};

/// Opaque unit of work borrowed from the caller's stack
pub type Workload<'scope> = Box<dyn FnOnce() + Send + 'scope>;

/// Minimal task pool used by the resizer
pub trait WorkerPool: Send + Sync {
    /// Number of workloads worth splitting a job into
    fn suggested_workload_count(&self) -> usize;

    /// Start every workload and return once all of them have finished
    fn join_all<'scope>(&self, workloads: Vec<Workload<'scope>>);
}

/// Queue of workloads submitted to a pool together
pub struct WorkloadBatch<'pool, 'scope> {
    pool: &'pool dyn WorkerPool,
    queued: Vec<Workload<'scope>>,
}

impl<'pool, 'scope> WorkloadBatch<'pool, 'scope> {
    pub fn new(pool: &'pool dyn WorkerPool) -> Self {
        Self {
            pool,
            queued: Vec::with_capacity(pool.suggested_workload_count()),
        }
    }

    /// Queue a workload; nothing runs until [`WorkloadBatch::join_all`]
    pub fn submit<F>(&mut self, work: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        self.queued.push(Box::new(work));
    }

    /// Number of queued workloads
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Run everything queued and block until it is done
    pub fn join_all(self) {
        if !self.queued.is_empty() {
            self.pool.join_all(self.queued);
        }
    }
}

/// Fixed-size pool backed by rayon
pub struct RayonPool {
    pool: rayon::ThreadPool,
}

impl RayonPool {
    /// Create a pool with `threads` workers (0 picks the CPU count)
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hq-resize-{i}"))
            .build()
            .map_err(|e| CaptureError::Io(io::Error::other(e.to_string())))?;
        Ok(Self { pool })
    }
}

impl WorkerPool for RayonPool {
    fn suggested_workload_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn join_all<'scope>(&self, workloads: Vec<Workload<'scope>>) {
        self.pool.scope(|scope| {
            for work in workloads {
                scope.spawn(move |_| work());
            }
        });
    }
}

/// Runs workloads one after another on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn suggested_workload_count(&self) -> usize {
        1
    }

    fn join_all<'scope>(&self, workloads: Vec<Workload<'scope>>) {
        for work in workloads {
            work();
        }
    }
}

// ============================================================================
// Resize
// ============================================================================

fn rows_per_band(rows: usize, pool: &dyn WorkerPool) -> usize {
    rows.div_ceil(pool.suggested_workload_count().max(1)).max(1)
}

fn resize_error(e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Readback(format!("resize failed: {e}"))
}

/// Resize one band of destination rows starting at `first_row`. The source
/// window is cropped to the rows the band maps to; the filter still reads
/// source pixels outside it, so bands join without seams.
fn resize_band(
    src: &ImageRef<'_>,
    (src_w, src_h): (u32, u32),
    dst: &mut [u8],
    (dst_w, dst_h): (u32, u32),
    first_row: u32,
) -> Result<()> {
    let rows = (dst.len() / (dst_w as usize * 4)) as u32;
    let scale = f64::from(src_h) / f64::from(dst_h);
    let options = ResizeOptions::new()
        .resize_alg(ResizeAlg::Convolution(FilterType::Lanczos3))
        .use_alpha(false)
        .crop(0.0, f64::from(first_row) * scale, f64::from(src_w), f64::from(rows) * scale);

    let mut band = Image::from_slice_u8(dst_w, rows, dst, PixelType::U8x4).map_err(resize_error)?;
    Resizer::new()
        .resize(src, &mut band, &options)
        .map_err(resize_error)
}

/// Resize a tightly packed RGBA8 image with a Lanczos-3 filter. `dst` is
/// overwritten with exactly `dst_w * dst_h * 4` bytes.
pub fn resize_rgba8(
    pool: &dyn WorkerPool,
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut Vec<u8>,
    dst_w: u32,
    dst_h: u32,
) -> Result<()> {
    let (sw, sh, dw, dh) = (src_w as usize, src_h as usize, dst_w as usize, dst_h as usize);

    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return Err(CaptureError::Readback(format!(
            "cannot resize {src_w}x{src_h} to {dst_w}x{dst_h}"
        )));
    }
    if src.len() < sw * sh * 4 {
        return Err(CaptureError::Readback(format!(
            "resize source holds {} bytes, {src_w}x{src_h} needs {}",
            src.len(),
            sw * sh * 4
        )));
    }

    dst.clear();
    if (sw, sh) == (dw, dh) {
        dst.extend_from_slice(&src[..sw * sh * 4]);
        return Ok(());
    }
    dst.resize(dw * dh * 4, 0);

    debug!("Resizing {src_w}x{src_h} -> {dst_w}x{dst_h}");

    let source = ImageRef::new(src_w, src_h, &src[..sw * sh * 4], PixelType::U8x4).map_err(resize_error)?;
    let band_rows = rows_per_band(dh, pool);
    let failure: Mutex<Option<CaptureError>> = Mutex::new(None);

    let mut batch = WorkloadBatch::new(pool);
    for (band, out) in dst.chunks_mut(band_rows * dw * 4).enumerate() {
        let (source, failure) = (&source, &failure);
        let first_row = (band * band_rows) as u32;
        batch.submit(move || {
            if let Err(e) = resize_band(source, (src_w, src_h), out, (dst_w, dst_h), first_row)
                && let Ok(mut slot) = failure.lock()
            {
                slot.get_or_insert(e);
            }
        });
    }
    batch.join_all();

    match failure.into_inner() {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(e),
        Err(_) => Err(CaptureError::Readback("resize band panicked".into())),
    }
}
