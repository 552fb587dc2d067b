// ffi.rs — C ABI over one owned compressor.
//
// Plain-data mirror of `Image` plus five entry points:
//
//   bc6h_compressor_create(preset)              → handle or NULL
//   bc6h_compressor_compress(h, src, dst)       → bool
//   bc6h_free_image(dst)                        frees dst->data, nulls it
//   bc6h_compressor_release(h)                  drops GPU resources (idempotent)
//   bc6h_compressor_destroy(h)                  frees the handle
//
// This layer only copies fields and translates format tags. The
// destination's width/height/data_size are taken from the compressed result,
// i.e. the block grid, not from the source.
//
// Ownership: `dst->data` is a Rust allocation. It must be released with
// `bc6h_free_image`, never with the C allocator. A compression overwrites
// `dst` without looking at what it held, so a buffer from an earlier call
// stays valid until the caller frees it. A failed compression can still hand
// back a sentinel-filled buffer; `dst->data` is non-NULL in that case and
// must be freed the same way.

use std::ptr;

use log::warn;

use crate::compressor::{Compressor, CompressorConfig, GpuCompressor};
use crate::context::ComputeContext;
use crate::gpu::kernel::Preset;
use crate::image::{Image, ImageFormat, ImageView, RawBuffer};

pub const BC6H_FORMAT_RGBA32F: u32 = 0;
pub const BC6H_FORMAT_BC6H: u32 = 1;

pub const BC6H_PRESET_QUALITY: u32 = 0;
pub const BC6H_PRESET_SPEED: u32 = 1;

/// C-side image description.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Bc6hImage {
    /// One of the `BC6H_FORMAT_*` tags.
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub data: *mut u8,
    pub data_size: u32,
}

impl Default for Bc6hImage {
    fn default() -> Self {
        Bc6hImage {
            format: BC6H_FORMAT_BC6H,
            width: 0,
            height: 0,
            data: ptr::null_mut(),
            data_size: 0,
        }
    }
}

/// Opaque handle owned by the C caller.
pub struct Bc6hCompressor {
    inner: GpuCompressor,
}

/// Borrow `image`'s pixels as a view in `format`.
///
/// # Safety
/// `image.data` must be valid for `image.data_size` bytes (or NULL with a
/// zero size) for the lifetime of the returned view.
unsafe fn view_of<'a>(image: &Bc6hImage, format: ImageFormat) -> ImageView<'a> {
    let data: &'a [u8] = if image.data.is_null() || image.data_size == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(image.data, image.data_size as usize)
    };
    ImageView::new(format, image.width, image.height, data)
}

/// Move `image`'s buffer into `out`, overwriting every field.
fn export(image: &mut Image, out: &mut Bc6hImage) {
    let (format, width, height) = (image.format.tag(), image.width, image.height);
    let RawBuffer { ptr, len } = image.detach();
    *out = Bc6hImage {
        format,
        width,
        height,
        data: ptr,
        data_size: len as u32,
    };
}

/// Create a compressor with the given preset tag. Returns NULL on failure.
#[no_mangle]
pub extern "C" fn bc6h_compressor_create(preset: u32) -> *mut Bc6hCompressor {
    let Ok(preset) = Preset::try_from(preset) else {
        warn!("unknown preset tag {preset}");
        return ptr::null_mut();
    };
    let config = CompressorConfig {
        preset,
        ..CompressorConfig::default()
    };
    match GpuCompressor::init(config) {
        Ok(inner) => Box::into_raw(Box::new(Bc6hCompressor { inner })),
        Err(err) => {
            warn!("compressor init failed: {err}");
            ptr::null_mut()
        }
    }
}

/// Translate `src`, compress it with `compressor`, and export the result
/// into `dst`. An unknown format tag fails before `dst` is touched.
///
/// # Safety
/// `src.data` must be valid for `src.data_size` bytes (or NULL).
unsafe fn compress_into<C: ComputeContext>(
    compressor: &Compressor<C>,
    src: &Bc6hImage,
    dst: &mut Bc6hImage,
) -> bool {
    let format = match ImageFormat::try_from(src.format) {
        Ok(format) => format,
        Err(err) => {
            warn!("{err}");
            return false;
        }
    };

    let source = view_of(src, format);
    let mut result = Image::default();
    let outcome = compressor.compress(source, &mut result);
    if let Err(err) = &outcome {
        warn!("compression failed: {err}");
    }
    if !result.data.is_empty() {
        export(&mut result, dst);
    }
    outcome.is_ok()
}

/// Compress `src` into `dst`.
///
/// `dst` is overwritten, never freed: a buffer it pointed at before the call
/// still belongs to the caller and must be released with `bc6h_free_image`.
///
/// # Safety
/// `handle` must come from `bc6h_compressor_create` and not be destroyed.
/// `src` and `dst` must be valid, non-overlapping pointers, and `src->data`
/// must be valid for `src->data_size` bytes. `dst` may be uninitialised.
#[no_mangle]
pub unsafe extern "C" fn bc6h_compressor_compress(
    handle: *mut Bc6hCompressor,
    src: *const Bc6hImage,
    dst: *mut Bc6hImage,
) -> bool {
    let (Some(handle), Some(src), Some(dst)) = (handle.as_ref(), src.as_ref(), dst.as_mut()) else {
        return false;
    };
    compress_into(&handle.inner, src, dst)
}

/// Free a buffer produced by `bc6h_compressor_compress` and null `image->data`.
///
/// # Safety
/// `image` must be NULL or point to a `Bc6hImage` whose `data` is NULL or
/// was produced by this library and not freed yet.
#[no_mangle]
pub unsafe extern "C" fn bc6h_free_image(image: *mut Bc6hImage) {
    let Some(image) = image.as_mut() else {
        return;
    };
    if !image.data.is_null() {
        let raw = RawBuffer {
            ptr: image.data,
            len: image.data_size as usize,
        };
        drop(raw.reclaim());
    }
    image.data = ptr::null_mut();
    image.data_size = 0;
}

/// Release all GPU resources held by `handle`. Further compressions fail.
///
/// # Safety
/// `handle` must be NULL or come from `bc6h_compressor_create`.
#[no_mangle]
pub unsafe extern "C" fn bc6h_compressor_release(handle: *mut Bc6hCompressor) {
    if let Some(handle) = handle.as_ref() {
        handle.inner.release();
    }
}

/// Destroy `handle`, releasing everything it owns.
///
/// # Safety
/// `handle` must be NULL or come from `bc6h_compressor_create`, and must not
/// be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn bc6h_compressor_destroy(handle: *mut Bc6hCompressor) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Published average GPU time per compression in milliseconds.
///
/// # Safety
/// `handle` must be NULL or come from `bc6h_compressor_create`.
#[no_mangle]
pub unsafe extern "C" fn bc6h_compressor_time_ms(handle: *const Bc6hCompressor) -> f32 {
    handle
        .as_ref()
        .map_or(0.0, |h| h.inner.compression_time_ms() as f32)
}
