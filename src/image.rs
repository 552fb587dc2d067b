// image.rs — Host-side image descriptors and the BC6H block record.
//
// Two shapes of image cross the public API:
//
//   ImageView<'a>  borrowed source pixels (RGBA32F, tightly packed rows)
//   Image          owned pixels; the compressor's destination is one of
//                  these, holding BC6H blocks
//
// BC6H works on 4×4 texel blocks, each encoded into 16 bytes. Image
// dimensions that are not multiples of 4 round UP to whole blocks, so a
// 17×15 source produces a 5×4 block grid (320 bytes). A BC6H Image's
// width and height are that block grid.
//
// New concepts this file introduces:
// - TryFrom<u32> for decoding C-side enum tags
// - Box<[u8]>::into_raw / from_raw for handing a buffer across an FFI edge
// - #[repr(C)] + bytemuck::Pod for a fixed 16-byte block record

use std::fmt;

use thiserror::Error;

/// Edge length of one BC block in texels.
pub const BC_BLOCK_SIZE: u32 = 4;

/// Bytes occupied by one encoded BC6H block.
pub const BLOCK_BYTES: usize = std::mem::size_of::<BlockBc6h>();

/// Bytes occupied by one RGBA32F texel.
pub const RGBA32F_TEXEL_BYTES: usize = 16;

/// Ceiling division for the small unsigned quantities used in block math.
#[inline]
pub fn div_round_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

// ---------------------------------------------------------------------------
// BlockBc6h
// ---------------------------------------------------------------------------

/// One encoded BC6H block: 128 bits, stored as four little-endian words.
///
/// The compression kernel writes one of these per texel of an `Rgba32Uint`
/// target, so the in-memory layout must stay exactly 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlockBc6h {
    pub words: [u32; 4],
}

impl BlockBc6h {
    /// Mode field from the low bits of the block. Mode 11 encodes as `0b00011`.
    pub fn mode_bits(&self) -> u32 {
        self.words[0] & 0x1f
    }
}

// ---------------------------------------------------------------------------
// ImageFormat
// ---------------------------------------------------------------------------

/// Pixel layout of an image handed to or produced by the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Four 32-bit floats per texel, linear HDR.
    Rgba32F,
    /// BC6H unsigned-float blocks, 16 bytes per 4×4 block. Width and height
    /// of a BC6H image count blocks, not texels.
    Bc6h,
}

impl ImageFormat {
    /// Numeric tag used on the C boundary.
    pub fn tag(self) -> u32 {
        match self {
            ImageFormat::Rgba32F => 0,
            ImageFormat::Bc6h => 1,
        }
    }

    /// Bytes per element: one texel for RGBA32F, one block for BC6H.
    pub fn bytes_per_element(self) -> usize {
        match self {
            ImageFormat::Rgba32F => RGBA32F_TEXEL_BYTES,
            ImageFormat::Bc6h => BLOCK_BYTES,
        }
    }

    /// Bytes needed to store a `width`×`height` image in this format.
    pub fn data_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_element()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Rgba32F => write!(f, "RGBA32F"),
            ImageFormat::Bc6h => write!(f, "BC6H"),
        }
    }
}

/// A C-side format tag that names no known format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown image format tag {0}")]
pub struct UnknownFormatTag(pub u32);

impl TryFrom<u32> for ImageFormat {
    type Error = UnknownFormatTag;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(ImageFormat::Rgba32F),
            1 => Ok(ImageFormat::Bc6h),
            other => Err(UnknownFormatTag(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// BlockExtent
// ---------------------------------------------------------------------------

/// Size of an image measured in whole BC blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockExtent {
    pub width: u32,
    pub height: u32,
}

impl BlockExtent {
    pub fn new(width: u32, height: u32) -> Self {
        BlockExtent { width, height }
    }

    /// Block grid covering a `width`×`height` texel image (partial blocks round up).
    pub fn for_texels(width: u32, height: u32) -> Self {
        BlockExtent {
            width: div_round_up(width, BC_BLOCK_SIZE),
            height: div_round_up(height, BC_BLOCK_SIZE),
        }
    }

    /// Bytes in one tightly packed row of blocks.
    pub fn packed_row_bytes(&self) -> usize {
        self.width as usize * BLOCK_BYTES
    }

    /// Bytes in the whole tightly packed block grid.
    pub fn byte_len(&self) -> usize {
        self.packed_row_bytes() * self.height as usize
    }

    /// Texel size of the block grid, i.e. the size of the compressed texture.
    pub fn texel_extent(&self) -> (u32, u32) {
        (self.width * BC_BLOCK_SIZE, self.height * BC_BLOCK_SIZE)
    }
}

impl fmt::Display for BlockExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} blocks", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// ImageView
// ---------------------------------------------------------------------------

/// Borrowed image: dimensions, format and a slice of the caller's bytes.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(format: ImageFormat, width: u32, height: u32, data: &'a [u8]) -> Self {
        ImageView { format, width, height, data }
    }

    /// Bytes this view should carry for its format and dimensions.
    pub fn expected_data_size(&self) -> usize {
        self.format.data_size(self.width, self.height)
    }

    pub fn block_extent(&self) -> BlockExtent {
        BlockExtent::for_texels(self.width, self.height)
    }

    /// Read texel `(x, y)` of an RGBA32F view. The slice need not be 4-byte aligned.
    pub fn texel_rgba32f(&self, x: u32, y: u32) -> [f32; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * RGBA32F_TEXEL_BYTES;
        bytemuck::pod_read_unaligned(&self.data[offset..offset + RGBA32F_TEXEL_BYTES])
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Owned image. The compressor fills one of these as its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Default for Image {
    /// An empty BC6H image with no buffer, ready to be used as a destination.
    fn default() -> Self {
        Image {
            format: ImageFormat::Bc6h,
            width: 0,
            height: 0,
            data: Vec::new(),
        }
    }
}

impl Image {
    pub fn new(format: ImageFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        Image { format, width, height, data }
    }

    /// Pack an RGBA32F image from a slice of texels.
    pub fn from_rgba32f(width: u32, height: u32, texels: &[[f32; 4]]) -> Self {
        Image {
            format: ImageFormat::Rgba32F,
            width,
            height,
            data: bytemuck::cast_slice(texels).to_vec(),
        }
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView::new(self.format, self.width, self.height, &self.data)
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// The BC6H block at block coordinates `(bx, by)`.
    pub fn block(&self, bx: u32, by: u32) -> Option<BlockBc6h> {
        if self.format != ImageFormat::Bc6h || bx >= self.width || by >= self.height {
            return None;
        }
        let offset = (by as usize * self.width as usize + bx as usize) * BLOCK_BYTES;
        let bytes = self.data.get(offset..offset + BLOCK_BYTES)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Drop the pixel buffer. Dimensions and format are left as they were.
    pub fn free(&mut self) {
        self.data = Vec::new();
    }

    /// Hand the pixel buffer to foreign code. The image is left without data.
    ///
    /// The returned buffer must come back through [`RawBuffer::reclaim`]
    /// exactly once, or it leaks.
    pub fn detach(&mut self) -> RawBuffer {
        let boxed = std::mem::take(&mut self.data).into_boxed_slice();
        let len = boxed.len();
        RawBuffer {
            ptr: Box::into_raw(boxed) as *mut u8,
            len,
        }
    }
}

// ---------------------------------------------------------------------------
// RawBuffer
// ---------------------------------------------------------------------------

/// A heap buffer detached from an [`Image`] for use across the C boundary.
#[derive(Debug)]
pub struct RawBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

impl RawBuffer {
    /// Take ownership of a buffer previously produced by [`Image::detach`].
    ///
    /// # Safety
    /// `ptr` and `len` must be exactly the pair returned by `detach`, and the
    /// buffer must not have been reclaimed already.
    pub unsafe fn reclaim(self) -> Vec<u8> {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr, self.len);
        Box::from_raw(slice).into_vec()
    }
}
