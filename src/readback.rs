// readback.rs — Turning a mapped staging buffer into packed BC6H blocks.
//
// The compression target is copied into a CPU-visible staging buffer whose
// rows may be padded: wgpu requires `bytes_per_row` of a texture→buffer
// copy to be a multiple of COPY_BYTES_PER_ROW_ALIGNMENT (256).
//
//   staging row:  [ blk0 | blk1 | ... | blkN-1 | padding ]
//                 |<----- blockW × 16 ------>|
//                 |<----------- row_pitch ----------->|
//
// The destination wants tightly packed rows, so padding is stripped one row
// at a time. If the mapped layout is not the one we asked for, nothing is
// copied and the destination is filled with the 0xFF sentinel instead.

use thiserror::Error;

use crate::image::BlockExtent;

/// Byte written over the whole destination when the staging layout is wrong.
pub const SENTINEL_BYTE: u8 = 0xFF;

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of 0 or 1 leaves the value unchanged.
#[inline]
pub fn align_to(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// The staging layout a backend is expected to produce for a block grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingLayout {
    /// Meaningful bytes per row (`blockW × 16`).
    pub row_bytes: u32,
    /// Bytes between the starts of consecutive rows.
    pub row_pitch: u32,
    pub rows: u32,
}

impl StagingLayout {
    pub fn for_extent(extent: BlockExtent, row_alignment: u32) -> Self {
        let row_bytes = extent.packed_row_bytes() as u32;
        StagingLayout {
            row_bytes,
            row_pitch: align_to(row_bytes, row_alignment),
            rows: extent.height,
        }
    }

    /// Size of a staging buffer holding this layout.
    pub fn byte_len(&self) -> u64 {
        self.row_pitch as u64 * self.rows as u64
    }
}

/// A mapped staging buffer as the backend hands it back.
#[derive(Debug, Clone, Copy)]
pub struct StagingView<'a> {
    pub bytes: &'a [u8],
    pub row_pitch: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "staging layout mismatch: row pitch {actual_pitch} (expected {expected_pitch}), \
     {actual_len} bytes over {actual_rows} rows (need {expected_len} over {expected_rows})"
)]
pub struct LayoutMismatch {
    pub expected_pitch: u32,
    pub actual_pitch: u32,
    pub expected_rows: u32,
    pub actual_rows: u32,
    pub expected_len: u64,
    pub actual_len: u64,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Copy the blocks out of `view`, dropping row padding.
///
/// Fails without copying anything when the pitch, row count, or buffer length
/// differs from the layout computed for `extent` at `row_alignment`.
pub fn extract_blocks(
    view: &StagingView<'_>,
    extent: BlockExtent,
    row_alignment: u32,
) -> Result<Vec<u8>, LayoutMismatch> {
    let layout = StagingLayout::for_extent(extent, row_alignment);
    let actual_len = view.bytes.len() as u64;

    if view.row_pitch != layout.row_pitch
        || view.rows != layout.rows
        || actual_len < layout.byte_len()
    {
        return Err(LayoutMismatch {
            expected_pitch: layout.row_pitch,
            actual_pitch: view.row_pitch,
            expected_rows: layout.rows,
            actual_rows: view.rows,
            expected_len: layout.byte_len(),
            actual_len,
        });
    }

    let row_bytes = layout.row_bytes as usize;
    let pitch = layout.row_pitch as usize;
    let mut packed = Vec::with_capacity(extent.byte_len());
    for row in 0..layout.rows as usize {
        let start = row * pitch;
        packed.extend_from_slice(&view.bytes[start..start + row_bytes]);
    }
    Ok(packed)
}

/// A destination-sized buffer filled with [`SENTINEL_BYTE`].
pub fn sentinel_blocks(extent: BlockExtent) -> Vec<u8> {
    vec![SENTINEL_BYTE; extent.byte_len()]
}
