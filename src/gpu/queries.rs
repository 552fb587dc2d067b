// gpu/queries.rs — GPU side of the timing ring.
//
// One timestamp query set holds a begin/end pair per ring slot:
//
//   query index:   0     1     2     3    ...   2s    2s+1
//                  [slot 0  ]  [slot 1  ]       [slot s    ]
//                  begin end   begin end        begin end
//
// The compute pass writes the pair through `ComputePassTimestampWrites`.
// In the same command buffer the pair is resolved into slot `s`'s region
// of the resolve buffer (256-byte aligned, as resolve offsets require) and
// copied into that slot's own mappable readback buffer. Each slot has its
// own readback buffer so mapping slot `s` never blocks writes to the others.
//
// wgpu has no disjoint query. A sample is flagged disjoint when either
// timestamp is zero or the interval runs backwards.

use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::wait_for_map;
use crate::timing::TimestampSample;

/// `resolve_query_set` destination offsets must be multiples of this.
const RESOLVE_ALIGNMENT: u64 = wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT;

/// Bytes of one begin/end pair.
const PAIR_BYTES: u64 = 2 * wgpu::QUERY_SIZE as u64;

pub struct TimestampQueries {
    query_set: wgpu::QuerySet,
    resolve:   wgpu::Buffer,
    readback:  Vec<wgpu::Buffer>,
    /// Nanoseconds per tick, from `Queue::get_timestamp_period`.
    period_ns: f32,
}

impl TimestampQueries {
    /// Create a ring of `depth` begin/end pairs.
    ///
    /// Fails with `MissingFeatures` when the device was created without
    /// `TIMESTAMP_QUERY`.
    pub fn new(gpu: &GpuDevice, depth: usize) -> Result<Self, GpuError> {
        if !gpu.has_feature(wgpu::Features::TIMESTAMP_QUERY) {
            return Err(GpuError::MissingFeatures(wgpu::Features::TIMESTAMP_QUERY));
        }
        let period_ns = gpu.queue.get_timestamp_period();

        let (query_set, resolve, readback) = gpu.scoped("timestamp queries", |device| {
            let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("bc6h timestamps"),
                ty:    wgpu::QueryType::Timestamp,
                count: (2 * depth) as u32,
            });
            let resolve = device.create_buffer(&wgpu::BufferDescriptor {
                label:              Some("bc6h timestamp resolve"),
                size:               RESOLVE_ALIGNMENT * depth as u64,
                usage:              wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let readback = (0..depth)
                .map(|_| {
                    device.create_buffer(&wgpu::BufferDescriptor {
                        label:              Some("bc6h timestamp readback"),
                        size:               PAIR_BYTES,
                        usage:              wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    })
                })
                .collect::<Vec<_>>();
            (query_set, resolve, readback)
        })?;

        Ok(TimestampQueries { query_set, resolve, readback, period_ns })
    }

    pub fn depth(&self) -> usize {
        self.readback.len()
    }

    /// Timestamp writes for a compute pass recording into `slot`.
    pub fn pass_writes(&self, slot: usize) -> wgpu::ComputePassTimestampWrites<'_> {
        let base = (2 * slot) as u32;
        wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(base),
            end_of_pass_write_index: Some(base + 1),
        }
    }

    /// Record the resolve + copy of `slot` after the pass that wrote it.
    pub fn encode_resolve(&self, encoder: &mut wgpu::CommandEncoder, slot: usize) {
        let base = (2 * slot) as u32;
        let offset = RESOLVE_ALIGNMENT * slot as u64;
        encoder.resolve_query_set(&self.query_set, base..base + 2, &self.resolve, offset);
        encoder.copy_buffer_to_buffer(&self.resolve, offset, &self.readback[slot], 0, PAIR_BYTES);
    }

    /// Wait for `slot`'s pair and read it. Busy-polls the device with no
    /// timeout until the map completes.
    pub fn read(&self, gpu: &GpuDevice, slot: usize) -> Result<TimestampSample, GpuError> {
        let buffer = &self.readback[slot];
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        wait_for_map(&gpu.device, &rx, true)?;

        let pair: [u64; 2] = {
            let mapped = slice.get_mapped_range();
            bytemuck::pod_read_unaligned(&mapped[..PAIR_BYTES as usize])
        };
        buffer.unmap();

        Ok(sample_from_ticks(pair[0], pair[1], self.period_ns))
    }
}

/// Build a sample from raw ticks and the queue's tick period.
fn sample_from_ticks(begin: u64, end: u64, period_ns: f32) -> TimestampSample {
    let frequency = if period_ns > 0.0 {
        (1.0e9 / period_ns as f64).round() as u64
    } else {
        0
    };
    TimestampSample {
        begin,
        end,
        frequency,
        disjoint: begin == 0 || end == 0 || end < begin || frequency == 0,
    }
}
