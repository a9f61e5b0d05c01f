//! Fixed-capacity tile storage pool.
//!
//! A `TileStorage` owns `capacity` interchangeable slots, each holding one
//! tile's worth of texels in a uniform size and format. Slots are created
//! once, when the owning cache is built, and are never resized: the capacity
//! bounds the worst-case memory footprint of a cache. Allocation and release
//! only move slots between the free and bound sets; the texel buffers stay
//! allocated and production overwrites them.
//!
//! Slot contents are guarded by one `RwLock` per slot so that a tile being
//! produced can be written while other slots are read.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use orbis_common::{SlotId, TileError, TileResult};

/// Texel layout of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// One channel (elevation)
    R32F,
    /// Two channels
    Rg32F,
    /// Three channels (normals)
    Rgb32F,
    /// Four channels (color)
    Rgba32F,
}

impl TileFormat {
    /// Number of `f32` channels per texel.
    #[must_use]
    pub const fn channels(self) -> u32 {
        match self {
            Self::R32F => 1,
            Self::Rg32F => 2,
            Self::Rgb32F => 3,
            Self::Rgba32F => 4,
        }
    }

    /// Size of one texel in bytes.
    #[must_use]
    pub const fn bytes_per_texel(self) -> usize {
        self.channels() as usize * std::mem::size_of::<f32>()
    }

    /// Size of one `tile_size x tile_size` slot in bytes.
    #[must_use]
    pub const fn bytes_per_slot(self, tile_size: u32) -> usize {
        (tile_size as usize) * (tile_size as usize) * self.bytes_per_texel()
    }
}

/// Texels of one tile, row-major, channels interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBuffer {
    size: u32,
    channels: u32,
    data: Vec<f32>,
}

impl TileBuffer {
    /// Creates a zeroed `size x size` buffer.
    #[must_use]
    pub fn new(size: u32, channels: u32) -> Self {
        Self {
            size,
            channels,
            data: vec![0.0; (size * size * channels) as usize],
        }
    }

    /// Edge length in texels, borders included.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Channels per texel.
    #[must_use]
    pub const fn channels(&self) -> u32 {
        self.channels
    }

    /// Raw texel data.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable raw texel data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        ((y * self.size + x) * self.channels) as usize
    }

    /// Reads channel `c` of texel `(x, y)`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32, c: u32) -> f32 {
        self.data[self.offset(x, y) + c as usize]
    }

    /// Writes channel `c` of texel `(x, y)`.
    pub fn set(&mut self, x: u32, y: u32, c: u32, value: f32) {
        let offset = self.offset(x, y) + c as usize;
        self.data[offset] = value;
    }

    /// All channels of texel `(x, y)`.
    #[must_use]
    pub fn texel(&self, x: u32, y: u32) -> &[f32] {
        let offset = self.offset(x, y);
        &self.data[offset..offset + self.channels as usize]
    }

    /// Writes all channels of texel `(x, y)`.
    pub fn set_texel(&mut self, x: u32, y: u32, values: &[f32]) {
        let offset = self.offset(x, y);
        let n = values.len().min(self.channels as usize);
        self.data[offset..offset + n].copy_from_slice(&values[..n]);
    }

    /// Sets every channel of every texel.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Bilinear sample of channel `c` at fractional texel coordinates,
    /// clamped to the buffer edges.
    #[must_use]
    pub fn sample_bilinear(&self, fx: f32, fy: f32, c: u32) -> f32 {
        let max = (self.size - 1) as f32;
        let fx = fx.clamp(0.0, max);
        let fy = fy.clamp(0.0, max);
        let x0 = fx.floor() as u32;
        let y0 = fy.floor() as u32;
        let x1 = (x0 + 1).min(self.size - 1);
        let y1 = (y0 + 1).min(self.size - 1);
        let tx = fx - x0 as f32;
        let ty = fy - y0 as f32;

        let top = self.get(x0, y0, c) * (1.0 - tx) + self.get(x1, y0, c) * tx;
        let bottom = self.get(x0, y1, c) * (1.0 - tx) + self.get(x1, y1, c) * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

/// Returned by [`TileStorage::allocate`] when every slot is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tile storage full ({capacity} slots bound)")]
pub struct StorageFull {
    /// Capacity of the full storage
    pub capacity: usize,
}

/// Free/bound bookkeeping.
#[derive(Debug)]
struct SlotTable {
    /// Free slots, popped from the back (lowest index first)
    free: Vec<SlotId>,
    /// Bound flag per slot
    bound: Vec<bool>,
}

/// Fixed pool of interchangeable tile slots.
#[derive(Debug)]
pub struct TileStorage {
    /// Edge length of every slot in texels
    tile_size: u32,
    /// Texel format of every slot
    format: TileFormat,
    /// Slot contents
    slots: Vec<RwLock<TileBuffer>>,
    /// Which slots are free
    table: Mutex<SlotTable>,
}

impl TileStorage {
    /// Creates a storage with `capacity` slots of `tile_size x tile_size` texels.
    #[must_use]
    pub fn new(tile_size: u32, format: TileFormat, capacity: usize) -> Self {
        let channels = format.channels();
        let slots = (0..capacity)
            .map(|_| RwLock::new(TileBuffer::new(tile_size, channels)))
            .collect();
        let free = (0..capacity as u32).rev().map(SlotId::new).collect();

        let storage = Self {
            tile_size,
            format,
            slots,
            table: Mutex::new(SlotTable {
                free,
                bound: vec![false; capacity],
            }),
        };
        info!(
            "Created tile storage: {} slots of {}x{} {:?} ({} KiB)",
            capacity,
            tile_size,
            tile_size,
            format,
            storage.memory_bytes() / 1024
        );
        storage
    }

    /// Edge length of each slot in texels.
    #[must_use]
    pub const fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Texel format of each slot.
    #[must_use]
    pub const fn format(&self) -> TileFormat {
        self.format
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently bound to tiles.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    /// Number of free slots.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.table.lock().free.len()
    }

    /// Bytes of texel memory held by the pool.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.capacity() * self.format.bytes_per_slot(self.tile_size)
    }

    /// Takes a free slot. Fails without side effects when none remain.
    pub fn allocate(&self) -> Result<SlotId, StorageFull> {
        let mut table = self.table.lock();
        let slot = table.free.pop().ok_or(StorageFull {
            capacity: self.slots.len(),
        })?;
        table.bound[slot.index()] = true;
        Ok(slot)
    }

    /// Returns a bound slot to the free set.
    ///
    /// The caller guarantees no live tile still refers to `slot`.
    pub fn release(&self, slot: SlotId) -> TileResult<()> {
        let mut table = self.table.lock();
        match table.bound.get_mut(slot.index()) {
            Some(bound) if *bound => {
                *bound = false;
                table.free.push(slot);
                Ok(())
            },
            _ => {
                warn!("Release of unbound storage slot {}", slot);
                Err(TileError::SlotNotBound { slot })
            },
        }
    }

    /// Returns true if `slot` is currently bound.
    #[must_use]
    pub fn is_bound(&self, slot: SlotId) -> bool {
        self.table
            .lock()
            .bound
            .get(slot.index())
            .copied()
            .unwrap_or(false)
    }

    /// Shared access to a slot's texels.
    pub fn read(&self, slot: SlotId) -> RwLockReadGuard<'_, TileBuffer> {
        self.slots[slot.index()].read()
    }

    /// Exclusive access to a slot's texels.
    pub fn write(&self, slot: SlotId) -> RwLockWriteGuard<'_, TileBuffer> {
        self.slots[slot.index()].write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_channels() {
        assert_eq!(TileFormat::R32F.channels(), 1);
        assert_eq!(TileFormat::Rgb32F.channels(), 3);
        assert_eq!(TileFormat::Rgba32F.bytes_per_texel(), 16);
    }

    #[test]
    fn test_allocate_until_full() {
        let storage = TileStorage::new(4, TileFormat::R32F, 2);
        let a = storage.allocate().expect("first slot");
        let b = storage.allocate().expect("second slot");
        assert_ne!(a, b);
        assert_eq!(a, SlotId::new(0));
        assert_eq!(storage.bound_count(), 2);

        let err = storage.allocate().expect_err("storage is full");
        assert_eq!(err.capacity, 2);
        // Failure leaves the pool untouched
        assert_eq!(storage.bound_count(), 2);
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let storage = TileStorage::new(4, TileFormat::R32F, 1);
        let slot = storage.allocate().expect("slot");
        assert!(storage.is_bound(slot));
        storage.release(slot).expect("bound slot releases");
        assert!(!storage.is_bound(slot));
        assert_eq!(storage.allocate().expect("slot again"), slot);
    }

    #[test]
    fn test_double_release_is_rejected() {
        let storage = TileStorage::new(4, TileFormat::R32F, 2);
        let slot = storage.allocate().expect("slot");
        storage.release(slot).expect("first release");
        assert!(matches!(
            storage.release(slot),
            Err(TileError::SlotNotBound { .. })
        ));
        assert_eq!(storage.free_count(), 2);
    }

    #[test]
    fn test_slot_contents_survive_release() {
        let storage = TileStorage::new(2, TileFormat::Rg32F, 1);
        let slot = storage.allocate().expect("slot");
        storage.write(slot).set(1, 1, 1, 5.0);
        storage.release(slot).expect("release");
        assert_eq!(storage.read(slot).get(1, 1, 1), 5.0);
    }

    #[test]
    fn test_memory_bytes() {
        let storage = TileStorage::new(8, TileFormat::Rgba32F, 3);
        assert_eq!(storage.memory_bytes(), 3 * 64 * 16);
    }

    #[test]
    fn test_bilinear_sampling() {
        let mut buffer = TileBuffer::new(2, 1);
        buffer.set(0, 0, 0, 0.0);
        buffer.set(1, 0, 0, 1.0);
        buffer.set(0, 1, 0, 2.0);
        buffer.set(1, 1, 0, 3.0);
        assert!((buffer.sample_bilinear(0.5, 0.5, 0) - 1.5).abs() < 1e-6);
        assert!((buffer.sample_bilinear(-3.0, 0.0, 0) - 0.0).abs() < 1e-6);
        assert!((buffer.sample_bilinear(9.0, 9.0, 0) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_texel_access() {
        let mut buffer = TileBuffer::new(3, 3);
        buffer.set_texel(2, 1, &[0.1, 0.2, 0.3]);
        assert_eq!(buffer.texel(2, 1), &[0.1, 0.2, 0.3]);
        buffer.fill(1.0);
        assert!(buffer.data().iter().all(|&v| v == 1.0));
    }
}
