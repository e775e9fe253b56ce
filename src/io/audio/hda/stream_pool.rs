// ============================================================================
// src/io/audio/hda/stream_pool.rs - DMA Stream Pool & Tag Allocator
// ============================================================================
//!
//! ストリーム記述子の空きリストとタグ割り当て。
//!
//! - 空きリストは種別ごと (入力 / 出力 / 双方向) にストリームIDで整列
//! - タグ (1-15) は方向ごとのビットマップから最小番号を割り当て
//! - 方向別リストが空なら双方向リストから割り当て

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use crate::error::{HdaError, HdaResult};

use super::regs::MAX_STREAM_TAG;
use super::stream::{DmaStream, StreamType};

// ============================================================================
// Tag Allocator
// ============================================================================

/// Stream tag bitset; bit `n` set means tag `n` is free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagAllocator {
    free: u16,
}

impl TagAllocator {
    const ALL: u16 = ((1u32 << (MAX_STREAM_TAG as u32 + 1)) - 2) as u16;

    pub const fn new() -> Self {
        Self { free: Self::ALL }
    }

    /// Lowest free tag
    pub fn allocate(&mut self) -> Option<u8> {
        if self.free == 0 {
            return None;
        }
        let tag = self.free.trailing_zeros() as u8;
        self.free &= !(1 << tag);
        Some(tag)
    }

    pub fn release(&mut self, tag: u8) {
        debug_assert!(tag >= 1 && tag <= MAX_STREAM_TAG, "tag {} out of range", tag);
        debug_assert!(!self.is_free(tag), "tag {} released twice", tag);
        if tag >= 1 && tag <= MAX_STREAM_TAG {
            self.free |= 1 << tag;
        }
    }

    pub fn is_free(&self, tag: u8) -> bool {
        tag >= 1 && tag <= MAX_STREAM_TAG && self.free & (1 << tag) != 0
    }

    pub fn free_count(&self) -> u32 {
        self.free.count_ones()
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Stream Pool
// ============================================================================

struct PoolInner {
    input: BTreeMap<u16, Arc<DmaStream>>,
    output: BTreeMap<u16, Arc<DmaStream>>,
    bidir: BTreeMap<u16, Arc<DmaStream>>,
    input_tags: TagAllocator,
    output_tags: TagAllocator,
}

impl PoolInner {
    fn list_for(&mut self, hw_type: StreamType) -> Option<&mut BTreeMap<u16, Arc<DmaStream>>> {
        match hw_type {
            StreamType::Input => Some(&mut self.input),
            StreamType::Output => Some(&mut self.output),
            StreamType::Bidir => Some(&mut self.bidir),
            StreamType::Invalid => None,
        }
    }

    fn tags_for(&mut self, dir: StreamType) -> Option<&mut TagAllocator> {
        match dir {
            StreamType::Input => Some(&mut self.input_tags),
            StreamType::Output => Some(&mut self.output_tags),
            _ => None,
        }
    }

    fn put_back(&mut self, stream: Arc<DmaStream>) {
        if let Some(list) = self.list_for(stream.hw_type()) {
            list.insert(stream.id(), stream);
        }
    }
}

/// Free lists of every stream descriptor on one controller
pub struct StreamPool {
    inner: Mutex<PoolInner>,
    streams: Vec<Arc<DmaStream>>,
}

impl StreamPool {
    pub fn new(streams: Vec<Arc<DmaStream>>) -> Self {
        let mut inner = PoolInner {
            input: BTreeMap::new(),
            output: BTreeMap::new(),
            bidir: BTreeMap::new(),
            input_tags: TagAllocator::new(),
            output_tags: TagAllocator::new(),
        };
        for stream in &streams {
            inner.put_back(Arc::clone(stream));
        }
        Self {
            inner: Mutex::new(inner),
            streams,
        }
    }

    /// Hand out a stream for one direction with a freshly allocated tag
    ///
    /// Falls back to the bidirectional list when the direction's list is empty.
    pub fn allocate_stream(&self, input: bool) -> HdaResult<Arc<DmaStream>> {
        let dir = StreamType::from_input(input);
        let mut inner = self.inner.lock();

        let stream = {
            let primary = if input { &mut inner.input } else { &mut inner.output };
            match primary.pop_first() {
                Some((_, s)) => s,
                None => match inner.bidir.pop_first() {
                    Some((_, s)) => s,
                    None => {
                        debug!("[HDA] No free {:?} stream", dir);
                        return Err(HdaError::ResourceExhausted);
                    }
                },
            }
        };

        let Some(tag) = inner.tags_for(dir).and_then(TagAllocator::allocate) else {
            debug!("[HDA] No free {:?} stream tag", dir);
            inner.put_back(stream);
            return Err(HdaError::ResourceExhausted);
        };

        if let Err(e) = stream.configure(dir, tag) {
            warn!("[HDA] Failed to configure stream {}: {}", stream.id(), e);
            if let Some(tags) = inner.tags_for(dir) {
                tags.release(tag);
            }
            inner.put_back(stream);
            return Err(e);
        }

        debug!("[HDA] Allocated stream {} ({:?}) tag {}", stream.id(), dir, tag);
        Ok(stream)
    }

    /// Give a stream back; its tag becomes immediately reusable
    pub fn return_stream(&self, stream: Arc<DmaStream>) {
        let dir = stream.configured_type();
        debug_assert!(
            matches!(dir, StreamType::Input | StreamType::Output),
            "returning stream {} of type {:?}",
            stream.id(),
            dir
        );

        let mut inner = self.inner.lock();
        let tag = stream.tag();
        if let Some(tags) = inner.tags_for(dir) {
            tags.release(tag);
        }
        if let Err(e) = stream.configure(StreamType::Invalid, 0) {
            warn!("[HDA] Failed to idle stream {}: {}", stream.id(), e);
        }
        debug!("[HDA] Returned stream {} tag {}", stream.id(), tag);
        inner.put_back(stream);
    }

    /// Free streams of one hardware type
    pub fn free_count(&self, hw_type: StreamType) -> usize {
        let mut inner = self.inner.lock();
        inner.list_for(hw_type).map_or(0, |l| l.len())
    }

    pub fn total(&self) -> usize {
        self.streams.len()
    }

    pub fn by_id(&self, id: u16) -> Option<&Arc<DmaStream>> {
        self.streams.iter().find(|s| s.id() == id)
    }

    pub fn by_index(&self, index: u32) -> Option<&Arc<DmaStream>> {
        self.streams.get(index as usize)
    }

    /// Every descriptor, in hardware index order
    pub fn streams(&self) -> &[Arc<DmaStream>] {
        &self.streams
    }

    /// Stop every descriptor; used at controller teardown
    pub fn stop_all(&self) {
        for stream in &self.streams {
            stream.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::audio::hda::bus::HdaBus;
    use crate::test::sim_hda::SimHda;

    fn pool(inputs: u32, outputs: u32, bidir: u32) -> StreamPool {
        let sim = SimHda::builder().build();
        let bus: Arc<dyn HdaBus> = sim;
        let lock = Arc::new(Mutex::new(()));
        let mut streams = Vec::new();
        let mut index = 0;
        for (count, ty) in [
            (inputs, StreamType::Input),
            (outputs, StreamType::Output),
            (bidir, StreamType::Bidir),
        ] {
            for _ in 0..count {
                streams.push(Arc::new(DmaStream::new(bus.clone(), index, ty, lock.clone())));
                index += 1;
            }
        }
        StreamPool::new(streams)
    }

    #[test]
    fn test_tag_allocator_lowest_first() {
        let mut tags = TagAllocator::new();
        assert_eq!(tags.free_count(), 15);
        assert_eq!(tags.allocate(), Some(1));
        assert_eq!(tags.allocate(), Some(2));
        assert_eq!(tags.allocate(), Some(3));
        tags.release(2);
        assert!(tags.is_free(2));
        assert_eq!(tags.allocate(), Some(2));
        assert_eq!(tags.allocate(), Some(4));
    }

    #[test]
    fn test_tag_allocator_exhaustion() {
        let mut tags = TagAllocator::new();
        let all: Vec<u8> = core::iter::from_fn(|| tags.allocate()).collect();
        assert_eq!(all, (1..=15).collect::<Vec<u8>>());
        assert_eq!(tags.allocate(), None);
        assert!(!tags.is_free(0));
    }

    #[test]
    fn test_allocate_by_direction() {
        let pool = pool(2, 2, 0);
        let a = pool.allocate_stream(true).unwrap();
        let b = pool.allocate_stream(false).unwrap();
        assert_eq!(a.hw_type(), StreamType::Input);
        assert_eq!(a.id(), 1);
        assert_eq!(b.hw_type(), StreamType::Output);
        assert_eq!(b.id(), 3);
        // Tags are per direction
        assert_eq!(a.tag(), 1);
        assert_eq!(b.tag(), 1);
    }

    #[test]
    fn test_fallback_to_bidir() {
        let pool = pool(0, 1, 1);
        let s = pool.allocate_stream(true).unwrap();
        assert_eq!(s.hw_type(), StreamType::Bidir);
        assert_eq!(s.configured_type(), StreamType::Input);
        assert_eq!(pool.allocate_stream(true).unwrap_err(), HdaError::ResourceExhausted);

        // Output list still serves outputs
        let o = pool.allocate_stream(false).unwrap();
        assert_eq!(o.hw_type(), StreamType::Output);
    }

    #[test]
    fn test_tags_unique_while_held() {
        let pool = pool(0, 15, 2);
        let held: Vec<_> = (0..15).map(|_| pool.allocate_stream(false).unwrap()).collect();
        let mut tags: Vec<u8> = held.iter().map(|s| s.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 15);

        // Bidir stream is free but every output tag is taken
        assert_eq!(pool.allocate_stream(false).unwrap_err(), HdaError::ResourceExhausted);
        assert_eq!(pool.free_count(StreamType::Bidir), 2);

        let released_tag = held[4].tag();
        pool.return_stream(Arc::clone(&held[4]));
        let again = pool.allocate_stream(false).unwrap();
        assert_eq!(again.tag(), released_tag);
    }

    #[test]
    fn test_return_resets_stream() {
        let pool = pool(1, 1, 0);
        let s = pool.allocate_stream(false).unwrap();
        assert_eq!(pool.free_count(StreamType::Output), 0);
        pool.return_stream(s.clone());
        assert_eq!(s.configured_type(), StreamType::Invalid);
        assert_eq!(s.tag(), 0);
        assert_eq!(pool.free_count(StreamType::Output), 1);
        assert!(pool.by_id(s.id()).is_some());
    }

    #[test]
    fn test_empty_pool() {
        let pool = pool(0, 0, 0);
        assert_eq!(pool.allocate_stream(true).unwrap_err(), HdaError::ResourceExhausted);
        assert_eq!(pool.total(), 0);
    }
}
