// ============================================================================
// src/io/audio/hda/bus.rs - Register / DMA Bus Abstraction
// ============================================================================
//!
//! コントローラのレジスタ空間と DMA メモリへのアクセス層。
//!
//! - `HdaBus` - レジスタ幅に一致したアクセスと DMA バッファ確保
//! - `DmaBuffer` - 128 バイト境界の共有 DMA メモリ
//! - `MmioBus` - マップ済み MMIO 領域への volatile アクセス
//! - `InterruptLine` - ISR から割り込みスレッドへの通知線

use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::{NonNull, read_volatile, write_volatile};
use core::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use spin::Mutex;

use crate::error::{HdaError, HdaResult};

use super::regs::DMA_ALIGN;

// ============================================================================
// Bus Trait
// ============================================================================

/// Access to one controller's register file and DMA memory
///
/// Reads and writes are width-matched: the controller never reads a 16-bit
/// register with a 32-bit access.
pub trait HdaBus: Send + Sync {
    fn read8(&self, offset: u32) -> u8;
    fn read16(&self, offset: u32) -> u16;
    fn read32(&self, offset: u32) -> u32;
    fn write8(&self, offset: u32, value: u8);
    fn write16(&self, offset: u32, value: u16);
    fn write32(&self, offset: u32, value: u32);

    /// Allocate zeroed, 128-byte aligned DMA memory
    fn alloc_dma(&self, len: usize) -> HdaResult<DmaBuffer> {
        DmaBuffer::alloc(len)
    }

    /// Route the controller interrupt to `line`
    fn attach_interrupt(&self, line: InterruptLine);

    /// Short bounded delay used while polling reset handshakes
    fn delay_us(&self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }
}

// ============================================================================
// DMA Buffer
// ============================================================================

struct DmaAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is owned exclusively by this struct and every access
// goes through volatile reads/writes of naturally aligned words.
unsafe impl Send for DmaAlloc {}
// SAFETY: see above; concurrent volatile accesses to distinct words are fine
// and the engines serialize accesses to the same ring under their own locks.
unsafe impl Sync for DmaAlloc {}

impl Drop for DmaAlloc {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come from the alloc_zeroed call in DmaBuffer::alloc.
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Shared DMA memory region, freed when the last clone drops
#[derive(Clone)]
pub struct DmaBuffer {
    inner: Arc<DmaAlloc>,
}

impl DmaBuffer {
    /// Allocate a zeroed buffer aligned to 128 bytes
    pub fn alloc(len: usize) -> HdaResult<Self> {
        if len == 0 {
            return Err(HdaError::InvalidArgument);
        }
        let layout = Layout::from_size_align(len, DMA_ALIGN).map_err(|_| HdaError::AllocFailed)?;

        // SAFETY: layout has a non-zero size and a power-of-two alignment.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(HdaError::AllocFailed)?;

        Ok(Self {
            inner: Arc::new(DmaAlloc { ptr, layout }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bus address of the buffer (identity mapped on the host)
    pub fn phys_addr(&self) -> u64 {
        self.inner.ptr.as_ptr() as u64
    }

    fn word_ptr<T>(&self, index: usize) -> *mut T {
        let size = core::mem::size_of::<T>();
        assert!((index + 1) * size <= self.len(), "DMA access out of bounds");
        // SAFETY: bounds checked above; the base is 128-byte aligned so every
        // index-scaled offset is naturally aligned for T.
        unsafe { self.inner.ptr.as_ptr().add(index * size) as *mut T }
    }

    pub fn read_u32(&self, index: usize) -> u32 {
        // SAFETY: word_ptr returns an in-bounds, aligned pointer.
        u32::from_le(unsafe { read_volatile(self.word_ptr::<u32>(index)) })
    }

    pub fn write_u32(&self, index: usize, value: u32) {
        // SAFETY: word_ptr returns an in-bounds, aligned pointer.
        unsafe { write_volatile(self.word_ptr::<u32>(index), value.to_le()) }
    }

    /// Raw little-endian 64-bit entry; the caller byte-order corrects
    pub fn read_u64(&self, index: usize) -> u64 {
        // SAFETY: word_ptr returns an in-bounds, aligned pointer.
        unsafe { read_volatile(self.word_ptr::<u64>(index)) }
    }

    pub fn write_u64(&self, index: usize, value: u64) {
        // SAFETY: word_ptr returns an in-bounds, aligned pointer.
        unsafe { write_volatile(self.word_ptr::<u64>(index), value.to_le()) }
    }

    /// Whether two handles refer to the same allocation
    pub fn same_as(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "DmaBuffer({:#x}, {} bytes)", self.phys_addr(), self.len())
    }
}

// ============================================================================
// MMIO Bus
// ============================================================================

/// Volatile access to a mapped controller BAR
pub struct MmioBus {
    base: usize,
    irq: Mutex<Option<InterruptLine>>,
}

impl MmioBus {
    /// # Safety
    /// `base` must point to the controller's mapped register space and stay
    /// mapped for the lifetime of the bus.
    pub unsafe fn new(base: usize) -> Self {
        Self {
            base,
            irq: Mutex::new(None),
        }
    }

    /// Line the platform ISR should raise
    pub fn interrupt_line(&self) -> Option<InterruptLine> {
        self.irq.lock().clone()
    }

    #[inline]
    fn reg<T>(&self, offset: u32) -> *mut T {
        (self.base + offset as usize) as *mut T
    }
}

impl HdaBus for MmioBus {
    #[inline]
    fn read8(&self, offset: u32) -> u8 {
        // SAFETY: base is a valid register mapping per MmioBus::new.
        unsafe { read_volatile(self.reg(offset)) }
    }

    #[inline]
    fn read16(&self, offset: u32) -> u16 {
        // SAFETY: base is a valid register mapping per MmioBus::new.
        unsafe { read_volatile(self.reg(offset)) }
    }

    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: base is a valid register mapping per MmioBus::new.
        unsafe { read_volatile(self.reg(offset)) }
    }

    #[inline]
    fn write8(&self, offset: u32, value: u8) {
        // SAFETY: base is a valid register mapping per MmioBus::new.
        unsafe { write_volatile(self.reg(offset), value) }
    }

    #[inline]
    fn write16(&self, offset: u32, value: u16) {
        // SAFETY: base is a valid register mapping per MmioBus::new.
        unsafe { write_volatile(self.reg(offset), value) }
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        // SAFETY: base is a valid register mapping per MmioBus::new.
        unsafe { write_volatile(self.reg(offset), value) }
    }

    fn attach_interrupt(&self, line: InterruptLine) {
        *self.irq.lock() = Some(line);
    }
}

// ============================================================================
// Interrupt Line
// ============================================================================

/// What woke the interrupt thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSignal {
    /// Hardware interrupt
    Interrupt,
    /// Software request for another processing pass
    Wake,
    /// Interrupt thread must exit
    Exit,
}

/// Sending half, raised by the ISR
#[derive(Clone, Debug)]
pub struct InterruptLine {
    tx: Sender<IrqSignal>,
}

impl InterruptLine {
    /// Create a line and the receiver the interrupt thread parks on
    pub fn new() -> (Self, Receiver<IrqSignal>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn raise(&self) {
        let _ = self.tx.send(IrqSignal::Interrupt);
    }

    pub fn wake(&self) {
        let _ = self.tx.send(IrqSignal::Wake);
    }

    pub(crate) fn exit(&self) {
        let _ = self.tx.send(IrqSignal::Exit);
    }
}
