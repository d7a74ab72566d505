//! Memory that channels point at.
//!
//! [`TargetBuffer`] is a caller-owned, cache-line (or page) aligned block used
//! as a demo target for Flush+Reload and as eviction storage for Prime+Probe.
//! [`SymbolTarget`] resolves a function in a shared library and exposes the
//! cache lines its code occupies.
//!
//! Both implement [`MemoryRegion`]. An adapter that dereferences address
//! targets only accepts addresses inside a region it holds, so the memory
//! behind every channel outlives the channel.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::Range;
use std::ptr::NonNull;

use crate::adapters::helpers::readable_span;
use crate::channel::Target;
use crate::error::{EngineError, Result};

/// Cache line size assumed by every target and adapter.
pub const CACHE_LINE_SIZE: usize = 64;

/// Page size used for page-aligned buffers.
pub const PAGE_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// MemoryRegion
// ---------------------------------------------------------------------------

/// A block of readable memory that channels may point into.
///
/// # Safety
/// Every byte of [`span`](MemoryRegion::span) must stay mapped and readable
/// for as long as the value is alive.
pub unsafe trait MemoryRegion: Send + Sync + std::fmt::Debug {
    /// Address range `[start, end)` covered by the region.
    fn span(&self) -> Range<usize>;

    fn contains(&self, addr: usize) -> bool {
        self.span().contains(&addr)
    }
}

// ---------------------------------------------------------------------------
// TargetBuffer
// ---------------------------------------------------------------------------

/// Zeroed, aligned heap block whose lines can be monitored and touched.
///
/// The block is only ever read after allocation, so sharing it across
/// threads is sound.
pub struct TargetBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is never written after `alloc_zeroed`; concurrent reads
// of plain bytes are sound.
unsafe impl Send for TargetBuffer {}
unsafe impl Sync for TargetBuffer {}

impl TargetBuffer {
    /// Allocate `lines` cache lines, aligned to [`CACHE_LINE_SIZE`].
    pub fn new(lines: usize) -> Result<Self> {
        Self::with_alignment(lines.saturating_mul(CACHE_LINE_SIZE), CACHE_LINE_SIZE)
    }

    /// Allocate `bytes` rounded up to whole pages, aligned to [`PAGE_SIZE`].
    pub fn page_aligned(bytes: usize) -> Result<Self> {
        let pages = bytes.div_ceil(PAGE_SIZE).max(1);
        Self::with_alignment(pages.saturating_mul(PAGE_SIZE), PAGE_SIZE)
    }

    fn with_alignment(bytes: usize, align: usize) -> Result<Self> {
        let failure = EngineError::AllocationFailure {
            samples: bytes / CACHE_LINE_SIZE,
            channels: 1,
        };
        if bytes == 0 {
            return Err(failure);
        }
        let layout = Layout::from_size_align(bytes, align).map_err(|_| failure)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(EngineError::AllocationFailure {
            samples: bytes / CACHE_LINE_SIZE,
            channels: 1,
        })?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn lines(&self) -> usize {
        self.layout.size() / CACHE_LINE_SIZE
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Address of byte `offset`. Panics if out of bounds.
    pub fn addr_of(&self, offset: usize) -> usize {
        assert!(offset < self.len(), "offset {offset} outside {} byte buffer", self.len());
        self.ptr.as_ptr() as usize + offset
    }

    /// Address of cache line `line`.
    pub fn line_addr(&self, line: usize) -> usize {
        self.addr_of(line * CACHE_LINE_SIZE)
    }

    /// One address target per line.
    pub fn line_targets(&self) -> Vec<Target> {
        (0..self.lines())
            .map(|line| Target::Address(self.line_addr(line)))
            .collect()
    }

    /// Volatile read of byte `offset`, pulling its line into the cache.
    pub fn touch(&self, offset: usize) -> u8 {
        let addr = self.addr_of(offset) as *const u8;
        // SAFETY: addr_of bounds-checked the offset.
        unsafe { std::ptr::read_volatile(addr) }
    }
}

// SAFETY: the allocation lives until `drop` and is never made unreadable.
unsafe impl MemoryRegion for TargetBuffer {
    fn span(&self) -> Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.layout.size()
    }
}

impl Drop for TargetBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for TargetBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetBuffer")
            .field("addr", &self.ptr)
            .field("bytes", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SymbolTarget
// ---------------------------------------------------------------------------

/// A function resolved from a shared library. The library stays loaded for
/// as long as this value lives, so its code lines stay mapped.
pub struct SymbolTarget {
    _library: libloading::Library,
    library_name: String,
    symbol: String,
    addr: usize,
    span: Range<usize>,
}

impl SymbolTarget {
    /// Load `library` and look up `symbol`.
    pub fn resolve(library: &str, symbol: &str) -> Result<Self> {
        // SAFETY: loading a library runs its initializers; the caller chose it.
        let lib = unsafe { libloading::Library::new(library) }.map_err(|e| {
            EngineError::AdapterInitFailure {
                adapter: "symbol target".into(),
                reason: format!("failed to load {library}: {e}"),
            }
        })?;

        let addr = {
            // SAFETY: the symbol is only used as an address, never called.
            let sym: libloading::Symbol<'_, *const u8> = unsafe { lib.get(symbol.as_bytes()) }
                .map_err(|e| EngineError::AdapterInitFailure {
                    adapter: "symbol target".into(),
                    reason: format!("failed to find {symbol} in {library}: {e}"),
                })?;
            *sym as usize
        };

        // Without a readable mapping to go by, only the symbol's own line is
        // known to be loaded code.
        let span = readable_span(addr).unwrap_or_else(|| {
            let line = addr & !(CACHE_LINE_SIZE - 1);
            line..line + CACHE_LINE_SIZE
        });

        log::info!(
            "resolved {symbol} in {library} at {addr:#x} ({} readable bytes from there)",
            span.end - addr
        );
        Ok(Self {
            _library: lib,
            library_name: library.to_string(),
            symbol: symbol.to_string(),
            addr,
            span,
        })
    }

    /// Parse a `LIBRARY:SYMBOL` spec, e.g. `libcrypto.so:RSA_private_decrypt`.
    pub fn parse_spec(spec: &str) -> Result<(String, String)> {
        match spec.rsplit_once(':') {
            Some((lib, sym)) if !lib.is_empty() && !sym.is_empty() => {
                Ok((lib.to_string(), sym.to_string()))
            }
            _ => Err(EngineError::Config(format!(
                "symbol spec '{spec}' must look like LIBRARY:SYMBOL"
            ))),
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn library(&self) -> &str {
        &self.library_name
    }

    /// `lines` consecutive cache lines starting at the symbol address. Lines
    /// past the end of the library mapping are rejected at registration.
    pub fn line_targets(&self, lines: usize) -> Vec<Target> {
        (0..lines)
            .map(|i| Target::Address(self.addr + i * CACHE_LINE_SIZE))
            .collect()
    }

    /// Volatile read of line `line` past the symbol. `None` outside the
    /// readable mapping.
    pub fn touch(&self, line: usize) -> Option<u8> {
        let addr = line
            .checked_mul(CACHE_LINE_SIZE)
            .and_then(|offset| self.addr.checked_add(offset))
            .filter(|addr| self.span.contains(addr))?;
        // SAFETY: addr lies in a readable mapping of the library, which stays
        // loaded while `self` lives.
        Some(unsafe { std::ptr::read_volatile(addr as *const u8) })
    }
}

// SAFETY: `span` is a readable mapping of the library (or the symbol's own
// line of code), and `_library` keeps it loaded until drop.
unsafe impl MemoryRegion for SymbolTarget {
    fn span(&self) -> Range<usize> {
        self.span.clone()
    }
}

impl std::fmt::Debug for SymbolTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTarget")
            .field("library", &self.library_name)
            .field("symbol", &self.symbol)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("readable_until", &format_args!("{:#x}", self.span.end))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_line_aligned() {
        let buf = TargetBuffer::new(4).unwrap();
        assert_eq!(buf.len(), 4 * CACHE_LINE_SIZE);
        assert_eq!(buf.lines(), 4);
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn page_aligned_rounds_up() {
        let buf = TargetBuffer::page_aligned(5000).unwrap();
        assert_eq!(buf.len(), 2 * PAGE_SIZE);
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn line_targets_are_consecutive_lines() {
        let buf = TargetBuffer::new(3).unwrap();
        let base = buf.as_ptr() as usize;
        assert_eq!(
            buf.line_targets(),
            vec![
                Target::Address(base),
                Target::Address(base + 64),
                Target::Address(base + 128),
            ]
        );
    }

    #[test]
    fn zero_lines_is_allocation_failure() {
        assert!(matches!(
            TargetBuffer::new(0),
            Err(EngineError::AllocationFailure { .. })
        ));
    }

    #[test]
    fn touch_reads_zero() {
        let buf = TargetBuffer::new(1).unwrap();
        assert_eq!(buf.touch(63), 0);
    }

    #[test]
    #[should_panic]
    fn touch_out_of_bounds_panics() {
        let buf = TargetBuffer::new(1).unwrap();
        buf.touch(64);
    }

    #[test]
    fn buffer_region_covers_exactly_its_lines() {
        let buf = TargetBuffer::new(2).unwrap();
        let base = buf.as_ptr() as usize;
        assert_eq!(buf.span(), base..base + 128);
        assert!(buf.contains(buf.line_addr(1)));
        assert!(!buf.contains(base + 128));
        assert!(!buf.contains(base.wrapping_sub(1)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn libc_symbol_is_readable_code() {
        let Ok(target) = SymbolTarget::resolve("libc.so.6", "memcpy") else {
            return;
        };
        assert!(target.contains(target.addr()));
        assert!(target.touch(0).is_some());
        assert!(target.touch(usize::MAX).is_none());
    }

    #[test]
    fn symbol_spec_parsing() {
        assert_eq!(
            SymbolTarget::parse_spec("libcrypto.so:RSA_private_decrypt").unwrap(),
            ("libcrypto.so".to_string(), "RSA_private_decrypt".to_string())
        );
        assert!(SymbolTarget::parse_spec("libcrypto.so").is_err());
        assert!(SymbolTarget::parse_spec(":sym").is_err());
    }

    #[test]
    fn missing_library_is_init_failure() {
        let err = SymbolTarget::resolve("libdefinitely-not-here.so.99", "nothing").unwrap_err();
        assert!(matches!(err, EngineError::AdapterInitFailure { .. }));
    }
}
