//! Paged, read-only cache over target memory.
//!
//! Backs reads by fetching 256-byte pages from the target on demand.
//! Replacement is "accessed-this-round", not LRU — see `refresh_accessed`.

use std::collections::HashMap;

use crate::error::Result;

const PAGE_SIZE: usize = 256;

/// Something that can fetch a 256-byte page from the target.
///
/// Implemented by the monitor protocol (`m`/`M` commands); kept as a trait
/// so the cache has no dependency on the monitor or transport.
pub trait PageSource {
    fn fetch_page(&mut self, line_addr: u32) -> Result<[u8; PAGE_SIZE]>;
}

#[derive(Clone, Copy)]
struct CacheLine {
    address: u32,
    valid: bool,
    accessed: bool,
    data: [u8; PAGE_SIZE],
}

impl Default for CacheLine {
    fn default() -> Self {
        Self {
            address: 0,
            valid: false,
            accessed: false,
            data: [0; PAGE_SIZE],
        }
    }
}

/// A fixed-capacity paged cache over target memory.
pub struct MemoryCache {
    lines: Vec<CacheLine>,
    index: HashMap<u32, usize>,
}

impl MemoryCache {
    /// Default capacity: 512 lines of 256 bytes (128 KiB).
    pub const DEFAULT_LINES: usize = 512;

    #[must_use]
    pub fn new(num_lines: usize) -> Self {
        Self {
            lines: vec![CacheLine::default(); num_lines],
            index: HashMap::new(),
        }
    }

    /// Reads `target.len()` bytes starting at `addr`, paging in as needed.
    pub fn read(&mut self, source: &mut dyn PageSource, addr: u32, target: &mut [u8]) -> Result<()> {
        let mut line_addr = addr & !0xFF;
        let mut offset = (addr % PAGE_SIZE as u32) as usize;
        let mut written = 0;

        while written < target.len() {
            let n = (PAGE_SIZE - offset).min(target.len() - written);
            let idx = self.ensure_valid(source, line_addr)?;
            let line = &mut self.lines[idx];
            target[written..written + n].copy_from_slice(&line.data[offset..offset + n]);
            line.accessed = true;

            written += n;
            offset = 0;
            line_addr = line_addr.wrapping_add(PAGE_SIZE as u32);
        }
        Ok(())
    }

    /// Ensures the page at `line_addr` is valid and indexed, returning its slot.
    fn ensure_valid(&mut self, source: &mut dyn PageSource, line_addr: u32) -> Result<usize> {
        if let Some(&idx) = self.index.get(&line_addr) {
            return Ok(idx);
        }

        let slot = self
            .lines
            .iter()
            .position(|l| !l.valid)
            .or_else(|| self.lines.iter().position(|l| !l.accessed))
            .unwrap_or(0);

        let data = source.fetch_page(line_addr)?;
        // The replaced line may still be indexed under its old address.
        self.index.retain(|_, v| *v != slot);
        let line = &mut self.lines[slot];
        line.address = line_addr;
        line.valid = true;
        line.data = data;
        self.index.insert(line_addr, slot);
        Ok(slot)
    }

    /// Invalidates the entire cache: every event that plausibly mutates
    /// target memory (pause, breakpoint stop) calls this.
    pub fn invalidate(&mut self) {
        for line in &mut self.lines {
            *line = CacheLine::default();
        }
        self.index.clear();
    }

    /// Re-fetches lines touched since the last call, drops the rest.
    ///
    /// Called after a single-step completes, since memory may have changed
    /// under the step without a full invalidation being warranted.
    pub fn refresh_accessed(&mut self, source: &mut dyn PageSource) -> Result<()> {
        let touched: Vec<u32> = self
            .index
            .iter()
            .filter(|(_, &idx)| self.lines[idx].accessed)
            .map(|(&addr, _)| addr)
            .collect();
        let dropped: Vec<u32> = self
            .index
            .iter()
            .filter(|(_, &idx)| !self.lines[idx].accessed)
            .map(|(&addr, _)| addr)
            .collect();

        for addr in dropped {
            if let Some(idx) = self.index.remove(&addr) {
                self.lines[idx] = CacheLine::default();
            }
        }
        for addr in touched {
            let idx = self.index[&addr];
            let data = source.fetch_page(addr)?;
            self.lines[idx].data = data;
            self.lines[idx].accessed = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mock {
        memory: Vec<u8>,
        fetches: usize,
    }

    impl PageSource for Mock {
        fn fetch_page(&mut self, line_addr: u32) -> Result<[u8; PAGE_SIZE]> {
            self.fetches += 1;
            let mut page = [0u8; PAGE_SIZE];
            let start = line_addr as usize;
            page.copy_from_slice(&self.memory[start..start + PAGE_SIZE]);
            Ok(page)
        }
    }

    fn mock() -> Mock {
        let mut memory = vec![0u8; 384 * 1024];
        for (i, b) in memory.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        Mock { memory, fetches: 0 }
    }

    #[test]
    fn invalidate_resets_every_line() {
        let mut cache = MemoryCache::new(4);
        let mut src = mock();
        let mut buf = [0u8; 4];
        cache.read(&mut src, 0x1000, &mut buf).unwrap();
        cache.invalidate();
        for line in &cache.lines {
            assert!(!line.valid && !line.accessed && line.address == 0);
        }
        assert!(cache.index.is_empty());
    }

    #[test]
    fn read_spans_pages_and_marks_accessed() {
        let mut cache = MemoryCache::new(4);
        let mut src = mock();
        let mut buf = [0u8; 300]; // spans three 256-byte pages: 0x1000, 0x1100, 0x1200
        cache.read(&mut src, 0x10F0, &mut buf).unwrap();
        assert_eq!(buf.len(), 300);
        assert_eq!(&buf[..16], &src.memory[0x10F0..0x10F0 + 16]);
        assert_eq!(cache.index.len(), 3);
        assert!(cache.lines[cache.index[&0x1000]].accessed);
        assert!(cache.lines[cache.index[&0x1100]].accessed);
        assert!(cache.lines[cache.index[&0x1200]].accessed);
    }

    #[test]
    fn refresh_accessed_drops_untouched_and_refetches_touched() {
        let mut cache = MemoryCache::new(4);
        let mut src = mock();
        let mut buf = [0u8; 1];
        cache.read(&mut src, 0x2000, &mut buf).unwrap();
        cache.read(&mut src, 0x3000, &mut buf).unwrap();
        // Both lines are accessed this round; refresh re-fetches both and
        // clears their accessed bits rather than dropping either.
        cache.refresh_accessed(&mut src).unwrap();

        // Only 0x2000 is touched in the next round.
        cache.read(&mut src, 0x2000, &mut buf).unwrap();

        let before = src.fetches;
        cache.refresh_accessed(&mut src).unwrap();
        assert_eq!(src.fetches, before + 1); // only the accessed page refetched
        assert!(cache.index.contains_key(&0x2000));
        assert!(!cache.index.contains_key(&0x3000));
    }

    #[test]
    fn replacement_prefers_invalid_then_unaccessed_then_first() {
        let mut cache = MemoryCache::new(2);
        let mut src = mock();
        let mut buf = [0u8; 1];
        cache.read(&mut src, 0x0000, &mut buf).unwrap();
        cache.read(&mut src, 0x0100, &mut buf).unwrap();
        // Both lines valid & accessed; a third page must evict line 0.
        cache.read(&mut src, 0x0200, &mut buf).unwrap();
        assert!(cache.index.contains_key(&0x0200));
    }
}
