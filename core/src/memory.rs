/// Emulated memory space selector.
///
/// The two data spaces, the program space, and — encoded but never
/// constructed — the reserved selector (space code 3), which decodes to
/// `None` and causes accesses to be silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemArea {
    X = 0,
    Y = 1,
    P = 2,
}

impl MemArea {
    /// Decode a 2-bit space code. Code 3 is reserved and defines no
    /// transfer.
    pub fn from_space_code(code: u32) -> Option<MemArea> {
        match code & 3 {
            0 => Some(MemArea::X),
            1 => Some(MemArea::Y),
            2 => Some(MemArea::P),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// First word of the internal I/O window in the data spaces.
pub const PERIPH_FIRST: u32 = 0xff_ff80;
/// All emulated addresses are 24 bit.
pub const ADDR_MASK: u32 = 0xff_ffff;

/// Peripheral classification: an enumerated area tag plus a pure
/// function of (tag, address) — no dispatch over peripheral subclasses,
/// so the predicate can also be evaluated at compile time for statically
/// known operands.
#[inline]
pub fn is_peripheral(area: MemArea, addr: u32) -> bool {
    area != MemArea::P && addr >= PERIPH_FIRST && addr <= ADDR_MASK
}

/// Range variant: true when any word of `[first, first + count)` falls
/// into the peripheral window.
#[inline]
pub fn is_peripheral_range(area: MemArea, first: u32, count: u32) -> bool {
    if area == MemArea::P || count == 0 {
        return false;
    }
    is_peripheral(area, first) || is_peripheral(area, first.wrapping_add(count - 1))
}

/// Word-addressed backing arrays for the three memory areas.
///
/// Data-space addresses at or above the bridge boundary alias into
/// program memory ("bridged" region); the arrays are boxed slices so the
/// base pointers handed to generated code stay stable for the lifetime
/// of the instance.
pub struct Memory {
    x: Box<[u32]>,
    y: Box<[u32]>,
    p: Box<[u32]>,
    bridged_start: u32,
}

impl Memory {
    /// Allocate all three areas with `size` words each. `bridged_start`
    /// at or above `size` disables the bridged region.
    pub fn new(size: usize, bridged_start: u32) -> Self {
        Self {
            x: vec![0; size].into_boxed_slice(),
            y: vec![0; size].into_boxed_slice(),
            p: vec![0; size].into_boxed_slice(),
            bridged_start,
        }
    }

    pub fn size(&self) -> usize {
        self.p.len()
    }

    pub fn bridged_start(&self) -> u32 {
        self.bridged_start
    }

    /// Resolve the area a word access actually lands in, applying the
    /// bridged-region redirection to program memory.
    #[inline]
    pub fn effective_area(&self, area: MemArea, addr: u32) -> MemArea {
        if area != MemArea::P && addr >= self.bridged_start {
            MemArea::P
        } else {
            area
        }
    }

    /// True when `[first, first + count)` straddles the bridge boundary
    /// (so a bulk access cannot use a single backing array).
    pub fn bridged_overlap(&self, area: MemArea, first: u32, count: u32) -> bool {
        if area == MemArea::P {
            return false;
        }
        let end = first.wrapping_add(count);
        !(end <= self.bridged_start || first >= self.bridged_start)
    }

    #[inline]
    pub fn get(&self, area: MemArea, addr: u32) -> u32 {
        let addr = addr & ADDR_MASK;
        self.area_slice(self.effective_area(area, addr))[addr as usize]
    }

    #[inline]
    pub fn set(&mut self, area: MemArea, addr: u32, value: u32) {
        let addr = addr & ADDR_MASK;
        let area = self.effective_area(area, addr);
        self.area_slice_mut(area)[addr as usize] = value & ADDR_MASK;
    }

    pub fn area_slice(&self, area: MemArea) -> &[u32] {
        match area {
            MemArea::X => &self.x,
            MemArea::Y => &self.y,
            MemArea::P => &self.p,
        }
    }

    pub fn area_slice_mut(&mut self, area: MemArea) -> &mut [u32] {
        match area {
            MemArea::X => &mut self.x,
            MemArea::Y => &mut self.y,
            MemArea::P => &mut self.p,
        }
    }

    /// Base pointer of an area's backing array. Stable until drop.
    pub fn area_base_ptr(&self, area: MemArea) -> *const u32 {
        self.area_slice(area).as_ptr()
    }

    /// Host pointer to one word, with bridged redirection applied.
    pub fn word_ptr(&mut self, area: MemArea, addr: u32) -> *mut u32 {
        let addr = addr & ADDR_MASK;
        let area = self.effective_area(area, addr);
        unsafe { self.area_slice_mut(area).as_mut_ptr().add(addr as usize) }
    }
}

impl Memory {
    /// Raw word copy between (possibly identical) areas. Callers have
    /// already ruled out peripheral and bridge-straddling ranges.
    pub fn copy_words(
        &mut self,
        dst_area: MemArea,
        dst_addr: u32,
        src_area: MemArea,
        src_addr: u32,
        count: u32,
    ) {
        let count = count as usize;
        assert!(dst_addr as usize + count <= self.size());
        assert!(src_addr as usize + count <= self.size());
        let src = self.word_ptr(src_area, src_addr) as *const u32;
        let dst = self.word_ptr(dst_area, dst_addr);
        // SAFETY: both ranges are in-bounds (asserted above); `copy`
        // tolerates the overlapping same-area case.
        unsafe { std::ptr::copy(src, dst, count) };
    }
}

/// Word read with peripheral routing: the slow-path face of the memory
/// bridge, also used directly by the DMA engine.
pub fn read_word(mem: &Memory, periph: &mut dyn Peripherals, area: MemArea, addr: u32) -> u32 {
    if is_peripheral(area, addr) {
        periph.read(area, addr)
    } else {
        mem.get(area, addr)
    }
}

/// Word write with peripheral routing.
pub fn write_word(
    mem: &mut Memory,
    periph: &mut dyn Peripherals,
    area: MemArea,
    addr: u32,
    value: u32,
) {
    if is_peripheral(area, addr) {
        periph.write(area, addr, value);
    } else {
        mem.set(area, addr, value);
    }
}

/// Bulk copy with both addresses advancing.
///
/// Falls back to word-by-word routing when the destination is program
/// memory, either range touches the peripheral window, or either range
/// straddles the bridge boundary; otherwise one raw copy.
pub fn bulk_copy(
    mem: &mut Memory,
    periph: &mut dyn Peripherals,
    mut dst_area: MemArea,
    dst_addr: u32,
    src_area: MemArea,
    src_addr: u32,
    count: u32,
) {
    if dst_addr >= mem.bridged_start() {
        dst_area = MemArea::P;
    }

    let word_by_word = dst_area == MemArea::P
        || is_peripheral_range(dst_area, dst_addr, count)
        || is_peripheral_range(src_area, src_addr, count)
        || mem.bridged_overlap(dst_area, dst_addr, count)
        || mem.bridged_overlap(src_area, src_addr, count);

    if word_by_word {
        for i in 0..count {
            let data = read_word(mem, periph, src_area, src_addr + i);
            write_word(mem, periph, dst_area, dst_addr + i, data);
        }
    } else {
        mem.copy_words(dst_area, dst_addr, src_area, src_addr, count);
    }
}

/// Bulk fill from one (re-read only if peripheral-mapped) source word.
pub fn bulk_fill(
    mem: &mut Memory,
    periph: &mut dyn Peripherals,
    mut dst_area: MemArea,
    dst_addr: u32,
    src_area: MemArea,
    src_addr: u32,
    count: u32,
) {
    let reread_source = is_peripheral(src_area, src_addr);

    if dst_addr >= mem.bridged_start() {
        dst_area = MemArea::P;
    }

    if reread_source {
        for i in 0..count {
            let data = read_word(mem, periph, src_area, src_addr);
            write_word(mem, periph, dst_area, dst_addr + i, data);
        }
        return;
    }

    let data = read_word(mem, periph, src_area, src_addr);
    let write_individual = dst_area == MemArea::P
        || is_peripheral_range(dst_area, dst_addr, count)
        || mem.bridged_overlap(dst_area, dst_addr, count);

    if write_individual {
        for i in 0..count {
            write_word(mem, periph, dst_area, dst_addr + i, data);
        }
    } else {
        let start = dst_addr as usize;
        mem.area_slice_mut(dst_area)[start..start + count as usize].fill(data & ADDR_MASK);
    }
}

/// Bulk copy into one fixed destination word (feeding a peripheral from
/// a memory region).
pub fn bulk_copy_to_fixed(
    mem: &mut Memory,
    periph: &mut dyn Peripherals,
    dst_area: MemArea,
    dst_addr: u32,
    src_area: MemArea,
    src_addr: u32,
    count: u32,
) {
    for i in 0..count {
        let data = read_word(mem, periph, src_area, src_addr + i);
        write_word(mem, periph, dst_area, dst_addr, data);
    }
}

/// Peripheral/MMIO collaborator, consumed but never owned by the JIT
/// core. Word-granularity access into the internal I/O window.
pub trait Peripherals {
    fn read(&mut self, area: MemArea, addr: u32) -> u32;
    fn write(&mut self, area: MemArea, addr: u32, value: u32);
}

/// Interrupt injection endpoint (the emulated core's interrupt
/// controller front door).
pub trait InterruptSink {
    fn inject_interrupt(&mut self, vector: u32);
}
