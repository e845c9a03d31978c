//! DMA controller: six channels, status/offset registers, transfer
//! execution against the memory bridge's host-side routines.

use std::collections::HashMap;

use d56jit_core::memory::{bulk_copy, bulk_copy_to_fixed, bulk_fill, read_word, write_word};
use d56jit_core::{InterruptSink, MemArea, Memory, Peripherals};
use tracing::debug;

use crate::channel::{AddressGenMode, DmaChannel, TransferMode, DCR_DE, DCR_DIE};

/// Interrupt vector of DMA channel 0; channels are spaced two vectors
/// apart.
pub const VBA_DMA_CHANNEL0: u32 = 0x28;

/// Returned when no channel has work pending.
pub const MAX_DELAY_CYCLES: u32 = u32::MAX;

// DSTR bit positions.
const DSTR_DTD0: u32 = 0;
const DSTR_DACT: u32 = 8;
const DSTR_DCH0: u32 = 9;
const DSTR_DCH_MASK: u32 = 0x7 << DSTR_DCH0;

const NUM_CHANNELS: usize = 6;

fn sign_extend_24(v: u32) -> i32 {
    ((v << 8) as i32) >> 8
}

pub struct Dma {
    dstr: u32,
    dor: [u32; 4],
    channels: [DmaChannel; NUM_CHANNELS],
    /// Channels listening for a given request source code.
    request_targets: HashMap<u32, Vec<usize>>,
}

impl Dma {
    pub fn new() -> Self {
        Self {
            // All transfer-done bits set after reset.
            dstr: 0x3f << DSTR_DTD0,
            dor: [0; 4],
            channels: std::array::from_fn(|i| DmaChannel::new(i as u32)),
            request_targets: HashMap::new(),
        }
    }

    pub fn channel(&self, index: usize) -> &DmaChannel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut DmaChannel {
        &mut self.channels[index]
    }

    pub fn dstr(&self) -> u32 {
        self.dstr
    }

    pub fn set_dor(&mut self, index: usize, value: u32) {
        self.dor[index] = value;
        debug!(index, value = format_args!("{value:#08x}"), "DMA set DOR");
    }

    pub fn dor(&self, index: usize) -> u32 {
        self.dor[index]
    }

    /// True when the last transfer of any channel wrote program memory.
    /// Clears the flags; the embedder must invalidate compiled code.
    pub fn take_pmem_written(&mut self) -> bool {
        let mut any = false;
        for ch in &mut self.channels {
            any |= std::mem::take(&mut ch.wrote_pmem);
        }
        any
    }

    /// Control-register write: decodes the word, primes the counters
    /// and either starts the pending-transfer countdown (DE-triggered
    /// block mode) or registers the channel for peripheral requests.
    pub fn set_dcr(
        &mut self,
        index: usize,
        value: u32,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        irq: &mut dyn InterruptSink,
        clock: u64,
    ) {
        if self.channels[index].dcr == value {
            return;
        }

        self.remove_trigger_target(index);
        self.channels[index].dcr = value;
        debug!(channel = index, dcr = format_args!("{value:#08x}"), "DMA set DCR");

        let ch = &mut self.channels[index];
        if !ch.is_enabled() {
            return;
        }

        if ch.is_three_dimensional() {
            let (h, m, l) = ch.extract_dco_hml();
            ch.dcoh_init = h;
            ch.dcom_init = m;
            ch.dcol_init = l;
            ch.dcoh = h;
            ch.dcom = m;
            ch.dcol = l;
        } else {
            ch.dcoh_init = ch.dco >> 12;
            ch.dcol_init = ch.dco & 0xff;
            ch.dcoh = ch.dcoh_init;
            ch.dcol = ch.dcol_init;
            // DCOM doubles as backup storage for the full DCO in the
            // non-3D modes.
            ch.dcom_init = ch.dco;
            ch.dcom = ch.dcom_init;
        }

        if !ch.is_request_trigger() {
            // Each word takes at least two core clocks once the bus is
            // available.
            let dco = ch.dco;
            ch.pending_transfer = i64::max(1, ((dco as i64) + 1) << 1);
            ch.last_clock = clock;
            self.set_active_channel(index as u32);
            return;
        }

        let tm = ch.transfer_mode();
        let supported = matches!(
            tm,
            TransferMode::WordTriggerRequest
                | TransferMode::WordTriggerRequestClearDE
                | TransferMode::LineTriggerRequestClearDE
        );
        assert!(supported, "transfer mode {tm:?} not implemented for request triggers");

        self.add_trigger_target(index);
        if self.check_trigger(index, periph) {
            self.trigger_by_request(index, mem, periph, irq);
        }
    }

    /// Advance all channels by the core clock. Returns the smallest
    /// remaining delay, or `MAX_DELAY_CYCLES` when idle.
    pub fn exec(
        &mut self,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        irq: &mut dyn InterruptSink,
        clock: u64,
    ) -> u32 {
        if self.dstr & (1 << DSTR_DACT) == 0 {
            return MAX_DELAY_CYCLES;
        }

        let mut delay = MAX_DELAY_CYCLES;
        for i in 0..NUM_CHANNELS {
            delay = delay.min(self.exec_channel(i, mem, periph, irq, clock));
        }
        delay
    }

    fn exec_channel(
        &mut self,
        index: usize,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        irq: &mut dyn InterruptSink,
        clock: u64,
    ) -> u32 {
        let ch = &mut self.channels[index];
        if ch.pending_transfer <= 0 {
            return MAX_DELAY_CYCLES;
        }

        let diff = clock.wrapping_sub(ch.last_clock);
        ch.last_clock = clock;
        ch.pending_transfer -= diff as i64;

        if ch.pending_transfer <= 0 {
            if self.exec_transfer(index, mem, periph) {
                self.channels[index].pending_transfer = 0;
                self.finish_transfer(index, irq);
            } else {
                self.channels[index].pending_transfer = 1;
            }
        }

        self.channels[index].pending_transfer.max(0) as u32
    }

    /// Fire one request-triggered transfer step.
    pub fn trigger_by_request(
        &mut self,
        index: usize,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        irq: &mut dyn InterruptSink,
    ) {
        if !self.channels[index].is_enabled() {
            return;
        }
        if self.exec_transfer(index, mem, periph) {
            self.finish_transfer(index, irq);
        }
    }

    /// Fire every channel listening on `source`. Returns whether any
    /// channel was registered.
    pub fn trigger(
        &mut self,
        source: u32,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        irq: &mut dyn InterruptSink,
    ) -> bool {
        let Some(targets) = self.request_targets.get(&source).cloned() else {
            return false;
        };
        if targets.is_empty() {
            return false;
        }
        for index in targets {
            self.trigger_by_request(index, mem, periph, irq);
        }
        true
    }

    pub fn has_trigger(&self, source: u32) -> bool {
        self.request_targets
            .get(&source)
            .is_some_and(|t| !t.is_empty())
    }

    /// Whether the requesting peripheral currently asserts a request.
    ///
    /// The documentation leaves open whether enabling a request-driven
    /// channel acts on the request *level* or only on a subsequent
    /// *change*; observed behavior matches the latter, so the level
    /// probe is disabled and enabling never fires an immediate
    /// transfer. The decoding below is kept for when this is revisited.
    fn check_trigger(&self, index: usize, periph: &mut dyn Peripherals) -> bool {
        const LEVEL_TRIGGERING: bool = false;
        if !LEVEL_TRIGGERING {
            return false;
        }

        // Request source codes of the on-chip peripheral set; status
        // registers live in the internal I/O window of X space.
        const REQ_ESAI_RX: u32 = 0x0b;
        const REQ_ESAI_TX: u32 = 0x0d;
        const REQ_HOST_RX: u32 = 0x15;
        const REQ_HOST_TX: u32 = 0x16;
        const ESAI_SAISR: u32 = 0xff_ffb3;
        const HDI08_HSR: u32 = 0xff_ffc3;

        match self.channels[index].request_source() {
            REQ_ESAI_RX => periph.read(MemArea::X, ESAI_SAISR) & (1 << 0) != 0,
            REQ_ESAI_TX => periph.read(MemArea::X, ESAI_SAISR) & (1 << 1) != 0,
            REQ_HOST_RX => periph.read(MemArea::X, HDI08_HSR) & (1 << 0) != 0,
            REQ_HOST_TX => periph.read(MemArea::X, HDI08_HSR) & (1 << 1) != 0,
            other => {
                debug_assert!(false, "unsupported request source {other:#x}");
                false
            }
        }
    }

    /// Run one transfer step. Returns true when the transfer (block,
    /// line or word sequence) is complete.
    fn exec_transfer(&mut self, index: usize, mem: &mut Memory, periph: &mut dyn Peripherals) -> bool {
        let dor = self.dor;
        let ch = &mut self.channels[index];

        let (Some(src_area), Some(dst_area)) = (ch.source_space(), ch.destination_space()) else {
            // Reserved space selector: no transfer.
            return true;
        };

        if dst_area == MemArea::P || ch.ddr >= mem.bridged_start() {
            ch.wrote_pmem = true;
        }

        if ch.is_three_dimensional() {
            let data = read_word(mem, periph, src_area, ch.dsr);
            write_word(mem, periph, dst_area, ch.ddr, data);

            let dam = ch.dam();
            let address_gen_mode = (dam >> 3) & 7;
            let mode_select = (dam >> 2) & 1;

            let offset_a = sign_extend_24(dor[(mode_select << 1) as usize]);
            let offset_b = sign_extend_24(dor[((mode_select << 1) + 1) as usize]);

            if address_gen_mode == 4 {
                // Counter side is three-dimensional, the other side
                // holds still ("no update").
                let mut block_finished = false;
                let counter_is_source = mode_select == 0;
                let mut t = if counter_is_source { ch.dsr } else { ch.ddr };
                if ch.dcol == 0 {
                    ch.dcol = ch.dcol_init;
                    if ch.dcom == 0 {
                        ch.dcom = ch.dcom_init;
                        if ch.dcoh == 0 {
                            ch.dcoh = ch.dcoh_init;
                            block_finished = true;
                        } else {
                            ch.dcoh -= 1;
                        }
                        t = t.wrapping_add(offset_b as u32);
                    } else {
                        ch.dcom -= 1;
                        t = t.wrapping_add(offset_a as u32);
                    }
                } else {
                    t = t.wrapping_add(1);
                    ch.dcol -= 1;
                }
                if counter_is_source {
                    ch.dsr = t & 0xff_ffff;
                } else {
                    ch.ddr = t & 0xff_ffff;
                }
                return block_finished;
            }

            // Deferred: the remaining three-dimensional address
            // generation modes have no verified semantics yet.
            panic!("three-dimensional DMA address generation mode {address_gen_mode} not implemented");
        }

        let agm_s = ch.source_address_gen_mode();
        let agm_d = ch.destination_address_gen_mode();

        if agm_s == AddressGenMode::SingleCounterAPostInc && agm_d == AddressGenMode::SingleCounterAPostInc {
            assert!(
                !ch.is_request_trigger(),
                "request-triggered inc/inc transfers must move one word at a time"
            );
            let count = ch.dco + 1;
            bulk_copy(mem, periph, dst_area, ch.ddr, src_area, ch.dsr, count);
            ch.dsr = ch.dsr.wrapping_add(count);
            ch.ddr = ch.ddr.wrapping_add(count);
            return true;
        }

        if agm_s == AddressGenMode::SingleCounterANoUpdate && agm_d == AddressGenMode::SingleCounterAPostInc {
            // Continuously read one peripheral word into a region.
            if ch.is_request_trigger() {
                let data = read_word(mem, periph, src_area, ch.dsr);
                write_word(mem, periph, dst_area, ch.ddr, data);
                ch.ddr = ch.ddr.wrapping_add(1);
                if ch.dco > 0 {
                    ch.dco -= 1;
                    return false;
                }
                ch.dco = ch.dcom_init;
                return true;
            }
            let count = ch.dco + 1;
            bulk_fill(mem, periph, dst_area, ch.ddr, src_area, ch.dsr, count);
            ch.ddr = ch.ddr.wrapping_add(count);
            return true;
        }

        if agm_s == AddressGenMode::SingleCounterAPostInc && agm_d == AddressGenMode::SingleCounterANoUpdate {
            // Continuously feed one peripheral word from a region.
            if ch.is_request_trigger() {
                let data = read_word(mem, periph, src_area, ch.dsr);
                write_word(mem, periph, dst_area, ch.ddr, data);
                ch.dsr = ch.dsr.wrapping_add(1);
                if ch.dco > 0 {
                    ch.dco -= 1;
                    return false;
                }
                ch.dco = ch.dcom_init;
                return true;
            }
            let count = ch.dco + 1;
            bulk_copy_to_fixed(mem, periph, dst_area, ch.ddr, src_area, ch.dsr, count);
            ch.dsr = ch.dsr.wrapping_add(count);
            return true;
        }

        if agm_s == AddressGenMode::SingleCounterAPostInc && agm_d == AddressGenMode::DualCounterDor1 {
            // 2-D destination; a line per request in line mode, a word
            // otherwise.
            let is_line_transfer = ch.transfer_mode() == TransferMode::LineTriggerRequestClearDE;
            loop {
                let data = read_word(mem, periph, src_area, ch.dsr);
                write_word(mem, periph, dst_area, ch.ddr, data);
                ch.dsr = ch.dsr.wrapping_add(1);

                let mut ddr = ch.ddr;
                let done = ch.dual_mode_increment(&mut ddr, dor[1]);
                ch.ddr = ddr;
                if done {
                    return true;
                }
                if !(is_line_transfer && ch.dcol != ch.dcol_init) {
                    return false;
                }
            }
        }

        panic!("DMA transfer mode pair {agm_s:?}/{agm_d:?} not implemented");
    }

    fn finish_transfer(&mut self, index: usize, irq: &mut dyn InterruptSink) {
        let ch = &mut self.channels[index];
        if ch.is_de_cleared_after_transfer() {
            ch.dcr &= !(1 << DCR_DE);
        }
        let die = ch.dcr & (1 << DCR_DIE) != 0;
        let ch_index = ch.index;

        self.clear_active_channel();
        self.dstr |= 1 << (DSTR_DTD0 + ch_index);

        if die {
            irq.inject_interrupt(VBA_DMA_CHANNEL0 + (ch_index << 1));
        }
    }

    fn set_active_channel(&mut self, channel: u32) {
        self.dstr |= 1 << DSTR_DACT;
        self.dstr &= !DSTR_DCH_MASK;
        self.dstr |= channel << DSTR_DCH0;
        self.dstr &= !(1 << (DSTR_DTD0 + channel));
    }

    fn clear_active_channel(&mut self) {
        self.dstr &= !(1 << DSTR_DACT);
    }

    fn add_trigger_target(&mut self, index: usize) {
        let source = self.channels[index].request_source();
        self.request_targets.entry(source).or_default().push(index);
    }

    fn remove_trigger_target(&mut self, index: usize) {
        let source = self.channels[index].request_source();
        if let Some(targets) = self.request_targets.get_mut(&source) {
            targets.retain(|&i| i != index);
        }
    }
}

impl Default for Dma {
    fn default() -> Self {
        Self::new()
    }
}
