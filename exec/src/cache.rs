//! Block cache and mode-keyed chains.
//!
//! One chain per start address groups the blocks compiled for the
//! addressing-mode configurations seen there — at most one block per
//! (address, mode) pair. Membership is append-only; invalidation clears
//! every chain wholesale, never a single mode variant.

use std::collections::HashMap;

use d56jit_backend::CompiledBlock;
use d56jit_core::JitMode;

/// The compiled variants sharing one start address.
#[derive(Debug, Default)]
pub struct BlockChain {
    variants: Vec<(JitMode, CompiledBlock)>,
}

impl BlockChain {
    pub fn get(&self, mode: JitMode) -> Option<&CompiledBlock> {
        self.variants
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, b)| b)
    }

    pub fn insert(&mut self, mode: JitMode, block: CompiledBlock) {
        assert!(
            self.get(mode).is_none(),
            "duplicate block for mode {mode:?} at {:#08x}",
            block.start
        );
        self.variants.push((mode, block));
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// All compiled blocks, keyed by start address. Exclusively owns the
/// block descriptors; the dispatcher only looks things up.
#[derive(Debug, Default)]
pub struct BlockCache {
    chains: HashMap<u32, BlockChain>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            chains: HashMap::new(),
        }
    }

    pub fn lookup(&self, addr: u32, mode: JitMode) -> Option<&CompiledBlock> {
        self.chains.get(&addr).and_then(|c| c.get(mode))
    }

    /// Whether any block (of any mode) starts at `addr`.
    pub fn occupied(&self, addr: u32) -> bool {
        self.chains.get(&addr).is_some_and(|c| !c.is_empty())
    }

    pub fn insert(&mut self, mode: JitMode, block: CompiledBlock) {
        self.chains
            .entry(block.start)
            .or_default()
            .insert(mode, block);
    }

    pub fn block_count(&self) -> usize {
        self.chains.values().map(|c| c.len()).sum()
    }

    /// Wholesale invalidation.
    pub fn clear(&mut self) {
        self.chains.clear();
    }
}
