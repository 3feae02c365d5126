//! Memory-block packing.
//!
//! Given a list of block descriptors, computes a combined size and per-block
//! byte offsets such that each block starts at the smallest position at or
//! after the running cursor that satisfies its alignment. The base pointer
//! is assumed to be aligned to the maximum alignment. The assembler, the
//! script loader and the VM memory sizing all use this one procedure.

/// One block to place: `count` elements of `elem_size` bytes each.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemBlock {
    /// Size of one element in bytes.
    pub elem_size: usize,
    /// Number of elements.
    pub count: usize,
    /// Required alignment of the block's first byte.
    pub align: usize,
    /// Output: byte offset from the base, filled in by [`pack`].
    pub offset: usize,
}

impl MemBlock {
    /// Describes a block of `count` elements, `elem_size` bytes each.
    pub fn new(elem_size: usize, count: usize, align: usize) -> Self {
        Self {
            elem_size,
            count,
            align,
            offset: 0,
        }
    }

    /// Total bytes the block occupies.
    pub fn size(&self) -> usize {
        self.elem_size * self.count
    }
}

/// The packed layout: total byte size and the strictest alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PackInfo {
    /// Bytes needed for all blocks.
    pub total_size: usize,
    /// Maximum of the block alignments.
    pub align: usize,
}

/// Places every block, writing its `offset`, and returns the overall layout.
pub(crate) fn pack(blocks: &mut [MemBlock]) -> PackInfo {
    let align = blocks.iter().map(|b| b.align).max().unwrap_or(1).max(1);

    let mut cursor = 0usize;
    for block in blocks.iter_mut() {
        cursor = cursor.next_multiple_of(block.align.max(1));
        block.offset = cursor;
        cursor += block.size();
    }

    PackInfo {
        total_size: cursor,
        align,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_placed_in_order_with_alignment() {
        let mut blocks = [
            MemBlock::new(1, 3, 1),
            MemBlock::new(4, 2, 4),
            MemBlock::new(8, 1, 8),
        ];
        let info = pack(&mut blocks);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 4);
        assert_eq!(blocks[2].offset, 16);
        assert_eq!(info.total_size, 24);
        assert_eq!(info.align, 8);
    }

    #[test]
    fn offsets_use_the_smallest_aligned_position() {
        let mut blocks = [MemBlock::new(1, 1, 1), MemBlock::new(2, 1, 2)];
        pack(&mut blocks);
        assert_eq!(blocks[1].offset, 2);
    }

    #[test]
    fn empty_blocks_take_no_space() {
        let mut blocks = [MemBlock::new(4, 0, 4), MemBlock::new(1, 5, 1)];
        let info = pack(&mut blocks);
        assert_eq!(blocks[1].offset, 0);
        assert_eq!(info.total_size, 5);
    }
}
