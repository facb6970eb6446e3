//! Per-submission linear allocator.
//!
//! Only appends to the end of the current block, grabbing a new block from
//! the parent allocator when necessary. Freeing is a no-op; the whole
//! allocator is reset when its frame slot is recycled. Not thread-safe by
//! design - each recording thread owns its own.

use crate::alloc::{GlobalAllocator, ResourceAllocator};
use crate::error::Result;
use crate::resource::{Buffer, BufferCreateInfo, BufferUsageFlags, MemoryUsage};

fn align_offset(ptr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
    (ptr + align - 1) & !(align - 1)
}

pub struct LinearAllocator {
    block_size: u64,
    usage: BufferUsageFlags,
    mem_usage: MemoryUsage,
    blocks: Vec<Buffer>,
    front_block: usize,
    front_ptr: u64,
}

impl LinearAllocator {
    pub fn new(block_size: u64, usage: BufferUsageFlags, mem_usage: MemoryUsage) -> LinearAllocator {
        LinearAllocator {
            block_size,
            usage,
            mem_usage,
            blocks: Vec::new(),
            front_block: 0,
            front_ptr: 0,
        }
    }

    fn new_block(&mut self, global: &GlobalAllocator, size: u64) -> Result<()> {
        let block = global.allocate_buffer(&BufferCreateInfo {
            mem_usage: self.mem_usage,
            usage: self.usage,
            size,
            alignment: 256,
        })?;
        self.blocks.push(block);
        self.front_block = self.blocks.len() - 1;
        self.front_ptr = 0;
        Ok(())
    }

    pub fn allocate(&mut self, global: &GlobalAllocator, size: u64, align: u64) -> Result<Buffer> {
        if size > self.block_size {
            // doesn't fit the block scheme, give it a dedicated block
            self.new_block(global, size)?;
            self.front_ptr = size;
            return Ok(self.blocks[self.front_block].subrange(0, size));
        }
        if self.blocks.is_empty() {
            self.new_block(global, self.block_size)?;
        }
        loop {
            let start = align_offset(self.front_ptr, align);
            if start + size <= self.blocks[self.front_block].size {
                self.front_ptr = start + size;
                return Ok(self.blocks[self.front_block].subrange(start, size));
            }
            // block exhausted; move to the next one, or grow
            self.front_block += 1;
            self.front_ptr = 0;
            if self.front_block >= self.blocks.len() {
                self.new_block(global, self.block_size)?;
            }
        }
    }

    /// Make all block space available again. Blocks are kept.
    pub fn reset(&mut self) {
        self.front_block = 0;
        self.front_ptr = 0;
    }

    /// Give every block back to the parent.
    pub fn release(&mut self, global: &GlobalAllocator) {
        for b in self.blocks.drain(..) {
            global.deallocate_buffer(b);
        }
        self.front_block = 0;
        self.front_ptr = 0;
    }
}
