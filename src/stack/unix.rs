// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{MIN_STACK_SIZE, StackAllocator, StackPointer, StackSpace};
use std::io::Error;
use std::ptr;

/// Allocates stacks with `mmap`, with a guard page below the usable memory
/// so that an overflow faults instead of silently corrupting the mapping
/// next door.
#[derive(Debug, Default)]
pub struct MmapStackAllocator;

unsafe impl StackAllocator for MmapStackAllocator {
    fn allocate(&mut self, size: usize) -> std::io::Result<StackSpace> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, local addresses only.
        unsafe {
            // Reserve address space for the stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = Error::last_os_error();
                libc::munmap(mmap, mmap_len);
                return Err(err);
            }

            Ok(StackSpace::new(
                StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
            ))
        }
    }

    fn deallocate(&mut self, space: StackSpace) {
        // Safety: `space` describes a mapping produced by allocate() above.
        unsafe {
            let mmap = space.top().get() - space.len();
            let ret = libc::munmap(mmap as _, space.len());
            debug_assert_eq!(ret, 0);
        }
    }
}

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}
