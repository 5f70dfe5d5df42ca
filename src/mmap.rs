//! Thin OS memory-mapping wrapper. This is the "OS memory mapping"
//! external collaborator from spec.md section 1 (out of scope for the
//! collector's semantics) reduced to exactly what the bitmap's
//! [`crate::bitmap::MarkBitmap::map_bits`] and the work-buffer chunk
//! allocator in [`crate::workbuf`] need: reserve, commit, and release.

#[cfg(windows)]
mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                size: 0,
            }
        }

        pub fn new(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_READWRITE) as *mut u8;
                if mem.is_null() {
                    panic!("VirtualAlloc failed");
                }
                Self { start: mem, size }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            unsafe { self.start.add(self.size) }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
mod _unix {
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                size: 0,
            }
        }

        pub fn new(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed");
                }
                Self {
                    start: map as *mut u8,
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            unsafe { self.start.add(self.size) }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(
                    page as *mut _,
                    size,
                    libc::MADV_WILLNEED | libc::MADV_SEQUENTIAL,
                );
            }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size, libc::MADV_DONTNEED);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::Mmap;
#[cfg(windows)]
pub use _win::Mmap;
