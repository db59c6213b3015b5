//! Pages and the page-resolution capability
//!
//! The MD layer never touches page tables itself. A [`PageMap`] resolves
//! virtual addresses to pages and pages to NUMA nodes; [`HostPageMap`] is
//! the user-space provider.

use serde::{Deserialize, Serialize};

/// Opaque page identity (a frame number in the provider's numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Page(pub u64);

/// One scatter/gather fragment; never crosses a page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Kiov {
    pub page: Page,
    pub offset: usize,
    pub len: usize,
}

impl Kiov {
    pub fn new(page: Page, offset: usize, len: usize) -> Self {
        Self { page, offset, len }
    }
}

/// Page resolution provided by the platform.
pub trait PageMap: Send + Sync {
    fn page_size(&self) -> usize;

    /// True when `addr` lies in a vmalloc-style (non direct-mapped) area.
    fn is_vmalloc(&self, addr: usize) -> bool;

    /// Page backing `addr`; `vmalloc` selects the lookup path.
    fn page_of(&self, addr: usize, vmalloc: bool) -> Option<Page>;

    /// NUMA node holding `page`, if known.
    fn numa_of(&self, page: Page) -> Option<u32>;

    fn offset_in_page(&self, addr: usize) -> usize {
        addr & (self.page_size() - 1)
    }
}

/// User-space page map for the calling process.
///
/// Pages are virtual frame numbers; NUMA placement is queried from the
/// kernel with `move_pages(2)` in query mode.
pub struct HostPageMap {
    page_size: usize,
}

impl Default for HostPageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPageMap {
    pub fn new() -> Self {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if size > 0 { size as usize } else { 4096 };
        Self { page_size }
    }
}

impl PageMap for HostPageMap {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_vmalloc(&self, _addr: usize) -> bool {
        false
    }

    fn page_of(&self, addr: usize, _vmalloc: bool) -> Option<Page> {
        if addr == 0 {
            return None;
        }
        Some(Page((addr / self.page_size) as u64))
    }

    #[cfg(target_os = "linux")]
    fn numa_of(&self, page: Page) -> Option<u32> {
        let addr = (page.0 as usize).checked_mul(self.page_size)?;
        let pages = [addr as *mut libc::c_void];
        let mut status: [libc::c_int; 1] = [-1];
        let ret = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0 as libc::pid_t,
                1 as libc::c_ulong,
                pages.as_ptr(),
                std::ptr::null::<libc::c_int>(),
                status.as_mut_ptr(),
                0 as libc::c_int,
            )
        };
        if ret != 0 || status[0] < 0 {
            return None;
        }
        Some(status[0] as u32)
    }

    #[cfg(not(target_os = "linux"))]
    fn numa_of(&self, _page: Page) -> Option<u32> {
        None
    }
}
