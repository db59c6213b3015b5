//! Page-vector builder
//!
//! Turns an [`MdDesc`] buffer into a validated page vector in two passes:
//! [`plan`] checks the description and sizes the vector before anything is
//! allocated, [`fill`] writes the fragments into allocated storage.

use crate::error::{MdError, Result};
use crate::md::{MdBuffer, MdDesc};
use crate::options::MdOptions;
use crate::page::{Kiov, PageMap};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KiovPlan {
    pub niov: usize,
    pub length: usize,
}

fn check_niov(niov: usize, max_iov: usize, options: MdOptions) -> Result<()> {
    if niov <= max_iov {
        return Ok(());
    }
    if options.contains(MdOptions::GNILND) {
        warn!("MD with {} fragments exceeds max_iov {} (GNILND waiver)", niov, max_iov);
        return Ok(());
    }
    Err(MdError::invalid(format!(
        "{} fragments exceeds max_iov {}",
        niov, max_iov
    )))
}

/// Validate `desc` and work out the vector length and byte count.
pub(crate) fn plan(desc: &MdDesc, pages: &dyn PageMap, max_iov: usize) -> Result<KiovPlan> {
    let page_size = pages.page_size();

    let plan = match &desc.buffer {
        MdBuffer::Kiov(kiov) => {
            if !desc.options.contains(MdOptions::KIOV) {
                return Err(MdError::invalid("page vector given without KIOV option"));
            }
            check_niov(kiov.len(), max_iov, desc.options)?;

            let mut length = 0usize;
            for (i, frag) in kiov.iter().enumerate() {
                let end = frag.offset.checked_add(frag.len);
                if end.map_or(true, |end| end > page_size) {
                    return Err(MdError::invalid(format!(
                        "kiov[{}] offset {} len {} crosses a {}-byte page",
                        i, frag.offset, frag.len, page_size
                    )));
                }
                length = length
                    .checked_add(frag.len)
                    .ok_or_else(|| MdError::invalid("kiov length overflows"))?;
            }
            KiovPlan {
                niov: kiov.len(),
                length,
            }
        }
        MdBuffer::Contiguous { start, length } => {
            if desc.options.contains(MdOptions::KIOV) {
                return Err(MdError::invalid("KIOV option given with a contiguous buffer"));
            }
            if *start == 0 && *length > 0 {
                return Err(MdError::invalid("null buffer with non-zero length"));
            }
            if start.checked_add(*length).is_none() {
                return Err(MdError::invalid("buffer wraps the address space"));
            }
            let niov = if *length == 0 {
                0
            } else {
                (pages.offset_in_page(*start) + length).div_ceil(page_size)
            };
            check_niov(niov, max_iov, desc.options)?;
            KiovPlan {
                niov,
                length: *length,
            }
        }
    };

    if desc.options.contains(MdOptions::MAX_SIZE)
        && (desc.max_size < 0 || desc.max_size as u64 > plan.length as u64)
    {
        return Err(MdError::invalid(format!(
            "max_size {} outside 0..={}",
            desc.max_size, plan.length
        )));
    }

    Ok(plan)
}

/// Write the fragments of `desc` into `kiov`, which has the planned length.
pub(crate) fn fill(kiov: &mut [Kiov], desc: &MdDesc, pages: &dyn PageMap) -> Result<()> {
    match &desc.buffer {
        MdBuffer::Kiov(src) => kiov.copy_from_slice(src),
        MdBuffer::Contiguous { start, length } => {
            let page_size = pages.page_size();
            let mut addr = *start;
            let mut remaining = *length;
            for frag in kiov.iter_mut() {
                let offset = pages.offset_in_page(addr);
                let len = remaining.min(page_size - offset);
                let vmalloc = pages.is_vmalloc(addr);
                let page = pages.page_of(addr, vmalloc).ok_or_else(|| {
                    MdError::invalid(format!("no page backs address {:#x}", addr))
                })?;
                *frag = Kiov::new(page, offset, len);
                addr += len;
                remaining -= len;
            }
            debug_assert_eq!(remaining, 0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use crate::test_utils::{FakePageMap, PAGE};
    use proptest::prelude::*;

    fn build(desc: &MdDesc, pages: &FakePageMap) -> Result<Vec<Kiov>> {
        let plan = plan(desc, pages, 256)?;
        let mut kiov = vec![Kiov::default(); plan.niov];
        fill(&mut kiov, desc, pages)?;
        Ok(kiov)
    }

    #[test]
    fn test_single_aligned_page() {
        let pages = FakePageMap::new();
        let kiov = build(&MdDesc::contiguous(0x10000, PAGE), &pages).unwrap();
        assert_eq!(kiov, vec![Kiov::new(Page(0x10), 0, PAGE)]);
    }

    #[test]
    fn test_unaligned_range_splits_at_page_boundaries() {
        let pages = FakePageMap::new();
        let kiov = build(&MdDesc::contiguous(0x10000 + 100, 2 * PAGE), &pages).unwrap();
        assert_eq!(
            kiov,
            vec![
                Kiov::new(Page(0x10), 100, PAGE - 100),
                Kiov::new(Page(0x11), 0, PAGE),
                Kiov::new(Page(0x12), 0, 100),
            ]
        );
    }

    #[test]
    fn test_vmalloc_addresses_use_vmalloc_lookup() {
        let pages = FakePageMap::new();
        let start = FakePageMap::VMALLOC_START + PAGE;
        let kiov = build(&MdDesc::contiguous(start, 10), &pages).unwrap();
        assert_eq!(kiov[0].page, FakePageMap::vmalloc_page(start));
    }

    #[test]
    fn test_unmapped_address_rejected() {
        let mut pages = FakePageMap::new();
        pages.unmap(Page(0x11));
        let err = build(&MdDesc::contiguous(0x10000, 2 * PAGE), &pages).unwrap_err();
        assert!(matches!(err, MdError::InvalidArg(_)));
    }

    #[test]
    fn test_empty_buffers() {
        let pages = FakePageMap::new();
        assert!(build(&MdDesc::contiguous(0, 0), &pages).unwrap().is_empty());
        assert!(build(&MdDesc::kiov(vec![]), &pages).unwrap().is_empty());
    }

    #[test]
    fn test_null_start_rejected() {
        let pages = FakePageMap::new();
        assert!(plan(&MdDesc::contiguous(0, 1), &pages, 256).is_err());
    }

    #[test]
    fn test_kiov_copied_verbatim() {
        let pages = FakePageMap::new();
        let src = vec![Kiov::new(Page(7), 512, 100), Kiov::new(Page(3), 0, PAGE)];
        let desc = MdDesc::kiov(src.clone());
        assert_eq!(plan(&desc, &pages, 256).unwrap().length, PAGE + 100);
        assert_eq!(build(&desc, &pages).unwrap(), src);
    }

    #[test]
    fn test_kiov_crossing_page_rejected() {
        let pages = FakePageMap::new();
        let desc = MdDesc::kiov(vec![Kiov::new(Page(1), PAGE - 10, 11)]);
        assert!(plan(&desc, &pages, 256).is_err());
        let desc = MdDesc::kiov(vec![Kiov::new(Page(1), usize::MAX, 2)]);
        assert!(plan(&desc, &pages, 256).is_err());
    }

    #[test]
    fn test_option_and_buffer_must_agree() {
        let pages = FakePageMap::new();
        let mut desc = MdDesc::kiov(vec![]);
        desc.options = MdOptions::empty();
        assert!(plan(&desc, &pages, 256).is_err());
        let desc = MdDesc::contiguous(0x1000, 1).options(MdOptions::KIOV);
        assert!(plan(&desc, &pages, 256).is_err());
    }

    #[test]
    fn test_max_iov_and_gnilnd_waiver() {
        let pages = FakePageMap::new();
        let vec = vec![Kiov::new(Page(1), 0, 1); 5];
        assert!(plan(&MdDesc::kiov(vec.clone()), &pages, 4).is_err());
        let waived = MdDesc::kiov(vec).options(MdOptions::GNILND);
        assert_eq!(plan(&waived, &pages, 4).unwrap().niov, 5);

        let contiguous = MdDesc::contiguous(0x10000, 5 * PAGE);
        assert!(plan(&contiguous, &pages, 4).is_err());
        let waived = contiguous.options(MdOptions::GNILND);
        assert_eq!(plan(&waived, &pages, 4).unwrap().niov, 5);
    }

    #[test]
    fn test_max_size_bounds() {
        let pages = FakePageMap::new();
        let base = MdDesc::contiguous(0x10000, 100);
        assert!(plan(&base.clone().max_size(0), &pages, 256).is_ok());
        assert!(plan(&base.clone().max_size(100), &pages, 256).is_ok());
        assert!(plan(&base.clone().max_size(101), &pages, 256).is_err());
        assert!(plan(&base.max_size(-1), &pages, 256).is_err());
    }

    proptest! {
        #[test]
        fn prop_contiguous_kiov_invariants(
            start in 1usize..(1 << 40),
            length in 0usize..(64 * PAGE),
        ) {
            let pages = FakePageMap::new();
            let desc = MdDesc::contiguous(start, length);
            let kiov = build(&desc, &pages).unwrap();
            prop_assert_eq!(kiov.iter().map(|k| k.len).sum::<usize>(), length);
            for k in &kiov {
                prop_assert!(k.offset + k.len <= PAGE);
                prop_assert!(k.len > 0);
            }
        }

        #[test]
        fn prop_page_vector_invariants(
            frags in prop::collection::vec((0u64..64, 0usize..PAGE, 0usize..=PAGE), 0..32),
            max_size in 0i64..(32 * PAGE as i64),
        ) {
            let pages = FakePageMap::new();
            let src: Vec<Kiov> = frags
                .iter()
                .map(|&(page, offset, len)| Kiov::new(Page(page), offset, len))
                .collect();
            let crosses = src.iter().any(|k| k.offset + k.len > PAGE);
            let total: usize = src.iter().map(|k| k.len).sum();

            let desc = MdDesc::kiov(src.clone());
            match build(&desc, &pages) {
                Ok(kiov) => {
                    prop_assert!(!crosses);
                    prop_assert_eq!(kiov, src.clone());
                    let planned = plan(&desc, &pages, 256).unwrap();
                    prop_assert_eq!(planned.niov, src.len());
                    prop_assert_eq!(planned.length, total);
                }
                Err(_) => prop_assert!(crosses),
            }

            let capped = MdDesc::kiov(src).max_size(max_size);
            let fits = !crosses && max_size as usize <= total;
            prop_assert_eq!(plan(&capped, &pages, 256).is_ok(), fits);
        }
    }
}
