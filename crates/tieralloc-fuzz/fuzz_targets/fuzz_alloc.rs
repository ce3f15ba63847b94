#![no_main]
use libfuzzer_sys::fuzz_target;
use tieralloc_core::{AllocMode, AllocatorConfig, FailingHeap, TierAllocator};

fuzz_target!(|data: &[u8]| {
    // Each 4-byte record: op, size (le u16), fill byte.
    if data.len() < 4 {
        return;
    }

    let heap = FailingHeap::new();
    let mode = if data[0] & 0x80 != 0 {
        AllocMode::Hardened
    } else {
        AllocMode::Strict
    };
    let alloc = TierAllocator::with_heap(
        &heap,
        AllocatorConfig::DEFAULT
            .with_mode(mode)
            .with_refill_batch(usize::from(data[0] & 0x1f)),
    );
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for chunk in data[1..].chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 5;
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]])) % 1024;
        let fill = chunk[3];

        match op {
            0 | 1 => {
                if let Ok(p) = alloc.allocate(size) {
                    if !p.is_null() {
                        // SAFETY: p is valid for `size` bytes.
                        unsafe { std::ptr::write_bytes(p, fill, size) };
                        live.push((p, size, fill));
                    }
                }
            }
            2 => {
                if live.is_empty() {
                    continue;
                }
                let (p, n, f) = live.swap_remove(size % live.len());
                // SAFETY: p is live and was filled with `f`.
                let bytes = unsafe { std::slice::from_raw_parts(p, n) };
                assert!(bytes.iter().all(|&b| b == f), "block clobbered");
                // SAFETY: live block with its original size.
                unsafe { alloc.deallocate(p, n) };
            }
            3 => {
                if live.is_empty() {
                    continue;
                }
                let idx = size % live.len();
                let (p, n, _) = live.swap_remove(idx);
                // SAFETY: live block with its original size; content is not relied upon.
                if let Ok(q) = unsafe { alloc.reallocate(p, n, size) } {
                    if !q.is_null() {
                        // SAFETY: q is valid for `size` bytes.
                        unsafe { std::ptr::write_bytes(q, fill, size) };
                        live.push((q, size, fill));
                    }
                }
            }
            _ => heap.fail_next(usize::from(fill % 3)),
        }
    }

    for (p, n, _) in live {
        // SAFETY: live block with its original size.
        unsafe { alloc.deallocate(p, n) };
    }
});
