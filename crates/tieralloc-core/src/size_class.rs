//! Size classes for small allocations.
//!
//! Small requests are bucketed into 16 classes of 8-byte granularity, from 8
//! bytes up to 128 bytes. A request of `n` bytes belongs to class
//! `ceil(n / 8) - 1` and is served with a block of exactly that class's size.
//! Anything above [`MAX_SMALL_BYTES`] bypasses the classes entirely and goes
//! to the large-block path.

/// Block alignment and class granularity (bytes).
pub const ALIGN: usize = 8;

/// Largest request served from the free lists (bytes).
pub const MAX_SMALL_BYTES: usize = 128;

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = MAX_SMALL_BYTES / ALIGN;

/// Rounds `bytes` up to the next multiple of [`ALIGN`].
#[must_use]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// Returns true if a request of `bytes` is served by the small-block path.
#[must_use]
pub const fn is_small(bytes: usize) -> bool {
    bytes != 0 && bytes <= MAX_SMALL_BYTES
}

/// Maps a request size to its class index.
///
/// Returns `None` for zero-byte requests and for anything above
/// [`MAX_SMALL_BYTES`].
#[must_use]
pub const fn class_index(bytes: usize) -> Option<usize> {
    if !is_small(bytes) {
        return None;
    }
    Some((bytes + ALIGN - 1) / ALIGN - 1)
}

/// Block size of class `index`, or 0 for out-of-range indices.
#[must_use]
pub const fn class_size(index: usize) -> usize {
    if index < NUM_SIZE_CLASSES {
        (index + 1) * ALIGN
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_classes() {
        assert_eq!(NUM_SIZE_CLASSES, 16);
    }

    #[test]
    fn test_class_index_boundaries() {
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(8), Some(0));
        assert_eq!(class_index(9), Some(1));
        assert_eq!(class_index(16), Some(1));
        assert_eq!(class_index(121), Some(15));
        assert_eq!(class_index(128), Some(15));
    }

    #[test]
    fn test_class_index_rejects_zero_and_large() {
        assert_eq!(class_index(0), None);
        assert_eq!(class_index(129), None);
        assert_eq!(class_index(usize::MAX), None);
    }

    #[test]
    fn test_every_small_size_maps_to_its_bucket() {
        for bytes in 1..=MAX_SMALL_BYTES {
            let class = class_index(bytes).unwrap();
            assert_eq!(class, (bytes - 1) / 8, "bytes={bytes}");
            assert!(class_size(class) >= bytes);
            assert!(class_size(class) - bytes < ALIGN);
        }
    }

    #[test]
    fn test_class_size_roundtrip() {
        for i in 0..NUM_SIZE_CLASSES {
            let size = class_size(i);
            assert_eq!(size % ALIGN, 0);
            assert_eq!(class_index(size), Some(i));
        }
        assert_eq!(class_size(NUM_SIZE_CLASSES), 0);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(13), 16);
        assert_eq!(round_up(4097), 4104);
    }
}
