/// A half-open range `[min, max)` of keys, sliceable into near-equal
/// contiguous sub-ranges so workers and threads can partition a key space
/// without overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    min: i64,
    max: i64,
}

impl KeyRange {
    pub fn new(min: i64, max: i64) -> anyhow::Result<Self> {
        if max <= min {
            return Err(anyhow::anyhow!("invalid key range [{}, {})", min, max));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn len(&self) -> u64 {
        (self.max - self.min) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.min && value < self.max
    }

    /// Slices the range into `count` contiguous sub-ranges whose lengths
    /// differ by at most one, earlier slices absorbing the remainder.
    pub fn slice(&self, count: usize) -> Vec<KeyRange> {
        (0..count).map(|i| self.slice_for(count, i)).collect()
    }

    /// A single slice at `index` out of `count` slices.
    ///
    /// # Panics
    ///
    /// Panics if `index >= count` or `count` is zero.
    pub fn slice_for(&self, count: usize, index: usize) -> KeyRange {
        assert!(count > 0 && index < count, "slice index out of bounds");

        let count = count as i64;
        let index = index as i64;
        let size = self.max - self.min;
        let increment = size / count;
        let remainder = size % count;
        let slice_min =
            self.min + (increment + 1) * remainder.min(index) + increment * (index - remainder).max(0);
        let slice_max = slice_min + increment + if index < remainder { 1 } else { 0 };
        KeyRange {
            min: slice_min,
            max: slice_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_cover_range_with_remainder_first() -> anyhow::Result<()> {
        let range = KeyRange::new(0, 53)?;
        let slices = range.slice(5);

        let expected = vec![
            KeyRange { min: 0, max: 11 },
            KeyRange { min: 11, max: 22 },
            KeyRange { min: 22, max: 33 },
            KeyRange { min: 33, max: 43 },
            KeyRange { min: 43, max: 53 },
        ];
        assert_eq!(slices, expected);

        Ok(())
    }

    #[test]
    fn slices_are_contiguous_and_exhaustive() -> anyhow::Result<()> {
        let range = KeyRange::new(-7, 1000)?;
        let slices = range.slice(13);

        assert_eq!(slices.first().map(|s| s.min), Some(range.min));
        assert_eq!(slices.last().map(|s| s.max), Some(range.max));
        for pair in slices.windows(2) {
            assert_eq!(pair[0].max, pair[1].min);
            assert!((pair[0].len() as i64 - pair[1].len() as i64).abs() <= 1);
        }

        Ok(())
    }

    #[test]
    fn even_split_has_no_remainder() -> anyhow::Result<()> {
        let range = KeyRange::new(0, 100)?;
        for slice in range.slice(4) {
            assert_eq!(slice.len(), 25);
        }
        Ok(())
    }

    #[test]
    fn rejects_empty_or_inverted_range() {
        assert!(KeyRange::new(5, 5).is_err());
        assert!(KeyRange::new(10, 2).is_err());
    }

    #[test]
    #[should_panic]
    fn slice_index_out_of_bounds_panics() {
        let range = KeyRange::new(0, 10).unwrap();
        range.slice_for(3, 3);
    }
}
