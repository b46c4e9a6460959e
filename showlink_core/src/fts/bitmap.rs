/// Received-chunk tracking for one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: u32,
    set: u32,
}

impl ChunkBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
            set: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count(&self) -> u32 {
        self.set
    }

    pub fn is_complete(&self) -> bool {
        self.set == self.len
    }

    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Mark `index` as received. Returns false for duplicates and
    /// out-of-range indices.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len || self.is_set(index) {
            return false;
        }
        self.words[(index / 64) as usize] |= 1 << (index % 64);
        self.set += 1;
        true
    }

    /// Lowest chunk not yet received, `None` once complete.
    pub fn missing_chunk(&self) -> Option<u32> {
        self.words.iter().enumerate().find_map(|(i, word)| {
            if *word == u64::MAX {
                return None;
            }
            let index = i as u32 * 64 + (!word).trailing_zeros();
            (index < self.len).then_some(index)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_tracking() {
        let mut bitmap = ChunkBitmap::new(130);
        assert_eq!(bitmap.missing_chunk(), Some(0));
        assert!(bitmap.set(0));
        assert!(!bitmap.set(0));
        assert!(!bitmap.set(130));
        assert_eq!(bitmap.missing_chunk(), Some(1));

        for i in 0..130 {
            bitmap.set(i);
        }
        assert!(bitmap.is_complete());
        assert_eq!(bitmap.missing_chunk(), None);
        assert_eq!(ChunkBitmap::new(0).missing_chunk(), None);
    }

    proptest! {
        #[test]
        fn missing_chunk_is_lowest_unset(
            len in 1u32..400,
            picks in prop::collection::vec(any::<u32>(), 0..500),
        ) {
            let mut bitmap = ChunkBitmap::new(len);
            for pick in picks {
                bitmap.set(pick % len);
            }
            let expected = (0..len).find(|i| !bitmap.is_set(*i));
            prop_assert_eq!(bitmap.missing_chunk(), expected);
            prop_assert_eq!(bitmap.is_complete(), expected.is_none());
        }
    }
}
