//! Word-addressed shared memory.
//!
//! A [`SharedRegion`] stands in for a worker group's block-local memory: a
//! flat array of 32-bit words that every lane of the group may read and write
//! concurrently. Words are individually atomic; payload words use relaxed
//! ordering and become visible to the rest of the group at the next group
//! barrier, the same contract block-local memory offers.

use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use smallvec::{SmallVec, smallvec};

use crate::types::{WORD_BYTES, record_words_of};

/// A record encoded as words. Records up to 32 bytes stay inline.
pub type RecordWords = SmallVec<[u32; 8]>;

/// Encodes a plain record into whole words, zero-padding the tail.
#[must_use]
pub fn encode_record<T: Pod>(record: &T) -> RecordWords {
    let bytes = bytemuck::bytes_of(record);
    let mut words: RecordWords = smallvec![0u32; record_words_of::<T>() as usize];
    bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
    words
}

/// Decodes a record from its word encoding.
///
/// # Panics
///
/// Panics if `words` is shorter than the record.
#[must_use]
pub fn decode_record<T: Pod>(words: &[u32]) -> T {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()])
}

/// A fixed-size array of atomically accessed words.
pub struct SharedRegion {
    words: Box<[AtomicU32]>,
}

impl SharedRegion {
    /// Allocates a zeroed region of at least `bytes` bytes.
    #[must_use]
    pub fn new(bytes: u32) -> Self {
        Self::with_words(bytes.div_ceil(WORD_BYTES))
    }

    /// Allocates a zeroed region of `words` words.
    #[must_use]
    pub fn with_words(words: u32) -> Self {
        Self {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Size in words.
    #[must_use]
    pub fn len_words(&self) -> u32 {
        self.words.len() as u32
    }

    /// Size in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> u32 {
        self.len_words() * WORD_BYTES
    }

    /// Returns the atomic cell of word `index`.
    #[inline]
    #[must_use]
    pub fn word(&self, index: u32) -> &AtomicU32 {
        &self.words[index as usize]
    }

    /// Relaxed load of word `index`.
    #[inline]
    #[must_use]
    pub fn load(&self, index: u32) -> u32 {
        self.words[index as usize].load(Ordering::Relaxed)
    }

    /// Relaxed store to word `index`.
    #[inline]
    pub fn store(&self, index: u32, value: u32) {
        self.words[index as usize].store(value, Ordering::Relaxed);
    }

    /// Zeroes `[start, start + len)`, each lane taking every `width`-th word.
    pub fn zero_strided(&self, start: u32, len: u32, lane: u32, width: u32) {
        let mut w = lane;
        while w < len {
            self.store(start + w, 0);
            w += width;
        }
    }

    /// Copies `len` words from `src` in this region to `dst` in `target`,
    /// each lane taking every `width`-th word.
    pub fn copy_strided(
        &self,
        src: u32,
        target: &SharedRegion,
        dst: u32,
        len: u32,
        lane: u32,
        width: u32,
    ) {
        let mut w = lane;
        while w < len {
            target.store(dst + w, self.load(src + w));
            w += width;
        }
    }

    /// Writes a whole record starting at word `at`.
    pub fn write_record<T: Pod>(&self, at: u32, record: &T) {
        for (i, word) in encode_record(record).iter().enumerate() {
            self.store(at + i as u32, *word);
        }
    }

    /// Writes the words of `record` whose index is congruent to `part`
    /// modulo `parts`, so `parts` lanes can share one record's copy.
    pub fn write_record_part(&self, at: u32, record: &[u32], part: u32, parts: u32) {
        let mut w = part;
        while (w as usize) < record.len() {
            self.store(at + w, record[w as usize]);
            w += parts.max(1);
        }
    }

    /// Reads a whole record starting at word `at`.
    #[must_use]
    pub fn read_record<T: Pod>(&self, at: u32) -> T {
        let words: RecordWords = (0..record_words_of::<T>())
            .map(|i| self.load(at + i))
            .collect();
        decode_record(&words)
    }

    /// Reads `len` raw words starting at `at`.
    #[must_use]
    pub fn read_words(&self, at: u32, len: u32) -> RecordWords {
        (0..len).map(|i| self.load(at + i)).collect()
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("bytes", &self.len_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Particle {
        x: f32,
        y: f32,
        id: u16,
        flags: u16,
    }

    #[test]
    fn test_region_sizes() {
        let region = SharedRegion::new(30);
        assert_eq!(region.len_words(), 8);
        assert_eq!(region.len_bytes(), 32);
    }

    #[test]
    fn test_record_encoding() {
        let p = Particle {
            x: 1.5,
            y: -2.0,
            id: 7,
            flags: 3,
        };
        let words = encode_record(&p);
        assert_eq!(words.len(), 3);
        assert_eq!(decode_record::<Particle>(&words), p);
    }

    #[test]
    fn test_odd_sized_record_padding() {
        let record = [1u8, 2, 3, 4, 5];
        let words = encode_record(&record);
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].to_ne_bytes(), [5, 0, 0, 0]);
        assert_eq!(decode_record::<[u8; 5]>(&words), record);
    }

    #[test]
    fn test_record_in_region() {
        let region = SharedRegion::with_words(16);
        let p = Particle {
            x: 0.25,
            y: 4.0,
            id: 11,
            flags: 0,
        };
        region.write_record(5, &p);
        assert_eq!(region.read_record::<Particle>(5), p);
        assert_eq!(region.load(4), 0);
        assert_eq!(region.load(8), 0);
    }

    #[test]
    fn test_record_parts_cover_all_words() {
        let region = SharedRegion::with_words(8);
        let record = [10u32, 11, 12, 13, 14];
        for part in 0..3 {
            region.write_record_part(1, &record, part, 3);
        }
        assert_eq!(region.read_words(1, 5).as_slice(), &record);
    }

    #[test]
    fn test_strided_copy_and_zero() {
        let a = SharedRegion::with_words(10);
        let b = SharedRegion::with_words(10);
        for i in 0..10 {
            a.store(i, i + 100);
        }
        for lane in 0..4 {
            a.copy_strided(2, &b, 0, 6, lane, 4);
        }
        assert_eq!(b.read_words(0, 6).as_slice(), &[102, 103, 104, 105, 106, 107]);

        for lane in 0..3 {
            a.zero_strided(0, 10, lane, 3);
        }
        assert!((0..10).all(|i| a.load(i) == 0));
    }
}
