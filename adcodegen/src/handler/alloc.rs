use std::collections::{BTreeMap, BTreeSet};

/// Best-fit allocator for contiguous blocks of array slots
///
/// Free space is tracked as closed intervals `[start, end]`, indexed both by
/// start and by end so that a released block can be merged with its
/// neighbours in either direction.  Slots are numbered from 0; `size` is the
/// high-water mark, i.e. the number of slots ever handed out.
#[derive(Default, Debug)]
pub struct ArrayAllocator {
    free_by_start: BTreeMap<usize, usize>,
    free_by_end: BTreeMap<usize, usize>,
    size: usize,
}

impl ArrayAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of slots required so far
    pub fn size(&self) -> usize {
        self.size
    }

    /// Iterates over free intervals as `(start, end)` pairs
    pub fn free_intervals(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_by_start.iter().map(|(s, e)| (*s, *e))
    }

    /// Returns a block of `len` slots to the free pool
    pub fn release(&mut self, start: usize, len: usize) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut end = start + len - 1;

        if start > 0 {
            if let Some(prev_start) = self.free_by_end.remove(&(start - 1)) {
                self.free_by_start.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.free_by_start.remove(&(end + 1)) {
            self.free_by_end.remove(&next_end);
            end = next_end;
        }
        self.free_by_start.insert(start, end);
        self.free_by_end.insert(end, start);
    }

    /// Reserves a block of `len` slots, returning its first slot
    ///
    /// Blocks that contain any `blacklist` slot are never used; this keeps an
    /// array from being built on top of the elements it reads.
    ///
    /// In order of preference, picks an exact fit, the smallest larger free
    /// block, a free block touching the high-water mark (extending it), or
    /// fresh slots past the high-water mark.
    pub fn reserve(&mut self, len: usize, blacklist: &BTreeSet<usize>) -> usize {
        if len == 0 {
            return self.size;
        }

        let mut best: Option<(usize, usize)> = None;
        for (&start, &end) in self.free_by_start.iter().rev() {
            let space = end - start + 1;
            if space < len || blacklist.range(start..=end).next().is_some() {
                continue;
            }
            if space == len {
                best = Some((start, end));
                break;
            }
            match best {
                Some((s, e)) if e - s + 1 <= space => (),
                _ => best = Some((start, end)),
            }
        }

        if let Some((start, end)) = best {
            self.free_by_start.remove(&start);
            self.free_by_end.remove(&end);
            if end - start + 1 > len {
                let rest = start + len;
                self.free_by_start.insert(rest, end);
                self.free_by_end.insert(end, rest);
            }
            return start;
        }

        // Extend a free block that ends at the high-water mark
        if self.size > 0 {
            if let Some(&start) = self.free_by_end.get(&(self.size - 1)) {
                if blacklist.range(start..).next().is_none() {
                    self.free_by_end.remove(&(self.size - 1));
                    self.free_by_start.remove(&start);
                    self.size = start + len;
                    return start;
                }
            }
        }

        let start = self.size;
        self.size += len;
        start
    }
}
