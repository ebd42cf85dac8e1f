use std::cmp::max;
use std::collections::BTreeMap;

/// End of the contiguous prefix of completed chunks.
///
/// Chunks may complete in any order; completed ranges past the prefix are
/// remembered until the gap before them is filled.
#[derive(Debug)]
pub(crate) struct Watermark {
    position: u64,
    /// start -> end of completed ranges beyond `position`.
    ahead: BTreeMap<u64, u64>,
}

impl Watermark {
    pub(crate) fn new(start: u64) -> Self {
        Self {
            position: start,
            ahead: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self) -> u64 {
        self.position
    }

    /// Record that `[start, end)` is durably applied.
    pub(crate) fn complete(&mut self, start: u64, end: u64) {
        if start > self.position {
            let slot = self.ahead.entry(start).or_insert(end);
            *slot = max(*slot, end);
            return;
        }

        self.position = max(self.position, end);

        while let Some(entry) = self.ahead.first_entry() {
            if *entry.key() > self.position {
                break;
            }
            self.position = max(self.position, entry.remove());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order() {
        let mut watermark = Watermark::new(0);
        watermark.complete(0, 10);
        watermark.complete(10, 20);
        assert_eq!(watermark.get(), 20);
    }

    #[test]
    fn out_of_order_waits_for_gap() {
        let mut watermark = Watermark::new(0);

        watermark.complete(20, 30);
        watermark.complete(10, 20);
        assert_eq!(watermark.get(), 0);

        watermark.complete(0, 10);
        assert_eq!(watermark.get(), 30);
    }

    #[test]
    fn short_chunk_leaves_gap() {
        let mut watermark = Watermark::new(100);

        // Chunk [100, 110) came back with only 4 bytes.
        watermark.complete(100, 104);
        watermark.complete(110, 120);
        assert_eq!(watermark.get(), 104);

        // The remainder is re-requested.
        watermark.complete(104, 110);
        assert_eq!(watermark.get(), 120);
    }
}
