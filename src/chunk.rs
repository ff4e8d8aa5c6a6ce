//! Splits a length into a given number of roughly-even, contiguous,
//! non-overlapping `[start, end)` ranges. Shared by [`crate::amap`] and
//! [`crate::reduce`], whose chunk counts are bounded by pool size rather
//! than driven by a work-unit cursor like [`crate::foreach`]'s.

/// Splits `0..len` into at most `chunks` pieces, distributing the
/// remainder across the first pieces so no two pieces differ in width by
/// more than one. Degenerates to fewer, wider pieces if `len < chunks`, and
/// returns an empty `Vec` for `len == 0`.
pub(crate) fn bounds(len: usize, chunks: usize) -> Vec<(usize, usize)> {
    if len == 0 {
        return Vec::new();
    }
    let chunks = chunks.max(1).min(len);
    let base = len / chunks;
    let extra = len % chunks;

    let mut result = Vec::with_capacity(chunks);
    let mut start = 0;
    for i in 0..chunks {
        let width = base + usize::from(i < extra);
        let end = start + width;
        result.push((start, end));
        start = end;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split() {
        assert_eq!(bounds(10, 5), vec![(0, 2), (2, 4), (4, 6), (6, 8), (8, 10)]);
    }

    #[test]
    fn remainder_goes_to_first_chunks() {
        assert_eq!(bounds(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn fewer_items_than_chunks_degenerates() {
        assert_eq!(bounds(2, 8), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn empty_is_empty() {
        assert_eq!(bounds(0, 4), Vec::<(usize, usize)>::new());
    }

    #[test]
    fn covers_the_whole_range_contiguously() {
        let b = bounds(37, 6);
        assert_eq!(b.first().unwrap().0, 0);
        assert_eq!(b.last().unwrap().1, 37);
        for w in b.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }
}
