use std::ops::Range;

/// Coordinates over `N` nested axes, the first axis being the outermost one.
///
/// All axis extents must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdIndex<const N: usize> {
    dims: [usize; N],
    coords: [usize; N],
}

impl<const N: usize> NdIndex<N> {
    /// Mixed-radix decoding of `flat`, the innermost axis varies fastest.
    pub fn init(flat: usize, dims: [usize; N]) -> Self {
        let mut coords = [0; N];
        let mut rem = flat;
        for i in (0..N).rev() {
            coords[i] = rem % dims[i];
            rem /= dims[i];
        }
        Self { dims, coords }
    }

    pub fn coords(&self) -> [usize; N] {
        self.coords
    }

    pub fn dims(&self) -> [usize; N] {
        self.dims
    }

    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }

    /// Mixed-radix encoding, the inverse of `init`.
    pub fn flat(&self) -> usize {
        self.coords.iter().zip(self.dims.iter()).fold(0, |acc, (c, d)| acc * d + c)
    }

    /// Moves the coordinates by `n` positions, carrying into the outer axes. Moving past the
    /// last position wraps around to the first one.
    pub fn advance_by(mut self, n: usize) -> Self {
        let mut carry = n;
        for i in (0..N).rev() {
            if carry == 0 {
                break;
            }
            let v = self.coords[i] + carry;
            self.coords[i] = v % self.dims[i];
            carry = v / self.dims[i];
        }
        self
    }

    /// Consumes the flat `range` up to the end of the innermost axis.
    ///
    /// Returns the remaining range together with the coordinates of its first element. The
    /// number of consumed items is `min(range.len(), dims[N-1] - coords[N-1])`, so walking a
    /// range with `advance` visits each innermost run exactly once.
    pub fn advance(self, range: Range<usize>) -> (Range<usize>, Self) {
        if range.is_empty() || N == 0 {
            return (range, self);
        }
        let inner = N - 1;
        let consumed = range.len().min(self.dims[inner] - self.coords[inner]);
        (range.start + consumed..range.end, self.advance_by(consumed))
    }

    /// Number of items `advance` would consume from `range`.
    pub fn run_len(&self, range: &Range<usize>) -> usize {
        match N {
            0 => range.len(),
            _ => range.len().min(self.dims[N - 1] - self.coords[N - 1]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_and_carry() {
        let idx = NdIndex::init(47, [1, 2, 4, 3, 2]);
        assert_eq!(idx.coords(), [0, 1, 3, 2, 1]);
        let idx = idx.advance_by(1);
        assert_eq!(idx.coords(), [0, 0, 0, 0, 0]);

        let idx = NdIndex::init(5, [2, 3, 2]);
        assert_eq!(idx.coords(), [0, 2, 1]);
        assert_eq!(idx.advance_by(1).coords(), [1, 0, 0]);
        assert_eq!(idx.advance_by(4).coords(), [1, 1, 1]);
    }

    #[test]
    fn advance_stops_at_inner_edge() {
        let idx = NdIndex::init(3, [2, 3, 4]);
        let (r, idx) = idx.advance(3..20);
        assert_eq!(r, 4..20);
        assert_eq!(idx.coords(), [0, 1, 0]);
        let (r, idx) = idx.advance(r);
        assert_eq!(r, 8..20);
        assert_eq!(idx.coords(), [0, 2, 0]);
        let (r, idx) = idx.advance(8..10);
        assert_eq!(r, 10..10);
        assert_eq!(idx.coords(), [0, 2, 2]);
        let (r, same) = idx.advance(r);
        assert!(r.is_empty());
        assert_eq!(same, idx);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            dims in proptest::array::uniform4(1usize..6),
            seed in 0usize..10_000,
        ) {
            let idx = NdIndex::init(0, dims);
            let flat = seed % idx.volume();
            let idx = NdIndex::init(flat, dims);
            prop_assert_eq!(idx.flat(), flat);
            for (c, d) in idx.coords().iter().zip(dims.iter()) {
                prop_assert!(c < d);
            }
        }

        #[test]
        fn prop_advance_by_matches_decode(
            dims in proptest::array::uniform3(1usize..7),
            start in 0usize..300,
            n in 0usize..300,
        ) {
            let volume: usize = dims.iter().product();
            let idx = NdIndex::init(start % volume, dims).advance_by(n);
            prop_assert_eq!(idx.flat(), (start % volume + n) % volume);
        }

        #[test]
        fn prop_walk_visits_decoded_indices(
            dims in proptest::array::uniform4(1usize..5),
            a in 0usize..1000,
            b in 0usize..1000,
        ) {
            let volume: usize = dims.iter().product();
            let (lo, hi) = (a.min(b) % (volume + 1), a.max(b) % (volume + 1));
            let (lo, hi) = (lo.min(hi), lo.max(hi));
            let mut range = lo..hi;
            let mut idx = NdIndex::init(lo, dims);
            let mut visited = vec![];
            while !range.is_empty() {
                let run = idx.run_len(&range);
                prop_assert!(run >= 1);
                for k in 0..run {
                    let mut c = idx.coords();
                    c[3] += k;
                    visited.push(c);
                }
                (range, idx) = idx.advance(range);
            }
            let expected: Vec<_> = (lo..hi).map(|i| NdIndex::init(i, dims).coords()).collect();
            prop_assert_eq!(visited, expected);
        }
    }
}
