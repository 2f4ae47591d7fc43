//! Compact descriptions of integer index mappings
//!
//! Loops address their independents and output locations through an
//! [`IndexPattern`], which maps a loop iteration (and possibly a second
//! index, e.g. a Hessian row) to a position.  Detection always picks the most
//! specific exact representation: linear, then sectioned, then an explicit
//! lookup table.
use std::collections::BTreeMap;

/// `y = ((x - x_offset) / dx) * dy + b`, with integer division
///
/// A constant pattern has `dy == 0`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinearPattern {
    pub x_offset: i64,
    pub dx: i64,
    pub dy: i64,
    pub b: i64,
}

impl LinearPattern {
    /// Builds a constant pattern
    pub fn constant(y: usize) -> Self {
        Self {
            x_offset: 0,
            dx: 1,
            dy: 0,
            b: y as i64,
        }
    }

    /// Evaluates the pattern, returning `None` for negative results
    pub fn evaluate(&self, x: usize) -> Option<usize> {
        let v = ((x as i64 - self.x_offset).div_euclid(self.dx)) * self.dy
            + self.b;
        usize::try_from(v).ok()
    }

    /// Finds a linear pattern matching every entry of the map
    pub fn detect(map: &BTreeMap<usize, usize>) -> Option<Self> {
        let mut iter = map.iter();
        let (&x0, &y0) = iter.next()?;
        let Some((&x1, &y1)) = iter.next() else {
            return Some(Self::constant(y0));
        };

        let (x0i, y0i) = (x0 as i64, y0 as i64);
        let (x1i, y1i) = (x1 as i64, y1 as i64);

        // Integer slope through the first two points
        if (y1i - y0i) % (x1i - x0i) == 0 {
            let dy = (y1i - y0i) / (x1i - x0i);
            let p = Self {
                x_offset: 0,
                dx: 1,
                dy,
                b: y0i - dy * x0i,
            };
            if p.matches(map) {
                return Some(p);
            }
        }

        // Staircase: plateaus of constant width `dx`, found from the first
        // two value changes
        let changes: Vec<usize> = map
            .iter()
            .zip(map.iter().skip(1))
            .filter(|((_, ya), (_, yb))| ya != yb)
            .map(|(_, (xb, _))| *xb)
            .take(2)
            .collect();
        let (&first, &second) = (changes.first()?, changes.get(1)?);
        let dx = (second - first) as i64;
        let dy = *map.get(&first)? as i64 - y0i;
        let p = Self {
            x_offset: first as i64 - dx,
            dx,
            dy,
            b: y0i - (x0i - (first as i64 - dx)).div_euclid(dx) * dy,
        };
        p.matches(map).then_some(p)
    }

    fn matches(&self, map: &BTreeMap<usize, usize>) -> bool {
        self.dx > 0
            && map.iter().all(|(x, y)| self.evaluate(*x) == Some(*y))
    }
}

/// Pattern over one or two indexes
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexPattern {
    Linear(LinearPattern),
    /// Piecewise linear; each section applies from its start to the next one
    Sectioned(BTreeMap<usize, LinearPattern>),
    /// `y = f(x) + g(z)`, where missing terms are zero
    Plane2D {
        x: Option<Box<IndexPattern>>,
        z: Option<Box<IndexPattern>>,
    },
    Random1D(BTreeMap<usize, usize>),
    Random2D(BTreeMap<usize, BTreeMap<usize, usize>>),
}

impl IndexPattern {
    /// Builds a constant pattern
    pub fn constant(y: usize) -> Self {
        IndexPattern::Linear(LinearPattern::constant(y))
    }

    /// Detects a pattern for a dense table, indexed by position
    pub fn detect_slice(values: &[usize]) -> Self {
        Self::detect(&values.iter().copied().enumerate().collect())
    }

    /// Detects the most specific pattern matching every entry of the map
    ///
    /// Values for keys that are absent from the map are unspecified.
    pub fn detect(map: &BTreeMap<usize, usize>) -> Self {
        if let Some(p) = LinearPattern::detect(map) {
            return IndexPattern::Linear(p);
        }
        let sections = Self::split_sections(map);
        if sections.len() * 3 <= map.len() {
            IndexPattern::Sectioned(sections)
        } else {
            IndexPattern::Random1D(map.clone())
        }
    }

    /// Splits a map into maximal linear runs, greedily from the start
    fn split_sections(
        map: &BTreeMap<usize, usize>,
    ) -> BTreeMap<usize, LinearPattern> {
        let mut out = BTreeMap::new();
        let mut run = BTreeMap::new();
        let mut current = None;
        for (&x, &y) in map {
            run.insert(x, y);
            match LinearPattern::detect(&run) {
                Some(p) => current = Some(p),
                None => {
                    let start = *run.keys().next().unwrap_or(&x);
                    if let Some(p) = current {
                        out.insert(start, p);
                    }
                    run.clear();
                    run.insert(x, y);
                    current = Some(LinearPattern::constant(y));
                }
            }
        }
        if let (Some(p), Some(start)) = (current, run.keys().next()) {
            out.insert(*start, p);
        }
        out
    }

    /// Detects a `y = f(x) + g(z)` pattern over a two-level map
    ///
    /// `f` is taken from the first `z` entry of each `x`, which must be the
    /// same `z` everywhere; `g` is then the (shared) offset from it.  Returns
    /// `None` if the map is not a plane.
    pub fn detect_plane_2d(
        map: &BTreeMap<usize, BTreeMap<usize, usize>>,
    ) -> Option<Self> {
        let mut start = BTreeMap::new();
        let mut offsets: BTreeMap<usize, usize> = BTreeMap::new();
        let mut z0 = None;
        for (&x, row) in map {
            let (&zf, &yf) = row.iter().next()?;
            if *z0.get_or_insert(zf) != zf {
                return None;
            }
            start.insert(x, yf);
            for (&z, &y) in row {
                let d = y.checked_sub(yf)?;
                if *offsets.entry(z).or_insert(d) != d {
                    return None;
                }
            }
        }
        let f = Self::detect(&start);
        if matches!(f, IndexPattern::Random1D(..)) {
            return None;
        }
        let f = if f == IndexPattern::constant(0) {
            None
        } else {
            Some(Box::new(f))
        };
        let g = if offsets.values().all(|d| *d == 0) {
            None
        } else {
            let g = Self::detect(&offsets);
            if matches!(g, IndexPattern::Random1D(..)) {
                return None;
            }
            Some(Box::new(g))
        };
        Some(IndexPattern::Plane2D { x: f, z: g })
    }

    /// Detects a two-index pattern, falling back to an explicit table
    pub fn detect_2d(map: &BTreeMap<usize, BTreeMap<usize, usize>>) -> Self {
        Self::detect_plane_2d(map)
            .unwrap_or_else(|| IndexPattern::Random2D(map.clone()))
    }

    /// Number of indexes consumed by this pattern
    pub fn dimensions(&self) -> usize {
        match self {
            IndexPattern::Plane2D { .. } | IndexPattern::Random2D(..) => 2,
            _ => 1,
        }
    }

    /// Checks whether the pattern yields the same value everywhere
    pub fn is_constant(&self) -> bool {
        match self {
            IndexPattern::Linear(p) => p.dy == 0,
            IndexPattern::Sectioned(..) => false,
            IndexPattern::Plane2D { x, z } => {
                x.as_ref().is_none_or(|p| p.is_constant())
                    && z.as_ref().is_none_or(|p| p.is_constant())
            }
            IndexPattern::Random1D(m) => {
                m.values().collect::<std::collections::BTreeSet<_>>().len()
                    <= 1
            }
            IndexPattern::Random2D(..) => false,
        }
    }

    /// Returns the constant value, if [`is_constant`](Self::is_constant)
    pub fn constant_value(&self) -> Option<usize> {
        match self {
            IndexPattern::Linear(p) if p.dy == 0 => usize::try_from(p.b).ok(),
            _ => None,
        }
    }

    /// Evaluates the pattern for the given indexes
    ///
    /// One-dimensional patterns read `indexes[0]`; two-dimensional patterns
    /// read `indexes[0]` (x) and `indexes[1]` (z).
    pub fn evaluate(&self, indexes: &[usize]) -> Option<usize> {
        let x = *indexes.first()?;
        match self {
            IndexPattern::Linear(p) => p.evaluate(x),
            IndexPattern::Sectioned(s) => {
                s.range(..=x).next_back().and_then(|(_, p)| p.evaluate(x))
            }
            IndexPattern::Random1D(m) => m.get(&x).copied(),
            IndexPattern::Plane2D { x: f, z: g } => {
                let z = *indexes.get(1)?;
                let a = match f {
                    Some(f) => f.evaluate(&[x])?,
                    None => 0,
                };
                let b = match g {
                    Some(g) => g.evaluate(&[z])?,
                    None => 0,
                };
                Some(a + b)
            }
            IndexPattern::Random2D(m) => {
                let z = *indexes.get(1)?;
                m.get(&x)?.get(&z).copied()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn map(v: &[(usize, usize)]) -> BTreeMap<usize, usize> {
        v.iter().copied().collect()
    }

    #[test]
    fn detect_linear() {
        let p = IndexPattern::detect_slice(&[3, 5, 7, 9]);
        assert_eq!(
            p,
            IndexPattern::Linear(LinearPattern {
                x_offset: 0,
                dx: 1,
                dy: 2,
                b: 3
            })
        );
        assert!(IndexPattern::detect_slice(&[4, 4, 4]).is_constant());
        assert_eq!(IndexPattern::detect_slice(&[4]).constant_value(), Some(4));
    }

    #[test]
    fn detect_negative_offset() {
        // j = i - 1 on iterations 1..4
        let m = map(&[(1, 0), (2, 1), (3, 2)]);
        let p = IndexPattern::detect(&m);
        assert!(matches!(p, IndexPattern::Linear(..)));
        for (x, y) in m {
            assert_eq!(p.evaluate(&[x]), Some(y));
        }
    }

    #[test]
    fn detect_staircase() {
        let values = [5, 5, 5, 8, 8, 8, 11, 11, 11, 14];
        let p = IndexPattern::detect_slice(&values);
        let IndexPattern::Linear(l) = p else {
            panic!("expected linear pattern, got {p:?}");
        };
        assert_eq!(l.dx, 3);
        assert_eq!(l.dy, 3);
        for (x, y) in values.iter().enumerate() {
            assert_eq!(l.evaluate(x), Some(*y));
        }

        // Partial first plateau
        let values = [0, 2, 2, 4, 4, 6];
        let p = IndexPattern::detect_slice(&values);
        assert!(matches!(p, IndexPattern::Linear(..)));
        for (x, y) in values.iter().enumerate() {
            assert_eq!(p.evaluate(&[x]), Some(*y));
        }
    }

    #[test]
    fn detect_sectioned() {
        let values = [0, 1, 2, 10, 11, 12];
        let p = IndexPattern::detect_slice(&values);
        let IndexPattern::Sectioned(s) = &p else {
            panic!("expected sectioned pattern, got {p:?}");
        };
        assert_eq!(s.len(), 2);
        assert_eq!(s.keys().copied().collect::<Vec<_>>(), vec![0, 3]);
        for (x, y) in values.iter().enumerate() {
            assert_eq!(p.evaluate(&[x]), Some(*y));
        }
    }

    #[test]
    fn detect_random() {
        let p = IndexPattern::detect_slice(&[5, 3, 9, 1]);
        assert!(matches!(p, IndexPattern::Random1D(..)));
        assert_eq!(p.evaluate(&[2]), Some(9));
        assert_eq!(p.evaluate(&[4]), None);
    }

    #[test]
    fn detect_plane() {
        // jrow -> local iteration -> iteration, with iteration = jrow - 1 + lit
        let mut m = BTreeMap::new();
        for jrow in 1..5 {
            let row: BTreeMap<usize, usize> =
                (0..2).map(|lit| (lit, jrow - 1 + lit)).collect();
            m.insert(jrow, row);
        }
        let p = IndexPattern::detect_2d(&m);
        assert!(matches!(p, IndexPattern::Plane2D { .. }));
        assert_eq!(p.dimensions(), 2);
        for (jrow, row) in &m {
            for (lit, it) in row {
                assert_eq!(p.evaluate(&[*jrow, *lit]), Some(*it));
            }
        }
    }

    #[test]
    fn detect_plane_fallback() {
        let mut m = BTreeMap::new();
        m.insert(0, map(&[(0, 4), (1, 0)]));
        m.insert(1, map(&[(0, 1), (1, 9)]));
        let p = IndexPattern::detect_2d(&m);
        assert!(matches!(p, IndexPattern::Random2D(..)));
        assert_eq!(p.evaluate(&[1, 1]), Some(9));
    }

    #[test]
    fn round_trip_random_tables() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(123);
        for _ in 0..200 {
            let len = rng.gen_range(1..20);
            let kind = rng.gen_range(0..3);
            let values: Vec<usize> = (0..len)
                .map(|i| match kind {
                    0 => 7 + 3 * i,
                    1 => 2 * (i / 4) + 1,
                    _ => rng.gen_range(0..50),
                })
                .collect();
            let m: BTreeMap<usize, usize> = values
                .iter()
                .enumerate()
                .filter(|_| rng.gen_bool(0.8))
                .map(|(i, v)| (i, *v))
                .collect();
            let p = IndexPattern::detect(&m);
            for (x, y) in &m {
                assert_eq!(p.evaluate(&[*x]), Some(*y), "{p:?} for {m:?}");
            }
        }
    }
}
