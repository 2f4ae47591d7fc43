//! Container types with strongly-typed indexes.

/// Conversion between a strongly-typed index and a `usize`
pub trait Index {
    /// Wraps a raw position
    fn new(i: usize) -> Self;
    /// Returns the raw position
    fn get(&self) -> usize;
}

/// A `Vec<V>` with strongly-typed indexes, used to improve the type-safety
/// of data storage.
///
/// The `Index` type should be a wrapper around a `usize` and be convertible
/// in both directions; it is typically passed around using `Copy`.  A suitable
/// index type can be constructed with [define_index].
#[derive(Clone, Debug)]
pub struct IndexVec<V, I> {
    data: Vec<V>,
    _phantom: std::marker::PhantomData<fn(I) -> I>,
}

impl<V, I> Default for IndexVec<V, I> {
    fn default() -> Self {
        Self {
            data: vec![],
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<V, I: Index> IndexVec<V, I> {
    /// Appends a value, returning its index
    pub fn push(&mut self, v: V) -> I {
        let i = I::new(self.data.len());
        self.data.push(v);
        i
    }
    /// Looks up a value, returning `None` if the index is out of range
    pub fn get(&self, i: I) -> Option<&V> {
        self.data.get(i.get())
    }
    /// Iterates over `(index, value)` pairs in insertion order
    pub fn enumerate(&self) -> impl Iterator<Item = (I, &V)> {
        self.data.iter().enumerate().map(|(i, v)| (I::new(i), v))
    }
}

impl<V, I> IndexVec<V, I> {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn clear(&mut self) {
        self.data.clear()
    }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, V> {
        self.data.iter_mut()
    }
}

impl<V: Clone, I> IndexVec<V, I> {
    /// Resizes the container, filling new slots with `v`
    pub fn resize(&mut self, len: usize, v: V) {
        self.data.resize(len, v)
    }
    /// Overwrites every slot with `v`
    pub fn fill(&mut self, v: V) {
        self.data.fill(v)
    }
}

impl<V, I> std::iter::IntoIterator for IndexVec<V, I> {
    type Item = V;
    type IntoIter = std::vec::IntoIter<V>;
    fn into_iter(self) -> Self::IntoIter {
        self.data.into_iter()
    }
}

impl<V, I> FromIterator<V> for IndexVec<V, I> {
    fn from_iter<T: IntoIterator<Item = V>>(iter: T) -> Self {
        Vec::from_iter(iter).into()
    }
}

impl<V, I> std::ops::Index<I> for IndexVec<V, I>
where
    I: Index,
{
    type Output = V;
    fn index(&self, i: I) -> &V {
        &self.data[i.get()]
    }
}

impl<V, I> std::ops::IndexMut<I> for IndexVec<V, I>
where
    I: Index,
{
    fn index_mut(&mut self, i: I) -> &mut V {
        &mut self.data[i.get()]
    }
}

impl<V, I> From<Vec<V>> for IndexVec<V, I> {
    fn from(data: Vec<V>) -> Self {
        Self {
            data,
            _phantom: std::marker::PhantomData,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Defines an index type suitable for use in an [`IndexVec`].
macro_rules! define_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Copy, Clone, Default, Debug, Eq, PartialEq, Hash, Ord, PartialOrd,
        )]
        pub struct $name(usize);
        impl crate::graph::indexed::Index for $name {
            fn new(i: usize) -> Self {
                Self(i)
            }
            fn get(&self) -> usize {
                self.0
            }
        }
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}
pub(crate) use define_index;

#[cfg(test)]
mod test {
    use super::*;

    define_index!(Slot, "Test index");

    #[test]
    fn index_vec_push_get() {
        let mut v: IndexVec<&str, Slot> = IndexVec::default();
        let a = v.push("a");
        let b = v.push("b");
        assert_eq!(v[a], "a");
        assert_eq!(v[b], "b");
        assert_eq!(v.len(), 2);
        assert!(v.get(Slot::new(2)).is_none());
        assert_eq!(
            v.enumerate().map(|(i, _)| i).collect::<Vec<_>>(),
            vec![a, b]
        );
    }
}
