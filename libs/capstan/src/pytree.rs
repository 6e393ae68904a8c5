//! Nested container trees with explicit absent leaves.
//!
//! A [`PyTree`] is an arbitrarily nested structure of ordered lists and keyed
//! maps whose leaves carry the values of interest. Absent leaves are tracked
//! positionally in the [`TreeSpec`] but excluded from the flat leaf sequence,
//! so numeric code downstream never sees them.
use std::collections::BTreeMap;

use crate::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum PyTree<T> {
    Leaf(T),
    Absent,
    List(Vec<PyTree<T>>),
    Map(BTreeMap<String, PyTree<T>>),
}

/// Reconstruction recipe for a flattened tree: container kinds, keys and
/// absent-leaf placement, with the leaf payloads stripped out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeSpec {
    Leaf,
    Absent,
    List(Vec<TreeSpec>),
    Map(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    /// Number of active (non-absent) leaves described by this spec.
    pub fn leaf_count(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Absent => 0,
            TreeSpec::List(items) => items.iter().map(TreeSpec::leaf_count).sum(),
            TreeSpec::Map(items) => items.iter().map(|(_, s)| s.leaf_count()).sum(),
        }
    }
}

impl<T> PyTree<T> {
    pub fn list(items: Vec<PyTree<T>>) -> Self {
        PyTree::List(items)
    }

    pub fn dict(items: impl IntoIterator<Item = (&'static str, PyTree<T>)>) -> Self {
        PyTree::Map(
            items
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn spec(&self) -> TreeSpec {
        match self {
            PyTree::Leaf(_) => TreeSpec::Leaf,
            PyTree::Absent => TreeSpec::Absent,
            PyTree::List(items) => TreeSpec::List(items.iter().map(PyTree::spec).collect()),
            PyTree::Map(items) => TreeSpec::Map(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.spec()))
                    .collect(),
            ),
        }
    }

    /// Flattens into the ordered active-leaf sequence plus the spec needed to
    /// rebuild the tree. Absent leaves are carried by the spec only.
    pub fn flatten(&self) -> (Vec<&T>, TreeSpec) {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        (leaves, self.spec())
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            PyTree::Leaf(v) => out.push(v),
            PyTree::Absent => {}
            PyTree::List(items) => items.iter().for_each(|t| t.collect_leaves(out)),
            PyTree::Map(items) => items.values().for_each(|t| t.collect_leaves(out)),
        }
    }

    pub fn into_flatten(self) -> (Vec<T>, TreeSpec) {
        let spec = self.spec();
        let mut leaves = Vec::new();
        self.collect_into(&mut leaves);
        (leaves, spec)
    }

    fn collect_into(self, out: &mut Vec<T>) {
        match self {
            PyTree::Leaf(v) => out.push(v),
            PyTree::Absent => {}
            PyTree::List(items) => items.into_iter().for_each(|t| t.collect_into(out)),
            PyTree::Map(items) => items.into_values().for_each(|t| t.collect_into(out)),
        }
    }

    /// Rebuilds a tree from a spec and exactly `spec.leaf_count()` leaves.
    pub fn unflatten(spec: &TreeSpec, leaves: Vec<T>) -> Result<Self, Error> {
        let expected = spec.leaf_count();
        if leaves.len() != expected {
            return Err(Error::LeafCountMismatch {
                expected,
                got: leaves.len(),
            });
        }
        let mut iter = leaves.into_iter();
        let tree = Self::build(spec, &mut iter)?;
        Ok(tree)
    }

    fn build(spec: &TreeSpec, leaves: &mut impl Iterator<Item = T>) -> Result<Self, Error> {
        match spec {
            TreeSpec::Leaf => leaves.next().map(PyTree::Leaf).ok_or(Error::LeafCountMismatch {
                expected: 1,
                got: 0,
            }),
            TreeSpec::Absent => Ok(PyTree::Absent),
            TreeSpec::List(items) => items
                .iter()
                .map(|s| Self::build(s, leaves))
                .collect::<Result<Vec<_>, _>>()
                .map(PyTree::List),
            TreeSpec::Map(items) => items
                .iter()
                .map(|(k, s)| Ok((k.clone(), Self::build(s, leaves)?)))
                .collect::<Result<BTreeMap<_, _>, Error>>()
                .map(PyTree::Map),
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> PyTree<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(&self, f: &mut impl FnMut(&T) -> U) -> PyTree<U> {
        match self {
            PyTree::Leaf(v) => PyTree::Leaf(f(v)),
            PyTree::Absent => PyTree::Absent,
            PyTree::List(items) => PyTree::List(items.iter().map(|t| t.map_inner(f)).collect()),
            PyTree::Map(items) => PyTree::Map(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_inner(f)))
                    .collect(),
            ),
        }
    }

    /// Leaf-wise map over two structurally identical trees.
    pub fn map2<U, V>(
        &self,
        other: &PyTree<U>,
        mut f: impl FnMut(&T, &U) -> V,
    ) -> Result<PyTree<V>, Error> {
        self.map2_inner(other, &mut f)
    }

    fn map2_inner<U, V>(
        &self,
        other: &PyTree<U>,
        f: &mut impl FnMut(&T, &U) -> V,
    ) -> Result<PyTree<V>, Error> {
        match (self, other) {
            (PyTree::Leaf(a), PyTree::Leaf(b)) => Ok(PyTree::Leaf(f(a, b))),
            (PyTree::Absent, PyTree::Absent) => Ok(PyTree::Absent),
            (PyTree::List(a), PyTree::List(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(x, y)| x.map2_inner(y, f))
                .collect::<Result<Vec<_>, _>>()
                .map(PyTree::List),
            (PyTree::Map(a), PyTree::Map(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|((ka, x), (kb, y))| {
                    if ka != kb {
                        return Err(Error::TreeStructureMismatch);
                    }
                    Ok((ka.clone(), x.map2_inner(y, f)?))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(PyTree::Map),
            _ => Err(Error::TreeStructureMismatch),
        }
    }

    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    /// True when the tree has no active leaves at all.
    pub fn is_empty(&self) -> bool {
        self.leaves().is_empty()
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            PyTree::Leaf(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PyTree<T>]> {
        match self {
            PyTree::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PyTree<T>> {
        match self {
            PyTree::Map(items) => items.get(key),
            _ => None,
        }
    }
}
