//! Ragged shapes and ragged tensors.
//!
//! A ragged shape with `n` axes is a list of `n - 1` layers; layer `i` maps
//! axis `i` rows to axis `i + 1` elements through a `row_splits` array and
//! its inverse `row_ids` array. The invariants are the usual ones:
//! `row_splits` starts at 0 and is non-decreasing, `row_ids` is monotone, and
//! `row_ids[row_splits[i]] == i` for every non-empty row.
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShapeLayer {
    row_splits: Vec<usize>,
    row_ids: Vec<usize>,
}

impl ShapeLayer {
    fn from_row_splits(row_splits: Vec<usize>) -> Result<Self> {
        if row_splits.first() != Some(&0) {
            return Err(Error::ShapeMismatch {
                op: "from_row_splits",
                expected: "row_splits starting at 0".to_string(),
                got: format!("{:?}", row_splits.first()),
            }
            .bt());
        }
        if row_splits.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::ShapeMismatch {
                op: "from_row_splits",
                expected: "non-decreasing row_splits".to_string(),
                got: format!("{row_splits:?}"),
            }
            .bt());
        }
        let row_ids = row_splits_to_row_ids(&row_splits);
        Ok(Self {
            row_splits,
            row_ids,
        })
    }
}

/// Converts a row-splits array to the equivalent row-ids array.
pub fn row_splits_to_row_ids(row_splits: &[usize]) -> Vec<usize> {
    let mut row_ids = Vec::with_capacity(*row_splits.last().unwrap_or(&0));
    for (row, w) in row_splits.windows(2).enumerate() {
        row_ids.extend(std::iter::repeat(row).take(w[1] - w[0]));
    }
    row_ids
}

/// Converts a monotone row-ids array back to row-splits for `num_rows` rows.
pub fn row_ids_to_row_splits(row_ids: &[usize], num_rows: usize) -> Vec<usize> {
    let mut row_splits = vec![0usize; num_rows + 1];
    for &row in row_ids.iter() {
        row_splits[row + 1] += 1;
    }
    for i in 1..=num_rows {
        row_splits[i] += row_splits[i - 1];
    }
    row_splits
}

/// Exclusive prefix sum; the result has one more element than the input and
/// its last element is the total.
pub fn exclusive_sum(counts: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0usize;
    out.push(0);
    for &c in counts {
        acc += c;
        out.push(acc);
    }
    out
}

/// Max over each sublist delimited by `row_splits`; empty sublists yield
/// `f32::NEG_INFINITY`.
pub fn max_per_sublist(values: &[f32], row_splits: &[usize]) -> Vec<f32> {
    row_splits
        .windows(2)
        .map(|w| {
            values[w[0]..w[1]]
                .iter()
                .fold(f32::NEG_INFINITY, |m, &v| m.max(v))
        })
        .collect()
}

/// A renumbering induced by a keep-mask: `new2old` lists the surviving old
/// indices in order, `old2new` maps each old index to its new index or -1.
#[derive(Debug, Clone)]
pub struct Renumbering {
    pub new2old: Vec<usize>,
    pub old2new: Vec<i32>,
}

impl Renumbering {
    pub fn from_keep(keep: &[bool]) -> Self {
        let mut new2old = Vec::with_capacity(keep.len());
        let mut old2new = Vec::with_capacity(keep.len());
        for (old, &k) in keep.iter().enumerate() {
            if k {
                old2new.push(new2old.len() as i32);
                new2old.push(old);
            } else {
                old2new.push(-1);
            }
        }
        Self { new2old, old2new }
    }

    pub fn num_new(&self) -> usize {
        self.new2old.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaggedShape {
    layers: Vec<ShapeLayer>,
}

impl RaggedShape {
    /// A two-axis shape from its row-splits.
    pub fn from_row_splits(row_splits: Vec<usize>) -> Result<Self> {
        Ok(Self {
            layers: vec![ShapeLayer::from_row_splits(row_splits)?],
        })
    }

    /// A two-axis regular shape: `dim0` rows of `dim1` elements each.
    pub fn regular(dim0: usize, dim1: usize) -> Self {
        let row_splits: Vec<usize> = (0..=dim0).map(|i| i * dim1).collect();
        Self {
            layers: vec![ShapeLayer {
                row_ids: row_splits_to_row_ids(&row_splits),
                row_splits,
            }],
        }
    }

    /// Appends `inner`'s axes below `outer`'s; `outer`'s element count must
    /// equal `inner`'s row count.
    pub fn compose(outer: &RaggedShape, inner: &RaggedShape) -> Result<Self> {
        if outer.tot_size(outer.num_axes() - 1) != inner.dim0() {
            return Err(Error::ShapeMismatch {
                op: "compose",
                expected: format!("{} rows", outer.tot_size(outer.num_axes() - 1)),
                got: format!("{} rows", inner.dim0()),
            }
            .bt());
        }
        let mut layers = outer.layers.clone();
        layers.extend(inner.layers.iter().cloned());
        Ok(Self { layers })
    }

    pub fn num_axes(&self) -> usize {
        self.layers.len() + 1
    }

    pub fn dim0(&self) -> usize {
        self.layers[0].row_splits.len() - 1
    }

    /// Total number of elements on `axis`.
    pub fn tot_size(&self, axis: usize) -> usize {
        if axis == 0 {
            self.dim0()
        } else {
            *self.layers[axis - 1].row_splits.last().unwrap()
        }
    }

    /// Row-splits mapping axis `axis - 1` to axis `axis` (`1 <= axis < num_axes`).
    pub fn row_splits(&self, axis: usize) -> &[usize] {
        &self.layers[axis - 1].row_splits
    }

    /// Row-ids mapping axis `axis` elements back to axis `axis - 1` rows.
    pub fn row_ids(&self, axis: usize) -> &[usize] {
        &self.layers[axis - 1].row_ids
    }

    pub fn row_range(&self, axis: usize, row: usize) -> std::ops::Range<usize> {
        let splits = self.row_splits(axis);
        splits[row]..splits[row + 1]
    }

    /// Debug-build invariant checks; compiled to nothing in release.
    pub(crate) fn debug_validate(&self) {
        for layer in self.layers.iter() {
            debug_assert_eq!(layer.row_splits.first(), Some(&0));
            debug_assert!(layer.row_splits.windows(2).all(|w| w[0] <= w[1]));
            debug_assert_eq!(layer.row_ids.len(), *layer.row_splits.last().unwrap());
            for (row, w) in layer.row_splits.windows(2).enumerate() {
                if w[1] > w[0] {
                    debug_assert_eq!(layer.row_ids[w[0]], row);
                }
            }
        }
        for w in self.layers.windows(2) {
            debug_assert_eq!(*w[0].row_splits.last().unwrap(), w[1].row_splits.len() - 1);
        }
    }
}

/// A ragged tensor: a shape plus the values on its last axis.
#[derive(Debug, Clone)]
pub struct Ragged<T> {
    pub shape: RaggedShape,
    pub values: Vec<T>,
}

impl<T> Ragged<T> {
    pub fn new(shape: RaggedShape, values: Vec<T>) -> Result<Self> {
        let expected = shape.tot_size(shape.num_axes() - 1);
        if values.len() != expected {
            return Err(Error::ShapeMismatch {
                op: "ragged_new",
                expected: format!("{expected} values"),
                got: format!("{} values", values.len()),
            }
            .bt());
        }
        shape.debug_validate();
        Ok(Self { shape, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
