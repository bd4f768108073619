//! Strided views over caller memory.
//!
//! Every batched entry point takes its inputs as [`Strided`] views so callers
//! can pass parallel arrays, interleaved array-of-struct layouts, or a single
//! broadcast value without copying. Strides are measured in elements over a
//! borrowed slice; stride 0 broadcasts one element to every logical position.

use crate::error::{Result, StoreError};

#[derive(Copy, Clone, Debug)]
pub struct Strided<'a, T> {
    data: &'a [T],
    stride: usize,
    count: usize,
}

impl<'a, T> Strided<'a, T> {
    /// A dense view: stride 1, one logical element per slice element.
    pub fn from_slice(data: &'a [T]) -> Self {
        Self {
            data,
            stride: 1,
            count: data.len(),
        }
    }

    /// A single element repeated `count` times.
    pub fn broadcast(item: &'a T, count: usize) -> Self {
        Self {
            data: std::slice::from_ref(item),
            stride: 0,
            count,
        }
    }

    /// A view walking `data` with the given element stride, e.g. every third
    /// element of an interleaved buffer.
    pub fn with_stride(data: &'a [T], stride: usize, count: usize) -> Result<Self> {
        if count > 0 {
            let span = if stride == 0 { 1 } else { (count - 1) * stride + 1 };
            if data.len() < span {
                return Err(StoreError::BadArgument("strided view exceeds its backing slice"));
            }
        }
        Ok(Self { data, stride, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.stride == 0
    }

    /// Element at logical position `i`. A broadcast serves any position;
    /// dense and interleaved views panic past `len()`, which batched entry
    /// points rule out by validating counts first.
    pub fn get(&self, i: usize) -> &'a T {
        if self.stride == 0 {
            return &self.data[0];
        }
        assert!(i < self.count, "strided index out of range");
        &self.data[i * self.stride]
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a T> + '_ {
        (0..self.count).map(move |i| self.get(i))
    }
}

/// Parallel-view count check: a companion view must either broadcast or carry
/// exactly the batch count.
pub(crate) fn expect_count<T>(view: &Strided<'_, T>, n: usize, what: &'static str) -> Result<()> {
    if view.is_broadcast() || view.len() == n {
        Ok(())
    } else {
        Err(StoreError::BadArgument(what))
    }
}
