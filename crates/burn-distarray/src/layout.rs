//! Extents, alignment padding and linearization of a dense N-dimensional array.
//!
//! Axis `0` is the highest-order axis and axis `D - 1` the lowest-order one
//! (row-major): consecutive elements of the lowest-order axis are adjacent in
//! memory.

/// Alignment request for the lowest-order axis of an array.
///
/// The array is padded at the front so that the element at logical index
/// `position` of the lowest-order axis starts on an `alignment`-element
/// boundary, and the lowest-order axis is then rounded up to a multiple of
/// `alignment`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Align {
    /// Alignment in elements. Must be non-zero.
    pub alignment: usize,
    /// Logical lowest-order index that must be aligned.
    pub position: usize,
}

impl Align {
    /// Aligns element `0` of the lowest-order axis to `alignment` elements.
    pub fn new(alignment: usize) -> Self {
        Self::with_position(alignment, 0)
    }

    /// Aligns element `position` of the lowest-order axis to `alignment` elements.
    pub fn with_position(alignment: usize, position: usize) -> Self {
        assert!(alignment > 0, "alignment must be non-zero");
        Self {
            alignment,
            position,
        }
    }

    /// Number of padding elements placed before logical element `0`.
    pub fn offset(&self) -> usize {
        (self.alignment - self.position % self.alignment) % self.alignment
    }
}

impl Default for Align {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Shape and memory layout of a `D`-dimensional array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayLayout<const D: usize> {
    extents: [usize; D],
    aligned: [usize; D],
    strides: [usize; D],
    offset: usize,
}

impl<const D: usize> ArrayLayout<D> {
    /// Computes the padded layout of an array with the given extents.
    pub fn new(extents: [usize; D], align: Align) -> Self {
        const { assert!(D > 0, "arrays need at least one dimension") };

        let offset = align.offset();
        let mut aligned = extents;
        aligned[D - 1] = (extents[D - 1] + offset).next_multiple_of(align.alignment);

        let mut strides = [1; D];
        for dim in (0..D - 1).rev() {
            strides[dim] = strides[dim + 1] * aligned[dim + 1];
        }

        Self {
            extents,
            aligned,
            strides,
            offset,
        }
    }

    /// Logical element count per axis.
    pub fn extents(&self) -> &[usize; D] {
        &self.extents
    }

    /// Padded element count per axis.
    pub fn aligned(&self) -> &[usize; D] {
        &self.aligned
    }

    /// Distance in elements between consecutive indices of each axis.
    pub fn strides(&self) -> &[usize; D] {
        &self.strides
    }

    /// Padding elements before logical element `0`.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of logical elements.
    pub fn elems(&self) -> usize {
        self.extents.iter().product()
    }

    /// Number of elements of the padded buffer.
    pub fn elems_aligned(&self) -> usize {
        self.aligned.iter().product()
    }

    /// Linear position of a logical index relative to logical element `0`.
    pub fn linearize(&self, index: [usize; D]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(idx, stride)| idx * stride)
            .sum()
    }
}
