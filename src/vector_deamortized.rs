//! Vectorized Deamortized COLA: combines [`DeamortizedCola`]'s bounded
//! per-insert merge budget with [`VectorBasicCola`]'s 8-lane bitonic merge
//! network, so large in-progress merges still move eight keys at a time
//! even though the merge itself is spread across several `add` calls.
//!
//! Grounded on `avx_deamortized_cola.h`/`avx_deamortized_cola.cpp`: same
//! per-layer `(leftFull, rightFull, merging)` bitset scheme and
//! `(mergeLeft, mergeRight, mergeDst)` cursors as [`DeamortizedCola`], but
//! each layer's buffer is a 32-byte aligned `i32` [`AlignedI32Buf`] and
//! layers wide enough for the bitonic path reuse `bitonic_merge8x8` from
//! [`vector_basic`]. The one genuinely new wrinkle (absent from the
//! non-deamortized vectorized variant) is resuming a bitonic merge that
//! was cut off mid-vector: the partially-merged upper half `b` is left in
//! place at `dst[k]` as scratch, and the next call to `merge_work` detects
//! that state by `i`/`j` no longer sitting on an 8-lane boundary and
//! reloads `b` from there instead of pulling fresh input vectors.
//!
//! [`DeamortizedCola`]: crate::deamortized::DeamortizedCola
//! [`VectorBasicCola`]: crate::vector_basic::VectorBasicCola
//! [`vector_basic`]: crate::vector_basic

use crate::bitmath::{binary_search, is_po2, popcount};
use crate::simd::{avx2_available, AlignedI32Buf, UnsupportedSimdError};
use crate::vector_basic::bitonic_merge8x8;

const MIN_LAYER_COUNT: u32 = 4;
const BITONIC_LANES: usize = 8;

struct Layer {
    data: AlignedI32Buf,
    merge_left: usize,
    merge_right: usize,
    merge_dst: usize,
}

impl Layer {
    fn new(l: u32) -> Self {
        Self {
            data: AlignedI32Buf::zeroed(2usize << l),
            merge_left: 0,
            merge_right: 0,
            merge_dst: 0,
        }
    }
}

impl Clone for Layer {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            merge_left: self.merge_left,
            merge_right: self.merge_right,
            merge_dst: self.merge_dst,
        }
    }
}

/// A multiset of `i32` keys whose per-insert merge-move budget never
/// exceeds `2L + 2`, with the bitonic merge network from
/// [`VectorBasicCola`] wired into layers wide enough to fill a lane.
///
/// [`VectorBasicCola`]: crate::vector_basic::VectorBasicCola
pub struct VectorDeamortizedCola {
    left_full: u64,
    right_full: u64,
    merging: u64,
    layers: Vec<Layer>,
}

impl Clone for VectorDeamortizedCola {
    fn clone(&self) -> Self {
        Self {
            left_full: self.left_full,
            right_full: self.right_full,
            merging: self.merging,
            layers: self.layers.clone(),
        }
    }
}

impl Default for VectorDeamortizedCola {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorDeamortizedCola {
    /// Panics if the running CPU lacks AVX2. Use
    /// [`try_new`](Self::try_new) to probe support without panicking.
    pub fn new() -> Self {
        Self::with_capacity(15)
    }

    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self::try_with_capacity(initial_capacity).expect("AVX2 support is required")
    }

    pub fn try_new() -> Result<Self, UnsupportedSimdError> {
        Self::try_with_capacity(15)
    }

    pub fn try_with_capacity(initial_capacity: usize) -> Result<Self, UnsupportedSimdError> {
        if !avx2_available() {
            return Err(UnsupportedSimdError {
                required_feature: "avx2",
            });
        }
        let layer_count = MIN_LAYER_COUNT.max(popcount(crate::bitmath::next_po2_minus_one(
            initial_capacity as u64,
        )));
        let layers = (0..layer_count).map(Layer::new).collect();
        Ok(Self {
            left_full: 0,
            right_full: 0,
            merging: 0,
            layers,
        })
    }

    pub fn size(&self) -> usize {
        (self.left_full + self.right_full) as usize
    }

    /// Half the raw backing storage is merge scratch; see
    /// [`DeamortizedCola::capacity`](crate::deamortized::DeamortizedCola::capacity).
    pub fn capacity(&self) -> usize {
        ((1u64 << self.layers.len()) - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Inserts `value`. Performs at most `2L + 2` element moves of merge
    /// work, using the bitonic network for any layer wide enough to fill
    /// an 8-lane vector.
    pub fn add(&mut self, value: i32) {
        let n_size = self.size() + 1;
        if n_size > self.capacity() {
            self.grow(self.layer_count() + 1);
        }

        if self.left_full & 1 != 0 {
            self.layers[0].data[1] = value;
            self.right_full |= 1;
            self.prepare_merge(0);
        } else {
            self.layers[0].data[0] = value;
            self.left_full |= 1;
        }

        // SAFETY: AVX2 presence is guaranteed by construction.
        unsafe { self.merge_work((self.layer_count() << 1) as i64 + 2) };
    }

    fn prepare_merge(&mut self, l: u32) {
        let flag = 1u64 << l;
        self.merging |= flag;

        let dst_full = (self.left_full & (flag << 1)) != 0;
        let layer = &mut self.layers[l as usize];
        layer.merge_left = 0;
        layer.merge_right = flag as usize;
        layer.merge_dst = if dst_full { (flag << 1) as usize } else { 0 };
    }

    /// # Safety
    /// Caller must have verified AVX2 support.
    #[target_feature(enable = "avx2")]
    unsafe fn merge_work(&mut self, mut m: i64) {
        let mut l = 0usize;
        while m > 0 && (self.merging >> l) != 0 {
            if (self.merging >> l) & 1 != 0 {
                let i_end = 1usize << l;
                let j_end = 2usize << l;

                let (src_slice, dst_slice) = self.layers.split_at_mut(l + 1);
                let src = &mut src_slice[l];
                let dst = &mut dst_slice[0];

                if i_end < BITONIC_LANES {
                    scalar_merge_step(src, dst, i_end, j_end, &mut m);
                } else {
                    bitonic_merge_step(src, dst, i_end, j_end, &mut m);
                }

                if src.merge_left == i_end && src.merge_right == j_end {
                    let dst_index = src.merge_dst;
                    self.left_full &= !(1u64 << l);
                    self.right_full &= !(1u64 << l);
                    self.merging &= !(1u64 << l);

                    if (dst_index >> l) == 2 {
                        self.left_full |= 2u64 << l;
                    } else {
                        self.right_full |= 2u64 << l;
                    }
                    if ((self.right_full >> l) & 2) != 0 {
                        self.prepare_merge(l as u32 + 1);
                    }
                }
            }
            l += 1;
        }
    }

    /// Membership test: binary-searches every occupied sub-array,
    /// smallest layer first. Not vectorized in the original either —
    /// only the merge path is.
    pub fn contains(&self, value: i32) -> bool {
        for l in 0..self.layer_count() {
            let array_size = 1usize << l;
            let data = &self.layers[l as usize].data;

            if (self.left_full >> l) & 1 != 0 && binary_search(&value, data, 0, array_size) {
                return true;
            }
            if (self.right_full >> l) & 1 != 0
                && binary_search(&value, data, array_size, array_size << 1)
            {
                return true;
            }
        }
        false
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    fn grow(&mut self, new_layer_count: u32) {
        while self.layers.len() < new_layer_count as usize {
            let l = self.layers.len() as u32;
            self.layers.push(Layer::new(l));
        }
    }
}

/// Scalar three-way merge of at most `m` elements from `src`'s two
/// sub-arrays into `dst`, resuming from `src`'s saved cursors.
fn scalar_merge_step(src: &mut Layer, dst: &mut Layer, i_end: usize, j_end: usize, m: &mut i64) {
    while *m > 0 && src.merge_left != i_end && src.merge_right != j_end {
        if src.data[src.merge_left] <= src.data[src.merge_right] {
            dst.data[src.merge_dst] = src.data[src.merge_left];
            src.merge_left += 1;
        } else {
            dst.data[src.merge_dst] = src.data[src.merge_right];
            src.merge_right += 1;
        }
        src.merge_dst += 1;
        *m -= 1;
    }
    while *m > 0 && src.merge_left != i_end {
        dst.data[src.merge_dst] = src.data[src.merge_left];
        src.merge_left += 1;
        src.merge_dst += 1;
        *m -= 1;
    }
    while *m > 0 && src.merge_right != j_end {
        dst.data[src.merge_dst] = src.data[src.merge_right];
        src.merge_right += 1;
        src.merge_dst += 1;
        *m -= 1;
    }
}

/// Bitonic 8-lane merge of `src`'s two sub-arrays into `dst`, resuming a
/// merge that was cut off mid-vector on a prior call.
///
/// # Safety
/// Caller must have verified AVX2 support.
#[target_feature(enable = "avx2")]
unsafe fn bitonic_merge_step(src: &mut Layer, dst: &mut Layer, i_end: usize, j_end: usize, m: &mut i64) {
    use std::arch::x86_64::*;

    let mut i = src.merge_left;
    let mut j = src.merge_right;
    let mut k = src.merge_dst;

    let mut b = if !is_po2(i as u64) || !is_po2(j as u64) {
        // A prior call left the unconsumed upper half parked at dst[k];
        // non-power-of-two cursors are the witness that we are mid-merge.
        load8(dst.data.as_ptr().add(k))
    } else {
        let mut a = load8(src.data.as_ptr().add(i));
        let mut bb = load8(src.data.as_ptr().add(j));
        i += BITONIC_LANES;
        j += BITONIC_LANES;
        bitonic_merge8x8(&mut a, &mut bb);
        store8(dst.data.as_mut_ptr().add(k), a);
        k += BITONIC_LANES;
        *m -= BITONIC_LANES as i64;
        bb
    };

    while *m > 0 && i != i_end && j != j_end {
        let mut next = if src.data[i] < src.data[j] {
            let v = load8(src.data.as_ptr().add(i));
            i += BITONIC_LANES;
            v
        } else {
            let v = load8(src.data.as_ptr().add(j));
            j += BITONIC_LANES;
            v
        };
        bitonic_merge8x8(&mut next, &mut b);
        store8(dst.data.as_mut_ptr().add(k), next);
        k += BITONIC_LANES;
        *m -= BITONIC_LANES as i64;
    }

    while *m > 0 && i != i_end {
        let mut next = load8(src.data.as_ptr().add(i));
        i += BITONIC_LANES;
        bitonic_merge8x8(&mut next, &mut b);
        store8(dst.data.as_mut_ptr().add(k), next);
        k += BITONIC_LANES;
        *m -= BITONIC_LANES as i64;
    }

    while *m > 0 && j != j_end {
        let mut next = load8(src.data.as_ptr().add(j));
        j += BITONIC_LANES;
        bitonic_merge8x8(&mut next, &mut b);
        store8(dst.data.as_mut_ptr().add(k), next);
        k += BITONIC_LANES;
        *m -= BITONIC_LANES as i64;
    }

    store8(dst.data.as_mut_ptr().add(k), b);
    if i == i_end && j == j_end {
        // The merge finished: the vector just stored is real output, not
        // scratch, so the budget and destination cursor both advance.
        k += BITONIC_LANES;
        *m -= BITONIC_LANES as i64;
    }

    src.merge_left = i;
    src.merge_right = j;
    src.merge_dst = k;
}

#[target_feature(enable = "avx2")]
unsafe fn load8(src: *const i32) -> std::arch::x86_64::__m256i {
    std::arch::x86_64::_mm256_loadu_si256(src as *const std::arch::x86_64::__m256i)
}

#[target_feature(enable = "avx2")]
unsafe fn store8(dst: *mut i32, value: std::arch::x86_64::__m256i) {
    std::arch::x86_64::_mm256_storeu_si256(dst as *mut std::arch::x86_64::__m256i, value)
}

impl<'a> IntoIterator for &'a VectorDeamortizedCola {
    type Item = i32;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

const END_LAYER: u32 = u32::MAX;

/// Walks each occupied sub-array in ascending layer order (left half of a
/// layer before its right half), smallest layer to largest; the back cursor
/// walks the same order in reverse, largest layer (right half first) down to
/// smallest.
pub struct Iter<'a> {
    cola: &'a VectorDeamortizedCola,
    front_layer: u32,
    front_index: usize,
    back_layer: u32,
    back_index: usize,
}

impl<'a> Iter<'a> {
    fn new(cola: &'a VectorDeamortizedCola) -> Self {
        let non_empty = cola.left_full | cola.right_full;
        if non_empty == 0 {
            return Self {
                cola,
                front_layer: END_LAYER,
                front_index: 0,
                back_layer: END_LAYER,
                back_index: 0,
            };
        }

        let front_layer = non_empty.trailing_zeros();
        let front_index = if (cola.left_full >> front_layer) & 1 != 0 {
            0
        } else {
            1usize << front_layer
        };

        let back_layer = 63 - non_empty.leading_zeros();
        let back_index = if (cola.right_full >> back_layer) & 1 != 0 {
            (2usize << back_layer) - 1
        } else {
            (1usize << back_layer) - 1
        };

        Self {
            cola,
            front_layer,
            front_index,
            back_layer,
            back_index,
        }
    }

    fn exhausted(&self) -> bool {
        self.front_layer == END_LAYER
            || self.front_layer > self.back_layer
            || (self.front_layer == self.back_layer && self.front_index > self.back_index)
    }

    fn mark_exhausted(&mut self) {
        self.front_layer = END_LAYER;
    }

    fn advance_front(&mut self) {
        let non_empty = self.cola.left_full | self.cola.right_full;
        let mut l = self.front_layer + 1;
        while l < self.cola.layer_count() {
            if (non_empty >> l) & 1 != 0 {
                self.front_index = if (self.cola.left_full >> l) & 1 != 0 {
                    0
                } else {
                    1usize << l
                };
                self.front_layer = l;
                return;
            }
            l += 1;
        }
        self.mark_exhausted();
    }

    fn retreat_back(&mut self) {
        let non_empty = self.cola.left_full | self.cola.right_full;
        let mut l = self.back_layer;
        while l > 0 {
            l -= 1;
            if (non_empty >> l) & 1 != 0 {
                self.back_index = if (self.cola.right_full >> l) & 1 != 0 {
                    (2usize << l) - 1
                } else {
                    (1usize << l) - 1
                };
                self.back_layer = l;
                return;
            }
        }
        self.mark_exhausted();
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        if self.exhausted() {
            return None;
        }
        let value = self.cola.layers[self.front_layer as usize].data[self.front_index];
        let was_last = self.front_layer == self.back_layer && self.front_index == self.back_index;

        let layer = self.front_layer;
        let mid = 1usize << layer;
        if self.front_index + 1 == mid {
            if (self.cola.right_full >> layer) & 1 != 0 {
                self.front_index = mid;
            } else {
                self.advance_front();
            }
        } else if self.front_index + 1 == mid << 1 {
            self.advance_front();
        } else {
            self.front_index += 1;
        }

        if was_last {
            self.mark_exhausted();
        }
        Some(value)
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<i32> {
        if self.exhausted() {
            return None;
        }
        let value = self.cola.layers[self.back_layer as usize].data[self.back_index];
        let was_last = self.front_layer == self.back_layer && self.front_index == self.back_index;

        let layer = self.back_layer;
        let mid = 1usize << layer;
        if self.back_index == mid {
            if (self.cola.left_full >> layer) & 1 != 0 {
                self.back_index = mid - 1;
            } else {
                self.retreat_back();
            }
        } else if self.back_index == 0 {
            self.retreat_back();
        } else {
            self.back_index -= 1;
        }

        if was_last {
            self.mark_exhausted();
        }
        Some(value)
    }
}
