//! Grad-to-column transform for per-example convolution weight gradients
//!
//! The weight gradient of a convolution is a correlation between the layer
//! input and the output gradient. Summed over the batch it is a single GEMM;
//! per example it is a batched outer product, provided the output gradient is
//! first scattered into input coordinates. That scatter is **grad2col**, the
//! adjoint of the familiar im2col.
//!
//! # Layout
//!
//! For a convolution with `C_out` output channels, kernel volume `kv` and input
//! spatial size `X`:
//!
//! ```text
//! grad_output [N, C_out, Y...]  --grad2col-->  cols [N, C_out·kv, X]
//! input       [N, C_in,  X...]  --reshape-->   x    [N, C_in, X]
//! batched_outer(cols, x)        = [N, C_out·kv, C_in]    (bik,bjk->bij)
//!                               → [N, C_out, C_in, kernel...]
//! ```
//!
//! Row `o·kv + k`, column `x` of `cols` holds `grad_output[o, y]` for the
//! unique output position with `y·stride + k·dilation − padding = x` on every
//! axis, zero otherwise. The transposed convolution swaps the roles: the input
//! is scattered into output coordinates and contracted against the output
//! gradient. Both directions share one scatter table.
//!
//! # Example
//!
//! ```
//! use scirs2_core::ndarray_ext::{ArrayD, IxDyn};
//! use visso_core::grad2col::{conv_weight_grads, ConvGeometry};
//!
//! let geometry = ConvGeometry::new(&[3, 3]).stride(&[2]).padding(&[1]);
//! let input = ArrayD::<f64>::ones(IxDyn(&[4, 2, 8, 8]));
//! let out = geometry.conv_output_size(&[8, 8]).unwrap();
//! let grad_output = ArrayD::<f64>::ones(IxDyn(&[4, 5, out[0], out[1]]));
//!
//! let grads = conv_weight_grads(&input, &grad_output, &geometry).unwrap();
//! assert_eq!(grads.shape(), &[4, 5, 2, 3, 3]);
//! ```

#![allow(clippy::needless_range_loop)]

use crate::error::{Result, ShapeError, VissoError};
use crate::types::{numel, Real};
use scirs2_core::ndarray_ext::{s, Array3, ArrayD, ArrayView3, IxDyn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Kernel geometry of an N-dimensional (transposed) convolution
///
/// The spatial rank is fixed by `kernel_size`; every other per-axis setting
/// accepts either one value per axis or a single value broadcast to all axes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvGeometry {
    pub kernel_size: Vec<usize>,
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
    /// Extra extent added to one side of a transposed convolution's output
    pub output_padding: Vec<usize>,
    pub groups: usize,
}

impl ConvGeometry {
    /// Unit stride, no padding, unit dilation, one group
    pub fn new(kernel_size: &[usize]) -> Self {
        let rank = kernel_size.len();
        Self {
            kernel_size: kernel_size.to_vec(),
            stride: vec![1; rank],
            padding: vec![0; rank],
            dilation: vec![1; rank],
            output_padding: vec![0; rank],
            groups: 1,
        }
    }

    fn per_axis(&self, values: &[usize]) -> Vec<usize> {
        if values.len() == 1 {
            vec![values[0]; self.rank()]
        } else {
            values.to_vec()
        }
    }

    pub fn stride(mut self, stride: &[usize]) -> Self {
        self.stride = self.per_axis(stride);
        self
    }

    pub fn padding(mut self, padding: &[usize]) -> Self {
        self.padding = self.per_axis(padding);
        self
    }

    pub fn dilation(mut self, dilation: &[usize]) -> Self {
        self.dilation = self.per_axis(dilation);
        self
    }

    pub fn output_padding(mut self, output_padding: &[usize]) -> Self {
        self.output_padding = self.per_axis(output_padding);
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Number of spatial axes
    pub fn rank(&self) -> usize {
        self.kernel_size.len()
    }

    /// Product of the kernel extents
    pub fn kernel_volume(&self) -> usize {
        numel(&self.kernel_size)
    }

    /// Check per-axis lengths and value ranges
    pub fn validate(&self) -> Result<()> {
        let rank = self.rank();
        if rank == 0 {
            return Err(geometry_error("kernel_size must have at least one axis"));
        }
        for (name, values) in [
            ("stride", &self.stride),
            ("padding", &self.padding),
            ("dilation", &self.dilation),
            ("output_padding", &self.output_padding),
        ] {
            if values.len() != rank {
                return Err(geometry_error(format!(
                    "{name} has {} axes, kernel has {rank}",
                    values.len()
                )));
            }
        }
        if self.kernel_size.contains(&0) {
            return Err(geometry_error("kernel extents must be positive"));
        }
        if self.stride.contains(&0) {
            return Err(geometry_error("stride must be positive"));
        }
        if self.dilation.contains(&0) {
            return Err(geometry_error("dilation must be positive"));
        }
        if self.groups == 0 {
            return Err(geometry_error("groups must be positive"));
        }
        for a in 0..rank {
            if self.output_padding[a] >= self.stride[a].max(self.dilation[a]) {
                return Err(geometry_error(format!(
                    "output_padding {} on axis {a} must be smaller than stride or dilation",
                    self.output_padding[a]
                )));
            }
        }
        Ok(())
    }

    fn check_spatial(&self, spatial: &[usize]) -> Result<()> {
        self.validate()?;
        if spatial.len() != self.rank() {
            return Err(ShapeError::Rank {
                expected: self.rank(),
                got: spatial.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Output extent of the forward convolution for the given input extent
    ///
    /// `out = floor((in + 2·pad − dilation·(kernel − 1) − 1) / stride) + 1`
    pub fn conv_output_size(&self, input_spatial: &[usize]) -> Result<Vec<usize>> {
        self.check_spatial(input_spatial)?;
        (0..self.rank())
            .map(|a| {
                let span = self.dilation[a] * (self.kernel_size[a] - 1) + 1;
                let padded = input_spatial[a] + 2 * self.padding[a];
                if padded < span {
                    return Err(geometry_error(format!(
                        "axis {a}: padded input {padded} is smaller than the dilated kernel {span}"
                    )));
                }
                Ok((padded - span) / self.stride[a] + 1)
            })
            .collect()
    }

    /// Output extent of the transposed convolution for the given input extent
    ///
    /// `out = (in − 1)·stride − 2·pad + dilation·(kernel − 1) + output_padding + 1`
    pub fn conv_transpose_output_size(&self, input_spatial: &[usize]) -> Result<Vec<usize>> {
        self.check_spatial(input_spatial)?;
        (0..self.rank())
            .map(|a| {
                if input_spatial[a] == 0 {
                    return Err(geometry_error(format!("axis {a}: empty input")));
                }
                let full = (input_spatial[a] - 1) * self.stride[a]
                    + self.dilation[a] * (self.kernel_size[a] - 1)
                    + self.output_padding[a]
                    + 1;
                let trimmed = 2 * self.padding[a];
                if full <= trimmed {
                    return Err(geometry_error(format!(
                        "axis {a}: padding {} leaves no output",
                        self.padding[a]
                    )));
                }
                Ok(full - trimmed)
            })
            .collect()
    }
}

fn geometry_error(reason: impl Into<String>) -> VissoError {
    ShapeError::Geometry {
        reason: reason.into(),
    }
    .into()
}

/// Flat `(source position, kernel offset) → target position` pairs
///
/// `target = source·stride + offset·dilation − padding` on every axis; pairs
/// whose target falls outside `dst_spatial` are dropped.
#[derive(Debug, Clone)]
struct ScatterTable {
    entries: Vec<(usize, usize, usize)>,
}

impl ScatterTable {
    fn build(src_spatial: &[usize], dst_spatial: &[usize], geometry: &ConvGeometry) -> Self {
        let mut entries = vec![(0usize, 0usize, 0usize)];
        for a in 0..geometry.rank() {
            let mut axis = Vec::new();
            for src in 0..src_spatial[a] {
                for k in 0..geometry.kernel_size[a] {
                    let dst = (src * geometry.stride[a] + k * geometry.dilation[a]) as isize
                        - geometry.padding[a] as isize;
                    if dst >= 0 && (dst as usize) < dst_spatial[a] {
                        axis.push((src, k, dst as usize));
                    }
                }
            }
            // row-major extension of the flat indices by one axis
            let mut next = Vec::with_capacity(entries.len() * axis.len());
            for &(s0, k0, d0) in &entries {
                for &(s1, k1, d1) in &axis {
                    next.push((
                        s0 * src_spatial[a] + s1,
                        k0 * geometry.kernel_size[a] + k1,
                        d0 * dst_spatial[a] + d1,
                    ));
                }
            }
            entries = next;
        }
        Self { entries }
    }
}

/// Split `[N, C, spatial...]` into `(N, C, spatial)`
fn split_shape(shape: &[usize], rank: usize) -> Result<(usize, usize, Vec<usize>)> {
    if shape.len() != rank + 2 {
        return Err(ShapeError::Rank {
            expected: rank + 2,
            got: shape.len(),
        }
        .into());
    }
    Ok((shape[0], shape[1], shape[2..].to_vec()))
}

/// Scatter `[N, C, src...]` into `[N, C·kv, dst_total]` along a scatter table
fn scatter<T: Real>(
    source: &ArrayD<T>,
    table: &ScatterTable,
    kernel_volume: usize,
    dst_total: usize,
) -> Result<Array3<T>> {
    let (n, c) = (source.shape()[0], source.shape()[1]);
    let src_total = numel(&source.shape()[2..]);
    let flat: Vec<T> = source.iter().copied().collect();
    let rows = c * kernel_volume;
    let mut out = vec![T::zero(); n * rows * dst_total];

    for b in 0..n {
        for ch in 0..c {
            let src_base = (b * c + ch) * src_total;
            let row_base = b * rows + ch * kernel_volume;
            for &(src, k, dst) in &table.entries {
                out[(row_base + k) * dst_total + dst] = flat[src_base + src];
            }
        }
    }

    Array3::from_shape_vec((n, rows, dst_total), out).map_err(|_| {
        ShapeError::Length {
            expected: n * rows * dst_total,
            got: 0,
        }
        .into()
    })
}

/// Scatter a convolution's output gradient into input coordinates
///
/// # Arguments
///
/// * `grad_output` - `[N, C_out, out_spatial...]`
/// * `geometry` - kernel geometry of the forward convolution
/// * `input_spatial` - spatial extent of the forward input
///
/// # Returns
///
/// `[N, C_out · kernel_volume, prod(input_spatial)]`
///
/// # Errors
///
/// [`ShapeError::Grad2Col`] when `grad_output`'s spatial extent is not the one
/// the geometry produces from `input_spatial`.
pub fn grad2col<T: Real>(
    grad_output: &ArrayD<T>,
    geometry: &ConvGeometry,
    input_spatial: &[usize],
) -> Result<Array3<T>> {
    let expected_spatial = geometry.conv_output_size(input_spatial)?;
    let (n, c_out, got_spatial) = split_shape(grad_output.shape(), geometry.rank())?;
    if got_spatial != expected_spatial {
        return Err(ShapeError::Grad2Col {
            expected: n * c_out * numel(&expected_spatial),
            got: grad_output.len(),
            expected_spatial,
            got_spatial,
        }
        .into());
    }
    let table = ScatterTable::build(&got_spatial, input_spatial, geometry);
    scatter(
        grad_output,
        &table,
        geometry.kernel_volume(),
        numel(input_spatial),
    )
}

/// Scatter a transposed convolution's input into output coordinates
///
/// # Arguments
///
/// * `input` - `[N, C_in, in_spatial...]`
/// * `geometry` - kernel geometry of the transposed convolution
///
/// # Returns
///
/// `[N, C_in · kernel_volume, prod(output_spatial)]` with the output extent
/// from [`ConvGeometry::conv_transpose_output_size`].
pub fn grad2col_transpose<T: Real>(input: &ArrayD<T>, geometry: &ConvGeometry) -> Result<Array3<T>> {
    let (_, _, in_spatial) = split_shape(input.shape(), geometry.rank())?;
    let out_spatial = geometry.conv_transpose_output_size(&in_spatial)?;
    let table = ScatterTable::build(&in_spatial, &out_spatial, geometry);
    scatter(input, &table, geometry.kernel_volume(), numel(&out_spatial))
}

/// Batched outer product over the trailing axis: `bik,bjk->bij`
pub fn batched_outer<T: Real>(a: ArrayView3<T>, b: ArrayView3<T>) -> Result<Array3<T>> {
    let (batch, rows, inner) = a.dim();
    let (batch_b, cols, inner_b) = b.dim();
    if batch != batch_b || inner != inner_b {
        return Err(ShapeError::Tensor {
            expected: vec![batch, cols, inner],
            got: vec![batch_b, cols, inner_b],
        }
        .into());
    }
    let mut out = Array3::zeros((batch, rows, cols));
    for n in 0..batch {
        for i in 0..rows {
            let lhs = a.slice(s![n, i, ..]);
            for j in 0..cols {
                let rhs = b.slice(s![n, j, ..]);
                out[[n, i, j]] = lhs
                    .iter()
                    .zip(rhs.iter())
                    .fold(T::zero(), |acc, (&x, &y)| acc + x * y);
            }
        }
    }
    Ok(out)
}

fn group_split(channels: usize, groups: usize, what: &str) -> Result<usize> {
    if channels % groups != 0 {
        return Err(geometry_error(format!(
            "{what} channels {channels} are not divisible by groups {groups}"
        )));
    }
    Ok(channels / groups)
}

/// Contract scattered columns against a second operand, group by group
///
/// `cols` is `[N, A·kv, X]`, `other` is `[N, B, X]`; within each group the
/// result is `[N, A/g, B/g, kv]`, written into `[N, A, B/g, kv]`.
fn grouped_contract<T: Real>(
    cols: &Array3<T>,
    other: &Array3<T>,
    groups: usize,
    kernel_volume: usize,
) -> Result<Array3<T>> {
    let n = cols.dim().0;
    let a = cols.dim().1 / kernel_volume;
    let b = other.dim().1;
    let a_g = group_split(a, groups, "scattered")?;
    let b_g = group_split(b, groups, "contracted")?;

    let mut out = Array3::zeros((n, a, b_g * kernel_volume));
    for g in 0..groups {
        let lhs = cols.slice(s![.., g * a_g * kernel_volume..(g + 1) * a_g * kernel_volume, ..]);
        let rhs = other.slice(s![.., g * b_g..(g + 1) * b_g, ..]);
        // [N, a_g·kv, b_g], row r = local_a·kv + k
        let outer = batched_outer(lhs, rhs)?;
        for bn in 0..n {
            for r in 0..a_g * kernel_volume {
                let (local_a, k) = (r / kernel_volume, r % kernel_volume);
                for c in 0..b_g {
                    out[[bn, g * a_g + local_a, c * kernel_volume + k]] = outer[[bn, r, c]];
                }
            }
        }
    }
    Ok(out)
}

fn flatten_spatial<T: Real>(tensor: &ArrayD<T>) -> Result<Array3<T>> {
    let (n, c) = (tensor.shape()[0], tensor.shape()[1]);
    let total = numel(&tensor.shape()[2..]);
    let flat: Vec<T> = tensor.iter().copied().collect();
    Array3::from_shape_vec((n, c, total), flat).map_err(|_| {
        ShapeError::Length {
            expected: n * c * total,
            got: tensor.len(),
        }
        .into()
    })
}

fn with_kernel_axes<T: Real>(
    grads: Array3<T>,
    lead: usize,
    per_group: usize,
    geometry: &ConvGeometry,
) -> Result<ArrayD<T>> {
    let mut shape = vec![grads.dim().0, lead, per_group];
    shape.extend_from_slice(&geometry.kernel_size);
    let len = grads.len();
    let flat: Vec<T> = grads.iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(&shape), flat).map_err(|_| {
        ShapeError::Length {
            expected: numel(&shape),
            got: len,
        }
        .into()
    })
}

/// Per-example weight gradients of a convolution
///
/// # Arguments
///
/// * `input` - `[N, C_in, in_spatial...]`
/// * `grad_output` - `[N, C_out, out_spatial...]`
///
/// # Returns
///
/// `[N, C_out, C_in / groups, kernel...]`, one weight gradient per example.
/// Summing over the first axis gives the ordinary batch weight gradient.
pub fn conv_weight_grads<T: Real>(
    input: &ArrayD<T>,
    grad_output: &ArrayD<T>,
    geometry: &ConvGeometry,
) -> Result<ArrayD<T>> {
    let (n, c_in, in_spatial) = split_shape(input.shape(), geometry.rank())?;
    if grad_output.shape().first() != Some(&n) {
        return Err(ShapeError::Tensor {
            expected: vec![n],
            got: grad_output.shape().iter().take(1).copied().collect(),
        }
        .into());
    }
    let cols = grad2col(grad_output, geometry, &in_spatial)?;
    let x = flatten_spatial(input)?;
    let c_out = grad_output.shape()[1];
    let kv = geometry.kernel_volume();
    let grads = grouped_contract(&cols, &x, geometry.groups, kv)?;
    with_kernel_axes(grads, c_out, c_in / geometry.groups, geometry)
}

/// Per-example weight gradients of a transposed convolution
///
/// # Arguments
///
/// * `input` - `[N, C_in, in_spatial...]`
/// * `grad_output` - `[N, C_out, out_spatial...]`
///
/// # Returns
///
/// `[N, C_in, C_out / groups, kernel...]`, matching the transposed
/// convolution's weight layout.
pub fn conv_transpose_weight_grads<T: Real>(
    input: &ArrayD<T>,
    grad_output: &ArrayD<T>,
    geometry: &ConvGeometry,
) -> Result<ArrayD<T>> {
    let (n, c_in, in_spatial) = split_shape(input.shape(), geometry.rank())?;
    let expected_spatial = geometry.conv_transpose_output_size(&in_spatial)?;
    let (n_out, c_out, got_spatial) = split_shape(grad_output.shape(), geometry.rank())?;
    if n_out != n || got_spatial != expected_spatial {
        return Err(ShapeError::Grad2Col {
            expected: n * c_out * numel(&expected_spatial),
            got: grad_output.len(),
            expected_spatial,
            got_spatial,
        }
        .into());
    }
    let cols = grad2col_transpose(input, geometry)?;
    let gy = flatten_spatial(grad_output)?;
    let kv = geometry.kernel_volume();
    let grads = grouped_contract(&cols, &gy, geometry.groups, kv)?;
    with_kernel_axes(grads, c_in, c_out / geometry.groups, geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::ndarray_ext::array;

    #[test]
    fn test_output_sizes() {
        let g = ConvGeometry::new(&[3]).stride(&[2]).padding(&[1]);
        assert_eq!(g.conv_output_size(&[7]).unwrap(), vec![4]);

        let g = ConvGeometry::new(&[3]).dilation(&[2]);
        assert_eq!(g.conv_output_size(&[7]).unwrap(), vec![3]);

        let g = ConvGeometry::new(&[3])
            .stride(&[2])
            .padding(&[1])
            .output_padding(&[1]);
        assert_eq!(g.conv_transpose_output_size(&[4]).unwrap(), vec![8]);
    }

    #[test]
    fn test_geometry_rejects_empty_output() {
        let g = ConvGeometry::new(&[5]);
        assert!(matches!(
            g.conv_output_size(&[3]),
            Err(VissoError::Shape(ShapeError::Geometry { .. }))
        ));
        let g = ConvGeometry::new(&[1]).padding(&[2]);
        assert!(g.conv_transpose_output_size(&[1]).is_err());
    }

    #[test]
    fn test_geometry_validation() {
        assert!(ConvGeometry::new(&[3, 3]).stride(&[0]).validate().is_err());
        assert!(ConvGeometry::new(&[3, 3]).stride(&[1, 2, 3]).validate().is_err());
        assert!(ConvGeometry::new(&[3]).output_padding(&[1]).validate().is_err());
        assert!(ConvGeometry::new(&[3])
            .stride(&[2])
            .output_padding(&[1])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_pointwise_is_reshape() {
        let go = array![[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]].into_dyn();
        let cols = grad2col(&go, &ConvGeometry::new(&[1]), &[3]).unwrap();
        let expected: Array3<f64> = array![[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]];
        assert_eq!(cols, expected);
    }

    #[test]
    fn test_grad2col_1d_layout() {
        // in 4, kernel 2, stride 1 -> out 3
        let go = array![[[1.0, 2.0, 3.0]]].into_dyn();
        let cols = grad2col(&go, &ConvGeometry::new(&[2]), &[4]).unwrap();
        // k=0 -> x=y ; k=1 -> x=y+1
        let expected: Array3<f64> = array![[[1.0, 2.0, 3.0, 0.0], [0.0, 1.0, 2.0, 3.0]]];
        assert_eq!(cols, expected);
    }

    #[test]
    fn test_grad2col_rejects_wrong_extent() {
        let go = ArrayD::<f64>::zeros(IxDyn(&[2, 3, 5]));
        let err = grad2col(&go, &ConvGeometry::new(&[3]), &[8]).unwrap_err();
        match err {
            VissoError::Shape(ShapeError::Grad2Col {
                expected,
                got,
                expected_spatial,
                got_spatial,
            }) => {
                assert_eq!(expected, 36);
                assert_eq!(got, 30);
                assert_eq!(expected_spatial, vec![6]);
                assert_eq!(got_spatial, vec![5]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_batched_outer() {
        let a: Array3<f64> = array![[[1.0, 2.0], [0.0, 1.0]]];
        let b: Array3<f64> = array![[[3.0, 4.0]]];
        let out = batched_outer(a.view(), b.view()).unwrap();
        assert_eq!(out, array![[[11.0], [4.0]]]);

        let bad: Array3<f64> = array![[[1.0, 2.0, 3.0]]];
        assert!(batched_outer(a.view(), bad.view()).is_err());
    }

    #[test]
    fn test_conv_weight_grads_1d_by_hand() {
        // x = [1, 2, 3], kernel 2: y[j] = w0 x[j] + w1 x[j+1]
        let x = array![[[1.0, 2.0, 3.0]]].into_dyn();
        let gy = array![[[1.0, 10.0]]].into_dyn();
        let grads = conv_weight_grads(&x, &gy, &ConvGeometry::new(&[2])).unwrap();
        assert_eq!(grads.shape(), &[1, 1, 1, 2]);
        assert_eq!(grads[[0, 0, 0, 0]], 1.0 + 20.0);
        assert_eq!(grads[[0, 0, 0, 1]], 2.0 + 30.0);
    }

    #[test]
    fn test_conv_transpose_weight_grads_1d_by_hand() {
        // x = [1, 2], kernel 2, stride 1: z = j + k, out 3
        let x = array![[[1.0, 2.0]]].into_dyn();
        let gy = array![[[1.0, 10.0, 100.0]]].into_dyn();
        let grads = conv_transpose_weight_grads(&x, &gy, &ConvGeometry::new(&[2])).unwrap();
        assert_eq!(grads.shape(), &[1, 1, 1, 2]);
        assert_eq!(grads[[0, 0, 0, 0]], 1.0 + 20.0);
        assert_eq!(grads[[0, 0, 0, 1]], 10.0 + 200.0);
    }

    #[test]
    fn test_groups_must_divide_channels() {
        let g = ConvGeometry::new(&[1]).groups(2);
        let x = ArrayD::<f64>::zeros(IxDyn(&[1, 3, 4]));
        let gy = ArrayD::<f64>::zeros(IxDyn(&[1, 2, 4]));
        assert!(conv_weight_grads(&x, &gy, &g).is_err());
    }
}
