use crate::layers::init::{constant, truncated_normal, BIAS_INIT, WEIGHT_STDDEV};
use crate::model::Module;
use ndarray::prelude::*;
use ndarray::Zip;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;
use tracing::trace;

/// How the spatial border is handled by convolution and pooling.
///
/// - `Valid`: only windows fully inside the input are used.
/// - `Same`: the input is padded so that `out = ceil(in / stride)`. The
///   padding of each axis is split with the smaller half before and the
///   larger half after (zeros for convolution, `-inf` for pooling).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Valid,
    Same,
}

/// Zero-padding (before, after) of one spatial axis for a stride-1 SAME convolution.
fn same_padding(k: usize) -> (usize, usize) {
    let total = k - 1;
    (total / 2, total - total / 2)
}

/// 2D convolution layer (stride=1).
/// pytorch doc: https://docs.pytorch.org/docs/stable/generated/torch.nn.Conv2d.html
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2Dlayer {
    in_channels: usize,          // Number of channels in the input image
    out_channels: usize,         // Number of channels produced by the convolution
    kernel_size: (usize, usize), // Size of all the 2d convolving kernels used in this layer.
    padding: Padding,
    // weights
    pub kernels_mat: Array2<f32>, // Layout for img2col: (out_channels, in_channels*k^2)
    pub b: Array1<f32>,           // One bias per output channel: (output_channels)
    // for backprop
    #[serde(skip)]
    last_input: Option<Array3<f32>>, // The 'patches' matrix in img2col: (batch_size, locations, in_channels * k^2)
    #[serde(skip)]
    last_input_hw: Option<(usize, usize)>, // Unpadded input spatial size
    //
    #[serde(skip)]
    pub k_grad: Option<Array2<f32>>, // (out_channels, in_channels * k^2)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (out_channels)
}

impl Conv2Dlayer {
    /// Kernels drawn from a truncated normal (stddev 0.1), biases set to 0.1.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        padding: Padding,
        rng: &mut R,
    ) -> Conv2Dlayer {
        assert!(kernel_size.0 == kernel_size.1, "only square kernels are supported");
        let k = kernel_size.0;
        Conv2Dlayer {
            in_channels,
            out_channels,
            kernel_size,
            padding,
            //
            kernels_mat: truncated_normal((out_channels, in_channels * k * k), WEIGHT_STDDEV, rng),
            b: constant(out_channels, BIAS_INIT),
            //
            last_input: None,
            last_input_hw: None,
            //
            k_grad: None,
            b_grad: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Spatial output size for an input of `(height, width)`.
    pub fn output_hw(&self, height: usize, width: usize) -> (usize, usize) {
        let k = self.kernel_size.0;
        match self.padding {
            Padding::Same => (height, width),
            Padding::Valid => (height - k + 1, width - k + 1),
        }
    }

    fn pad(&self, input: Array4<f32>) -> Array4<f32> {
        match self.padding {
            Padding::Valid => input,
            Padding::Same => {
                let k = self.kernel_size.0;
                let (before, _) = same_padding(k);
                let (batch_size, channels, height, width) = input.dim();
                let mut padded =
                    Array4::zeros((batch_size, channels, height + k - 1, width + k - 1));
                padded
                    .slice_mut(s![.., .., before..before + height, before..before + width])
                    .assign(&input);
                padded
            }
        }
    }
}

impl Module for Conv2Dlayer {
    /// Forward for the convolution layer using the 'img2col' method.
    ///
    /// The 'img2col' idea is to map the convolution operation to a single matmul.
    /// The goal is to compute OUT = kernels_mat x patches_mat, where patches_mat
    /// is a matrix where columns correspond to entire input patches to the convolution kernel.
    /// In terms of size (omitting the batch dim to simplify):
    /// - kernels_mat: (out_channels, channels_in * k^2)
    /// - patches_mat: (channels_in * k ^2, locations)
    /// So their multiplication yields: (out_channels, locations)
    /// By locations, we mean every valid coordinate in the (padded) input feature map volume
    /// where the kernel can be used to compute a value through the convolution.
    ///
    /// Input: (batch_size, in_channels, height, width)
    /// Output: (batch_size, out_channels, out_height, out_width), see `output_hw`
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        trace!(shape = ?input.shape(), "conv forward");
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Conv layer input should be 4D");

        let (_, in_channels, in_height, in_width) = input.dim();
        assert!(
            in_channels == self.in_channels,
            "conv expects {} input channels, got {in_channels}",
            self.in_channels
        );
        let k = self.kernel_size.0;
        let input = self.pad(input);
        let (batch_size, _, padded_height, padded_width) = input.dim();
        assert!(
            padded_height >= k && padded_width >= k,
            "input is smaller than the kernel"
        );
        let out_height = padded_height - k + 1;
        let out_width = padded_width - k + 1;
        let mut out = Array4::zeros((batch_size, self.out_channels, out_height, out_width));

        // The 'kernels' 2D tensor already has the correct shape for the img2col method.
        // kernels_mat: (out_channels, channels_in * k ^2)
        // - Each row is associated with a single output channel
        // - Each row is the vector of kernel weights associated to every input channels

        // Preparing the 'patches' matrix for the img2col method.
        // patches_mat: (in_channels * k^2, locations)^T
        // - Each column is associated to a single location where the kernels will be applied
        // - Each column is the flattened vector of input values for the given location accross all input channels
        let nb_locations = out_height * out_width;

        // Init the 'last input' which corresponds to the entire patches matrix.
        // Will be needed during backprop.
        let mut last_input = Array3::<f32>::zeros((batch_size, nb_locations, in_channels * k * k));

        // Computing the 'img2col' matmul on a per-batch basis.
        for (batch_idx, input_feature_maps) in input.outer_iter().enumerate() {
            // There are L patches of size (in_channels, k, k), visited row by row
            let patches = input_feature_maps.windows((in_channels, k, k));
            let mut patches_mat = last_input.index_axis_mut(Axis(0), batch_idx);

            // For each patch, we flatten it and put it as a row in the patches matrix
            for (mut patches_mat_row, patch) in patches_mat.rows_mut().into_iter().zip(patches) {
                patches_mat_row.assign(&patch.flatten());
            }

            // The "img2col" matmul which implement the convolution as a single GEMM.
            // (out_channels, L) = (out_channels, in_channels*k^2) dot (L, in_channels*k^2)^T
            let mut flattened_output_feature_map = self.kernels_mat.dot(&patches_mat.t());

            // Add bias: same bias per output_channel
            // --> (out_channels, 1) broadcasted to (out_channels, L)
            flattened_output_feature_map += &self.b.view().insert_axis(Axis(1));

            // (out_channels, L) -> (out_channels, out_height, out_width)
            let output_feature_map = flattened_output_feature_map
                .into_shape_with_order((self.out_channels, out_height, out_width))
                .expect("(out_channels, L) reshapes into (out_channels, out_height, out_width)");

            out.index_axis_mut(Axis(0), batch_idx)
                .assign(&output_feature_map);
        }

        self.last_input = Some(last_input);
        self.last_input_hw = Some((in_height, in_width));

        out.into_dyn()
    }

    /// Backward for the convolution layer using the 'img2col' method.
    ///
    /// The incoming dz is reshaped from (out_channels, out_h, out_w) to
    /// (out_channels, locations), then with the cached patches matrix:
    ///
    /// - dL/dkernels_mat = dz dot patches_mat, summed over the batch.
    /// (out_channels, in_channels * k^2) = (out_channels, locations) dot (locations, in_channels * k^2)
    ///
    /// - dL/dbias = dz summed over locations and batch, since the same bias
    /// was added at every location of its output channel.
    ///
    /// - dL/dpatches_mat = dz^T dot kernels_mat: (locations, in_channels * k^2).
    /// Each row is the gradient of one patch, scattered back (+=, patches overlap)
    /// into the padded input volume at the patch top left corner
    /// (top_y = l / out_width, top_x = l % out_width). The padding is finally
    /// cropped away since it is not part of the layer input.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        trace!(shape = ?dz.shape(), "conv backward");
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [conv] incoming dz is 4D");
        let (batch_size, out_channels, out_height, out_width) = dz.dim();

        let nb_locations = out_height * out_width;
        // new dz shape: (batch_size, out_channels, locations)
        let dz = dz
            .to_shape((batch_size, out_channels, nb_locations))
            .expect("[backward] [conv] incoming dz is compatible with img2col shape");

        // (batch_size, locations, in_channels * k^2)
        let last_patches_mat = self
            .last_input
            .as_ref()
            .expect("Run forward before the backward");
        let (in_height, in_width) = self
            .last_input_hw
            .expect("Run forward before the backward");

        let k = self.kernel_size.0;
        let mut dkernels_mat: Array2<f32> = Array2::zeros((out_channels, self.in_channels * k * k));
        for batch_idx in 0..batch_size {
            dkernels_mat += &dz
                .index_axis(Axis(0), batch_idx)
                .dot(&last_patches_mat.index_axis(Axis(0), batch_idx));
        }
        self.k_grad = Some(dkernels_mat);

        self.b_grad = Some(dz.sum_axis(Axis(2)).sum_axis(Axis(0)));

        // dL/dinput, to be returned for the prev. layer to use for its own backprop
        let padded_height = out_height + k - 1;
        let padded_width = out_width + k - 1;
        let mut dinput = Array4::zeros((batch_size, self.in_channels, padded_height, padded_width));

        for batch_idx in 0..batch_size {
            // (locations, in_channels*k^2) = (out_channels, locations)^T dot (out_channels, in_channels*k^2)
            let grad_patches = dz
                .index_axis(Axis(0), batch_idx)
                .t()
                .dot(&self.kernels_mat)
                .into_shape_with_order((nb_locations, self.in_channels, k, k))
                .expect("patch gradients reshape into (locations, in_channels, k, k)");
            for (patch_idx, patch_grad) in grad_patches.outer_iter().enumerate() {
                let top_y = patch_idx / out_width;
                let top_x = patch_idx % out_width;
                let mut dinput_slice =
                    dinput.slice_mut(s![batch_idx, .., top_y..top_y + k, top_x..top_x + k]);
                dinput_slice += &patch_grad;
            }
        }

        match self.padding {
            Padding::Valid => dinput.into_dyn(),
            Padding::Same => {
                let (before, _) = same_padding(k);
                dinput
                    .slice(s![.., .., before..before + in_height, before..before + in_width])
                    .to_owned()
                    .into_dyn()
            }
        }
    }

    /// Also drops the im2col cache, the largest buffer of the network.
    fn zero_grad(&mut self) {
        self.k_grad = None;
        self.b_grad = None;
        self.last_input = None;
        self.last_input_hw = None;
    }
}

/// `k x k` max pooling with stride `k`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: (usize, usize),
    padding: Padding,
    // for backprop
    #[serde(skip)]
    last_input_max_mask: Option<Array6<f32>>, // (batch_size, in_channels, out_height, k, out_width, k)
    #[serde(skip)]
    last_input_hw: Option<(usize, usize)>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize), padding: Padding) -> MaxPoolLayer {
        assert!(pool_size.0 == pool_size.1, "only square pooling windows are supported");
        MaxPoolLayer {
            pool_size,
            padding,
            last_input_max_mask: None,
            last_input_hw: None,
        }
    }

    pub fn output_hw(&self, height: usize, width: usize) -> (usize, usize) {
        let k = self.pool_size.0;
        match self.padding {
            Padding::Valid => (height / k, width / k),
            Padding::Same => (height.div_ceil(k), width.div_ceil(k)),
        }
    }

    /// Rows and columns of padding before the input, `(top, left)`.
    fn pad_before(&self, height: usize, width: usize) -> (usize, usize) {
        let k = self.pool_size.0;
        match self.padding {
            Padding::Valid => (0, 0),
            Padding::Same => {
                let (out_height, out_width) = self.output_hw(height, width);
                ((out_height * k - height) / 2, (out_width * k - width) / 2)
            }
        }
    }
}

impl Module for MaxPoolLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("[forward] [maxPool] input is a 4D tensor");

        let (batch_size, in_channels, height, width) = input.dim();
        let k = self.pool_size.0;
        let (out_height, out_width) = self.output_hw(height, width);
        let (covered_height, covered_width) = (out_height * k, out_width * k);

        // Windows tile exactly (covered_height, covered_width): SAME pads the
        // borders with -inf, VALID drops the leftover bottom rows/right cols.
        let input = if (covered_height, covered_width) == (height, width) {
            input
        } else {
            let (top, left) = self.pad_before(height, width);
            let mut tiled = Array4::from_elem(
                (batch_size, in_channels, covered_height, covered_width),
                f32::NEG_INFINITY,
            );
            let (h, w) = (height.min(covered_height), width.min(covered_width));
            tiled
                .slice_mut(s![.., .., top..top + h, left..left + w])
                .assign(&input.slice(s![.., .., ..h, ..w]));
            tiled
        };

        let input_6d = input
            .to_shape((batch_size, in_channels, out_height, k, out_width, k))
            .expect("[forward] [maxPool] input is compatible with 6D tensor for the pooling");

        // Fold the dims with size k, i.e axis 3 and 5 of input
        let pooled: Array4<f32> = input_6d
            .fold_axis(Axis(3), f32::NEG_INFINITY, |&a, &b| a.max(b))
            .fold_axis(Axis(5 - 1), f32::NEG_INFINITY, |&a, &b| a.max(b));

        // Mask of where the max values are (for backprop)
        let mut input_mask_6d =
            Array6::zeros((batch_size, in_channels, out_height, k, out_width, k));
        {
            let pooled_6d = pooled
                .to_shape((batch_size, in_channels, out_height, 1, out_width, 1))
                .expect("[forward] [maxPool] pooled output reshapes to 6D");

            Zip::from(&mut input_mask_6d)
                .and(&input_6d)
                .and_broadcast(&pooled_6d)
                .for_each(|w, &in_val, &max_val| {
                    // NOTE: ties all receive the gradient. Behind a ReLU the only
                    // common tie is 0.0, whose gradient the ReLU discards anyway.
                    if in_val == max_val {
                        *w = 1.0
                    }
                });
        }

        self.last_input_max_mask = Some(input_mask_6d);
        self.last_input_hw = Some((height, width));

        pooled.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        // dz: (batch_size, channels, out_height, out_width)
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [maxPool] dz is 4D");

        let (batch_size, channels, out_height, out_width) = dz.dim();
        let k = self.pool_size.0;

        let dz_6d = dz
            .to_shape((batch_size, channels, out_height, 1, out_width, 1))
            .expect("[backward] [maxPool] dz reshapes to 6D");

        let input_mask = self
            .last_input_max_mask
            .as_ref()
            .expect("[backward] [maxPool] Run forward before backward");
        let (height, width) = self
            .last_input_hw
            .expect("[backward] [maxPool] Run forward before backward");

        let mut dtiled = Array6::zeros((batch_size, channels, out_height, k, out_width, k));
        Zip::from(&mut dtiled)
            .and(input_mask)
            .and_broadcast(&dz_6d)
            .for_each(|din, &mask_val, &dz_val| {
                if mask_val == 1.0 {
                    *din += dz_val;
                }
            });

        let dtiled = dtiled
            .into_shape_with_order((batch_size, channels, out_height * k, out_width * k))
            .expect("[backward] [maxPool] dinput is compatible with expected 4D tensor");

        if dtiled.dim() == (batch_size, channels, height, width) {
            return dtiled.into_dyn();
        }
        let (top, left) = self.pad_before(height, width);
        let mut dinput = Array4::zeros((batch_size, channels, height, width));
        let (h, w) = (height.min(out_height * k), width.min(out_width * k));
        dinput
            .slice_mut(s![.., .., ..h, ..w])
            .assign(&dtiled.slice(s![.., .., top..top + h, left..left + w]));
        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_input_max_mask = None;
        self.last_input_hw = None;
    }
}

/// `(batch, channels, height, width) -> (batch, channels * height * width)`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FlattenLayer {
    #[serde(skip)]
    last_input_shape: Option<Vec<usize>>,
}

impl FlattenLayer {
    pub fn new() -> FlattenLayer {
        FlattenLayer {
            last_input_shape: None,
        }
    }
}

impl Module for FlattenLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.last_input_shape = Some(input.shape().to_vec());
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Flatten layer input should be 4D");
        let (batch_size, in_channels, height, width) = input.dim();
        input
            .to_shape((batch_size, in_channels * height * width))
            .expect("flatten input to 2D array should not fail")
            .into_owned()
            .into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let last_input_shape = self
            .last_input_shape
            .as_ref()
            .expect("Need to do a forward pass before the backward");
        dz.to_shape(last_input_shape.as_slice())
            .expect("should be able to reshape the incoming gradient")
            .into_owned()
    }

    fn zero_grad(&mut self) {
        self.last_input_shape = None;
    }
}

/// `(batch, features) -> (batch, dims...)`, e.g. row-vector images to
/// `(batch, 1, 28, 28)` feature maps.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReshapeLayer {
    dims: Vec<usize>,
    #[serde(skip)]
    last_input_shape: Option<Vec<usize>>,
}

impl ReshapeLayer {
    pub fn new(dims: &[usize]) -> ReshapeLayer {
        ReshapeLayer {
            dims: dims.to_vec(),
            last_input_shape: None,
        }
    }
}

impl Module for ReshapeLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let batch_size = input.shape()[0];
        let features: usize = input.shape()[1..].iter().product();
        assert!(
            features == self.dims.iter().product::<usize>(),
            "cannot reshape {} features into {:?}",
            features,
            self.dims
        );
        self.last_input_shape = Some(input.shape().to_vec());

        let mut shape = vec![batch_size];
        shape.extend_from_slice(&self.dims);
        input
            .to_shape(shape)
            .expect("element count was checked above")
            .into_owned()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let last_input_shape = self
            .last_input_shape
            .as_ref()
            .expect("Need to do a forward pass before the backward");
        dz.to_shape(last_input_shape.as_slice())
            .expect("should be able to reshape the incoming gradient")
            .into_owned()
    }

    fn zero_grad(&mut self) {
        self.last_input_shape = None;
    }
}
