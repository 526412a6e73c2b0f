use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — Abstraction over compute devices
//
// The core never does numeric work itself. It hands the backend storage
// handles plus the shape/format/stride metadata in a Layout, and the backend
// runs the kernel in place on device memory.
//
// Every kernel that writes a result takes a Blend, the scalar coefficient
// pair that decides how the result lands in the destination:
//
//   dst = alpha * result + beta * dst
//
// Overwrite is (1, 0); accumulate is (1, 1). Weight gradients are always
// accumulated so that several Backward calls may feed one Update.
//
// Kernels are associated functions over storages, the same shape as the
// reference CPU/CUDA split: each backend brings its own Device and Storage.

/// Identifies a compute device (e.g., "cpu", "cuda:0").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;
}

/// A device buffer holding the elements of one Volume.
pub trait BackendStorage: Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only kernel operand: storage plus the descriptor to read it through.
pub struct Src<'a, S> {
    pub storage: &'a S,
    pub layout: &'a Layout,
}

/// Writable kernel operand.
pub struct Dst<'a, S> {
    pub storage: &'a mut S,
    pub layout: &'a Layout,
}

/// Scalar coefficients applied when a kernel writes its destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blend {
    pub alpha: f64,
    pub beta: f64,
}

impl Blend {
    pub const OVERWRITE: Blend = Blend {
        alpha: 1.0,
        beta: 0.0,
    };
    pub const ACCUMULATE: Blend = Blend {
        alpha: 1.0,
        beta: 1.0,
    };

    pub fn new(alpha: f64, beta: f64) -> Self {
        Blend { alpha, beta }
    }
}

/// Sliding-window parameters shared by convolution and its transpose.
/// One entry per spatial dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub padding: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
}

/// Element-wise activation functions without learnable parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationMode {
    Relu,
    LeakyRelu { slope: f64 },
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average,
}

/// Pooling window parameters, one entry per spatial dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub mode: PoolMode,
    pub window: Vec<usize>,
    pub padding: Vec<usize>,
    pub stride: Vec<usize>,
}

/// Per-channel state carried by spatial batch normalization.
pub struct NormState<'a, S> {
    pub running_mean: &'a mut S,
    pub running_var: &'a mut S,
    pub saved_mean: &'a mut S,
    pub saved_inv_std: &'a mut S,
}

/// Hyperparameters for one Adam step on one weight tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L1 regularisation coefficient.
    pub decay1: f64,
    /// L2 regularisation coefficient.
    pub decay2: f64,
    /// Gradients are divided by this before use.
    pub batch: f64,
    /// 1-based step counter for bias correction.
    pub step: usize,
}

/// The compute-backend contract.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    //  Memory

    /// Allocate zero-filled storage for `shape`. Fails with
    /// `Error::Allocation` when the device is out of memory.
    fn alloc_zeroed(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Return storage to the device.
    fn release(storage: Self::Storage, device: &Self::Device);

    /// Set every element to `value`.
    fn fill(dst: &mut Self::Storage, value: f64) -> Result<()>;

    /// Fill with values drawn uniformly from `[low, high)` using `seed`.
    fn fill_uniform(dst: &mut Self::Storage, low: f64, high: f64, seed: u64) -> Result<()>;

    /// Copy host values into device storage.
    fn write_f64(dst: &mut Self::Storage, values: &[f64]) -> Result<()>;

    /// Copy device storage back to the host.
    fn read_f64(src: &Self::Storage) -> Result<Vec<f64>>;

    //  Data movement

    /// Copy the region `src` describes into the region `dst` describes.
    /// Both descriptors must be strided; shapes must match.
    fn transform(src: Src<'_, Self::Storage>, dst: Dst<'_, Self::Storage>, blend: Blend)
        -> Result<()>;

    /// `dst = blend.alpha * (a_scale * a + b_scale * b) + blend.beta * dst`
    fn op_add(
        a: Src<'_, Self::Storage>,
        a_scale: f64,
        b: Src<'_, Self::Storage>,
        b_scale: f64,
        dst: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    //  Convolution

    fn conv_forward(
        x: Src<'_, Self::Storage>,
        w: Src<'_, Self::Storage>,
        y: Dst<'_, Self::Storage>,
        params: &ConvParams,
        blend: Blend,
    ) -> Result<()>;

    fn conv_backward_data(
        w: Src<'_, Self::Storage>,
        dy: Src<'_, Self::Storage>,
        dx: Dst<'_, Self::Storage>,
        params: &ConvParams,
        blend: Blend,
    ) -> Result<()>;

    fn conv_backward_filter(
        x: Src<'_, Self::Storage>,
        dy: Src<'_, Self::Storage>,
        dw: Dst<'_, Self::Storage>,
        params: &ConvParams,
        blend: Blend,
    ) -> Result<()>;

    /// Add a per-channel bias to every element of `y`.
    fn bias_forward(b: Src<'_, Self::Storage>, y: Dst<'_, Self::Storage>) -> Result<()>;

    /// Reduce `dy` over everything but the channel axis into `db`.
    fn bias_backward(
        dy: Src<'_, Self::Storage>,
        db: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    //  Activation

    fn activation_forward(
        mode: ActivationMode,
        x: Src<'_, Self::Storage>,
        y: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    fn activation_backward(
        mode: ActivationMode,
        x: Src<'_, Self::Storage>,
        y: Src<'_, Self::Storage>,
        dy: Src<'_, Self::Storage>,
        dx: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    /// Parametric ReLU: `y = x` for positive x, `alpha * x` otherwise.
    /// `alpha` has the per-sample shape of `x` (batch dimension 1).
    fn prelu_forward(
        x: Src<'_, Self::Storage>,
        alpha: Src<'_, Self::Storage>,
        y: Dst<'_, Self::Storage>,
    ) -> Result<()>;

    /// Writes `dx` (when given) through `blend` and accumulates the
    /// coefficient gradient.
    fn prelu_backward(
        x: Src<'_, Self::Storage>,
        alpha: Src<'_, Self::Storage>,
        dy: Src<'_, Self::Storage>,
        dx: Option<Dst<'_, Self::Storage>>,
        dalpha: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    //  Pooling

    fn pool_forward(
        params: &PoolParams,
        x: Src<'_, Self::Storage>,
        y: Dst<'_, Self::Storage>,
    ) -> Result<()>;

    fn pool_backward(
        params: &PoolParams,
        x: Src<'_, Self::Storage>,
        y: Src<'_, Self::Storage>,
        dy: Src<'_, Self::Storage>,
        dx: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    //  Dropout

    /// Draws a keep-mask into `reserve` and writes `x * mask / (1 - p)`.
    fn dropout_forward(
        p: f64,
        seed: u64,
        x: Src<'_, Self::Storage>,
        y: Dst<'_, Self::Storage>,
        reserve: &mut Self::Storage,
    ) -> Result<()>;

    /// Applies the mask drawn by the matching forward call.
    fn dropout_backward(
        p: f64,
        dy: Src<'_, Self::Storage>,
        reserve: &Self::Storage,
        dx: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    //  Batch normalization (spatial: statistics per channel)

    #[allow(clippy::too_many_arguments)]
    fn batchnorm_forward_training(
        x: Src<'_, Self::Storage>,
        scale: Src<'_, Self::Storage>,
        bias: Src<'_, Self::Storage>,
        y: Dst<'_, Self::Storage>,
        state: NormState<'_, Self::Storage>,
        momentum: f64,
        eps: f64,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn batchnorm_forward_inference(
        x: Src<'_, Self::Storage>,
        scale: Src<'_, Self::Storage>,
        bias: Src<'_, Self::Storage>,
        running_mean: &Self::Storage,
        running_var: &Self::Storage,
        y: Dst<'_, Self::Storage>,
        eps: f64,
    ) -> Result<()>;

    /// Writes `dx` (when given) through `blend` and accumulates scale/bias
    /// gradients.
    #[allow(clippy::too_many_arguments)]
    fn batchnorm_backward(
        x: Src<'_, Self::Storage>,
        dy: Src<'_, Self::Storage>,
        scale: Src<'_, Self::Storage>,
        saved_mean: &Self::Storage,
        saved_inv_std: &Self::Storage,
        dx: Option<Dst<'_, Self::Storage>>,
        dscale: Dst<'_, Self::Storage>,
        dbias: Dst<'_, Self::Storage>,
        blend: Blend,
    ) -> Result<()>;

    //  Softmax (over the channel axis)

    fn softmax_forward(x: Src<'_, Self::Storage>, y: Dst<'_, Self::Storage>) -> Result<()>;

    //  Training

    /// One bias-corrected Adam step with L1/L2 regularisation. Clears the
    /// gradient afterwards and returns the (l1, l2) regularisation losses.
    fn adam_step(
        weight: &mut Self::Storage,
        gradient: &mut Self::Storage,
        first_moment: &mut Self::Storage,
        second_moment: &mut Self::Storage,
        params: &AdamParams,
    ) -> Result<(f64, f64)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_constants() {
        assert_eq!(Blend::OVERWRITE, Blend::new(1.0, 0.0));
        assert_eq!(Blend::ACCUMULATE, Blend::new(1.0, 1.0));
    }
}
