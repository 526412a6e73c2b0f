//! # strata-cpu
//!
//! Host-memory reference backend for Strata.
//!
//! - [`CpuDevice`] charges every allocation against a shared byte counter and
//!   can be given a hard limit, so out-of-memory paths are reproducible.
//! - [`CpuStorage`] keeps elements in their declared dtype (F16, BF16, F32,
//!   F64); kernels compute in f64.
//! - [`CpuBackend`] implements every kernel of the [`Backend`] contract.
//!   Convolution parallelises over the batch with rayon.

mod device;
mod kernels;
mod storage;

pub use device::{CpuDevice, MemoryStats};
pub use storage::CpuStorage;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_core::{
    ActivationMode, AdamParams, Backend, BackendStorage, Blend, ConvParams, DType, Dst, Error,
    NormState, PoolParams, Result, Shape, Src,
};

use kernels::Geometry;
use storage::{read, same_dtype, write};

/// The CPU backend marker type.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Convenience aliases.
pub type CpuVolume = strata_core::Volume<CpuBackend>;
pub type CpuWorkspace = strata_core::Workspace<CpuBackend>;

fn per_channel(values: &[f64], channels: usize, what: &Shape) -> Result<()> {
    if values.len() != channels {
        return Err(Error::incompatible(
            what,
            format!("expected one entry per channel ({channels})"),
        ));
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    //  Memory

    fn alloc_zeroed(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        let len = shape.elem_count();
        device.charge(len * dtype.size_in_bytes())?;
        Ok(CpuStorage::zeros(len, dtype))
    }

    fn release(storage: CpuStorage, device: &CpuDevice) {
        device.credit(storage.len() * storage.dtype().size_in_bytes());
    }

    fn fill(dst: &mut CpuStorage, value: f64) -> Result<()> {
        dst.fill(value);
        Ok(())
    }

    fn fill_uniform(dst: &mut CpuStorage, low: f64, high: f64, seed: u64) -> Result<()> {
        if !(low <= high) {
            return Err(Error::invalid("range", format!("[{low}, {high}) is empty")));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..dst.len() {
            let u: f64 = rng.gen();
            dst.set(i, low + (high - low) * u);
        }
        Ok(())
    }

    fn write_f64(dst: &mut CpuStorage, values: &[f64]) -> Result<()> {
        dst.copy_from_f64(values)
    }

    fn read_f64(src: &CpuStorage) -> Result<Vec<f64>> {
        Ok(src.to_f64_vec())
    }

    //  Data movement

    fn transform(src: Src<'_, CpuStorage>, dst: Dst<'_, CpuStorage>, blend: Blend) -> Result<()> {
        if !src.layout.is_strided() || !dst.layout.is_strided() {
            return Err(Error::DescriptorKind { op: "transform" });
        }
        if src.layout.dims() != dst.layout.dims() {
            return Err(Error::incompatible(
                src.layout.shape(),
                format!("cannot copy into region {}", dst.layout.shape()),
            ));
        }
        same_dtype(src.storage.dtype(), &[dst.storage.dtype()])?;
        let values = read(&src)?;
        write(dst, &values, blend)
    }

    fn op_add(
        a: Src<'_, CpuStorage>,
        a_scale: f64,
        b: Src<'_, CpuStorage>,
        b_scale: f64,
        dst: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(a.storage.dtype(), &[b.storage.dtype(), dst.storage.dtype()])?;
        let (av, bv) = (read(&a)?, read(&b)?);
        if av.len() != bv.len() {
            return Err(Error::incompatible(
                a.layout.shape(),
                format!("cannot add {}", b.layout.shape()),
            ));
        }
        let sum: Vec<f64> = av
            .iter()
            .zip(&bv)
            .map(|(&x, &y)| a_scale * x + b_scale * y)
            .collect();
        write(dst, &sum, blend)
    }

    //  Convolution

    fn conv_forward(
        x: Src<'_, CpuStorage>,
        w: Src<'_, CpuStorage>,
        y: Dst<'_, CpuStorage>,
        params: &ConvParams,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(x.storage.dtype(), &[w.storage.dtype(), y.storage.dtype()])?;
        let (xg, wg, yg) = (
            Geometry::of(x.layout)?,
            Geometry::of(w.layout)?,
            Geometry::of(y.layout)?,
        );
        let taps = kernels::conv_taps(&xg, &wg, &yg, params)?;
        let out = kernels::conv_forward(&read(&x)?, &xg, &read(&w)?, &wg, &yg, &taps);
        write(y, &out, blend)
    }

    fn conv_backward_data(
        w: Src<'_, CpuStorage>,
        dy: Src<'_, CpuStorage>,
        dx: Dst<'_, CpuStorage>,
        params: &ConvParams,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(w.storage.dtype(), &[dy.storage.dtype(), dx.storage.dtype()])?;
        let (wg, yg, xg) = (
            Geometry::of(w.layout)?,
            Geometry::of(dy.layout)?,
            Geometry::of(dx.layout)?,
        );
        let taps = kernels::conv_taps(&xg, &wg, &yg, params)?;
        let out = kernels::conv_backward_data(&read(&w)?, &wg, &read(&dy)?, &yg, &xg, &taps);
        write(dx, &out, blend)
    }

    fn conv_backward_filter(
        x: Src<'_, CpuStorage>,
        dy: Src<'_, CpuStorage>,
        dw: Dst<'_, CpuStorage>,
        params: &ConvParams,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(x.storage.dtype(), &[dy.storage.dtype(), dw.storage.dtype()])?;
        let (xg, yg, wg) = (
            Geometry::of(x.layout)?,
            Geometry::of(dy.layout)?,
            Geometry::of(dw.layout)?,
        );
        let taps = kernels::conv_taps(&xg, &wg, &yg, params)?;
        let out = kernels::conv_backward_filter(&read(&x)?, &xg, &read(&dy)?, &yg, &wg, &taps);
        write(dw, &out, blend)
    }

    fn bias_forward(b: Src<'_, CpuStorage>, y: Dst<'_, CpuStorage>) -> Result<()> {
        same_dtype(b.storage.dtype(), &[y.storage.dtype()])?;
        let yg = Geometry::of(y.layout)?;
        let bias = read(&b)?;
        per_channel(&bias, yg.channels, b.layout.shape())?;
        let out: Vec<f64> = y
            .storage
            .gather(y.layout)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v + bias[yg.channel_of(i)])
            .collect();
        write(y, &out, Blend::OVERWRITE)
    }

    fn bias_backward(
        dy: Src<'_, CpuStorage>,
        db: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(dy.storage.dtype(), &[db.storage.dtype()])?;
        let yg = Geometry::of(dy.layout)?;
        let sums = kernels::channel_sums(&read(&dy)?, &yg);
        if db.layout.elem_count() != sums.len() {
            return Err(Error::incompatible(
                db.layout.shape(),
                format!("expected one entry per channel ({})", sums.len()),
            ));
        }
        write(db, &sums, blend)
    }

    //  Activation

    fn activation_forward(
        mode: ActivationMode,
        x: Src<'_, CpuStorage>,
        y: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(x.storage.dtype(), &[y.storage.dtype()])?;
        let out = kernels::activation_forward(mode, &read(&x)?);
        write(y, &out, blend)
    }

    fn activation_backward(
        mode: ActivationMode,
        x: Src<'_, CpuStorage>,
        y: Src<'_, CpuStorage>,
        dy: Src<'_, CpuStorage>,
        dx: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(
            x.storage.dtype(),
            &[y.storage.dtype(), dy.storage.dtype(), dx.storage.dtype()],
        )?;
        let out = kernels::activation_backward(mode, &read(&x)?, &read(&y)?, &read(&dy)?);
        write(dx, &out, blend)
    }

    fn prelu_forward(
        x: Src<'_, CpuStorage>,
        alpha: Src<'_, CpuStorage>,
        y: Dst<'_, CpuStorage>,
    ) -> Result<()> {
        same_dtype(x.storage.dtype(), &[alpha.storage.dtype(), y.storage.dtype()])?;
        let xv = read(&x)?;
        let av = read(&alpha)?;
        let per = Geometry::of(x.layout)?.sample_len();
        if av.len() != per {
            return Err(Error::incompatible(
                alpha.layout.shape(),
                format!("coefficients must cover one sample of {}", x.layout.shape()),
            ));
        }
        let out: Vec<f64> = xv
            .iter()
            .enumerate()
            .map(|(i, &v)| if v > 0.0 { v } else { av[i % per] * v })
            .collect();
        write(y, &out, Blend::OVERWRITE)
    }

    fn prelu_backward(
        x: Src<'_, CpuStorage>,
        alpha: Src<'_, CpuStorage>,
        dy: Src<'_, CpuStorage>,
        dx: Option<Dst<'_, CpuStorage>>,
        dalpha: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(
            x.storage.dtype(),
            &[alpha.storage.dtype(), dy.storage.dtype(), dalpha.storage.dtype()],
        )?;
        let (xv, av, gv) = (read(&x)?, read(&alpha)?, read(&dy)?);
        let per = av.len();
        if per == 0 || xv.len() % per != 0 {
            return Err(Error::incompatible(
                alpha.layout.shape(),
                format!("coefficients must cover one sample of {}", x.layout.shape()),
            ));
        }
        let mut da = vec![0.0; per];
        for (i, (&v, &g)) in xv.iter().zip(&gv).enumerate() {
            if v <= 0.0 {
                da[i % per] += g * v;
            }
        }
        write(dalpha, &da, Blend::ACCUMULATE)?;
        if let Some(dx) = dx {
            let out: Vec<f64> = xv
                .iter()
                .zip(&gv)
                .enumerate()
                .map(|(i, (&v, &g))| if v > 0.0 { g } else { av[i % per] * g })
                .collect();
            write(dx, &out, blend)?;
        }
        Ok(())
    }

    //  Pooling

    fn pool_forward(
        params: &PoolParams,
        x: Src<'_, CpuStorage>,
        y: Dst<'_, CpuStorage>,
    ) -> Result<()> {
        same_dtype(x.storage.dtype(), &[y.storage.dtype()])?;
        let (xg, yg) = (Geometry::of(x.layout)?, Geometry::of(y.layout)?);
        let taps = kernels::pool_taps(&xg, &yg, params)?;
        let out = kernels::pool_forward(params.mode, &read(&x)?, &xg, &yg, &taps);
        write(y, &out, Blend::OVERWRITE)
    }

    fn pool_backward(
        params: &PoolParams,
        x: Src<'_, CpuStorage>,
        y: Src<'_, CpuStorage>,
        dy: Src<'_, CpuStorage>,
        dx: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(
            x.storage.dtype(),
            &[y.storage.dtype(), dy.storage.dtype(), dx.storage.dtype()],
        )?;
        let (xg, yg) = (Geometry::of(x.layout)?, Geometry::of(y.layout)?);
        let taps = kernels::pool_taps(&xg, &yg, params)?;
        let out = kernels::pool_backward(params.mode, &read(&x)?, &xg, &read(&dy)?, &yg, &taps);
        write(dx, &out, blend)
    }

    //  Dropout

    fn dropout_forward(
        p: f64,
        seed: u64,
        x: Src<'_, CpuStorage>,
        y: Dst<'_, CpuStorage>,
        reserve: &mut CpuStorage,
    ) -> Result<()> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::invalid("p", format!("{p} is outside [0, 1)")));
        }
        let xv = read(&x)?;
        if reserve.len() != xv.len() {
            return Err(Error::incompatible(
                x.layout.shape(),
                format!("reserve holds {} elements", reserve.len()),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (1.0 - p);
        let mut out = Vec::with_capacity(xv.len());
        for (i, v) in xv.into_iter().enumerate() {
            let keep = if rng.gen::<f64>() >= p { 1.0 } else { 0.0 };
            reserve.set(i, keep);
            out.push(v * keep * scale);
        }
        write(y, &out, Blend::OVERWRITE)
    }

    fn dropout_backward(
        p: f64,
        dy: Src<'_, CpuStorage>,
        reserve: &CpuStorage,
        dx: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        let gv = read(&dy)?;
        if reserve.len() != gv.len() {
            return Err(Error::incompatible(
                dy.layout.shape(),
                format!("reserve holds {} elements", reserve.len()),
            ));
        }
        let scale = 1.0 / (1.0 - p);
        let out: Vec<f64> = gv
            .iter()
            .enumerate()
            .map(|(i, &g)| g * reserve.get(i) * scale)
            .collect();
        write(dx, &out, blend)
    }

    //  Batch normalization

    fn batchnorm_forward_training(
        x: Src<'_, CpuStorage>,
        scale: Src<'_, CpuStorage>,
        bias: Src<'_, CpuStorage>,
        y: Dst<'_, CpuStorage>,
        state: NormState<'_, CpuStorage>,
        momentum: f64,
        eps: f64,
    ) -> Result<()> {
        same_dtype(
            x.storage.dtype(),
            &[scale.storage.dtype(), bias.storage.dtype(), y.storage.dtype()],
        )?;
        let g = Geometry::of(x.layout)?;
        let (sv, bv) = (read(&scale)?, read(&bias)?);
        per_channel(&sv, g.channels, scale.layout.shape())?;
        per_channel(&bv, g.channels, bias.layout.shape())?;
        let xv = read(&x)?;
        let (mean, var) = kernels::channel_moments(&xv, &g);
        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();
        let out = kernels::normalize(&xv, &g, &mean, &inv_std, &sv, &bv);

        let m = (g.batch * g.spatial_count()) as f64;
        let unbias = if m > 1.0 { m / (m - 1.0) } else { 1.0 };
        let mut rm = state.running_mean.to_f64_vec();
        let mut rv = state.running_var.to_f64_vec();
        per_channel(&rm, g.channels, scale.layout.shape())?;
        per_channel(&rv, g.channels, scale.layout.shape())?;
        for c in 0..g.channels {
            rm[c] = (1.0 - momentum) * rm[c] + momentum * mean[c];
            rv[c] = (1.0 - momentum) * rv[c] + momentum * var[c] * unbias;
        }
        state.running_mean.copy_from_f64(&rm)?;
        state.running_var.copy_from_f64(&rv)?;
        state.saved_mean.copy_from_f64(&mean)?;
        state.saved_inv_std.copy_from_f64(&inv_std)?;
        write(y, &out, Blend::OVERWRITE)
    }

    fn batchnorm_forward_inference(
        x: Src<'_, CpuStorage>,
        scale: Src<'_, CpuStorage>,
        bias: Src<'_, CpuStorage>,
        running_mean: &CpuStorage,
        running_var: &CpuStorage,
        y: Dst<'_, CpuStorage>,
        eps: f64,
    ) -> Result<()> {
        same_dtype(
            x.storage.dtype(),
            &[scale.storage.dtype(), bias.storage.dtype(), y.storage.dtype()],
        )?;
        let g = Geometry::of(x.layout)?;
        let (sv, bv) = (read(&scale)?, read(&bias)?);
        let mean = running_mean.to_f64_vec();
        let inv_std: Vec<f64> = running_var
            .to_f64_vec()
            .iter()
            .map(|v| 1.0 / (v + eps).sqrt())
            .collect();
        for v in [&sv, &bv, &mean, &inv_std] {
            per_channel(v, g.channels, scale.layout.shape())?;
        }
        let out = kernels::normalize(&read(&x)?, &g, &mean, &inv_std, &sv, &bv);
        write(y, &out, Blend::OVERWRITE)
    }

    fn batchnorm_backward(
        x: Src<'_, CpuStorage>,
        dy: Src<'_, CpuStorage>,
        scale: Src<'_, CpuStorage>,
        saved_mean: &CpuStorage,
        saved_inv_std: &CpuStorage,
        dx: Option<Dst<'_, CpuStorage>>,
        dscale: Dst<'_, CpuStorage>,
        dbias: Dst<'_, CpuStorage>,
        blend: Blend,
    ) -> Result<()> {
        same_dtype(
            x.storage.dtype(),
            &[dy.storage.dtype(), scale.storage.dtype()],
        )?;
        let g = Geometry::of(x.layout)?;
        let sv = read(&scale)?;
        let mean = saved_mean.to_f64_vec();
        let inv_std = saved_inv_std.to_f64_vec();
        for v in [&sv, &mean, &inv_std] {
            per_channel(v, g.channels, scale.layout.shape())?;
        }
        let (dxv, ds, db) =
            kernels::batchnorm_backward(&read(&x)?, &read(&dy)?, &g, &sv, &mean, &inv_std);
        write(dscale, &ds, Blend::ACCUMULATE)?;
        write(dbias, &db, Blend::ACCUMULATE)?;
        if let Some(dx) = dx {
            write(dx, &dxv, blend)?;
        }
        Ok(())
    }

    //  Softmax

    fn softmax_forward(x: Src<'_, CpuStorage>, y: Dst<'_, CpuStorage>) -> Result<()> {
        same_dtype(x.storage.dtype(), &[y.storage.dtype()])?;
        let g = Geometry::of(x.layout)?;
        let out = kernels::softmax(&read(&x)?, &g);
        write(y, &out, Blend::OVERWRITE)
    }

    //  Training

    fn adam_step(
        weight: &mut CpuStorage,
        gradient: &mut CpuStorage,
        first_moment: &mut CpuStorage,
        second_moment: &mut CpuStorage,
        params: &AdamParams,
    ) -> Result<(f64, f64)> {
        let n = weight.len();
        for (what, len) in [
            ("gradient", gradient.len()),
            ("first moment", first_moment.len()),
            ("second moment", second_moment.len()),
        ] {
            if len != n {
                return Err(Error::invariant(format!(
                    "{what} holds {len} elements, weight holds {n}"
                )));
            }
        }
        if params.step == 0 {
            return Err(Error::invalid("step", "Adam steps are counted from 1"));
        }
        if params.batch <= 0.0 {
            return Err(Error::invalid("batch", format!("{} is not positive", params.batch)));
        }
        let t = params.step as i32;
        let correct1 = 1.0 - params.beta1.powi(t);
        let correct2 = 1.0 - params.beta2.powi(t);
        let (mut l1, mut l2) = (0.0, 0.0);
        for i in 0..n {
            let w = weight.get(i);
            l1 += params.decay1 * w.abs();
            l2 += 0.5 * params.decay2 * w * w;
            let g = gradient.get(i) / params.batch + params.decay2 * w + params.decay1 * w.signum();
            let m = params.beta1 * first_moment.get(i) + (1.0 - params.beta1) * g;
            let v = params.beta2 * second_moment.get(i) + (1.0 - params.beta2) * g * g;
            first_moment.set(i, m);
            second_moment.set(i, v);
            let step = params.rate * (m / correct1) / ((v / correct2).sqrt() + params.eps);
            weight.set(i, w - step);
        }
        gradient.fill(0.0);
        Ok((l1, l2))
    }
}
