use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use xn_conv::layout::{BlockedData, BlockedWeights};
use xn_conv::{
    BwdWeightsKernel, ConvDesc, ConvKind, ConvTuning, ConvolutionBwdData, ConvolutionBwdWeights,
    ConvolutionFwd, FixedGrid, GridStrategy, JobConfig, MemoryCostStrategy, RefBwdDataKernel,
    RefBwdWeightsKernel, RefFwdKernel, RefTranspose, ReductionGrid, Result, SIMD_W,
    TransposeKernel, WithDType,
};

/// Generates one test per element type combination, `(narrow, narrow, wide)` in the order the
/// tested function takes its type parameters.
macro_rules! test_dtypes {
    ($test_name:ident, $test_fn:ident) => {
        paste::paste! {
            #[test]
            fn [<$test_name _f32>]() -> Result<()> {
                $test_fn::<f32, f32, f32>()
            }

            #[test]
            fn [<$test_name _s16_s32>]() -> Result<()> {
                $test_fn::<i16, i16, i32>()
            }
        }
    };
}

// =============================================================================
// Helpers
// =============================================================================

fn job<S: WithDType, W: WithDType, D: WithDType>(
    kind: ConvKind,
    desc: ConvDesc,
    tuning: ConvTuning,
) -> Result<JobConfig> {
    let desc = ConvDesc { src_dtype: S::DTYPE, wei_dtype: W::DTYPE, dst_dtype: D::DTYPE, ..desc };
    JobConfig::new(kind, &desc, tuning)
}

/// Small integers so that every sum is exact, whatever the element type. Channels past
/// `c_real` in each group are left to zero.
fn random_data<T: WithDType>(
    rng: &mut StdRng,
    l: &BlockedData,
    nb_c_per_group: usize,
    c_real: usize,
) -> Vec<T> {
    let mut data = vec![T::zero(); l.elem_count()];
    for n in 0..l.mb {
        for cb in 0..l.nb_c {
            for d in 0..l.d {
                for h in 0..l.h {
                    for w in 0..l.w {
                        for c in 0..SIMD_W {
                            if (cb % nb_c_per_group) * SIMD_W + c < c_real {
                                let v = rng.random_range(-3i32..=3) as f64;
                                data[l.offset(n, cb, d, h, w, c)] = T::from_f64(v);
                            }
                        }
                    }
                }
            }
        }
    }
    data
}

fn random_vec<T: WithDType>(rng: &mut StdRng, len: usize) -> Vec<T> {
    (0..len).map(|_| T::from_f64(rng.random_range(-3i32..=3) as f64)).collect()
}

fn to_f64<T: WithDType>(v: &[T]) -> Vec<f64> {
    v.iter().map(|v| v.to_f64()).collect()
}

fn in_coord(o: usize, k: usize, stride: usize, pad: usize, dilate: usize, size: usize) -> Option<usize> {
    let i = (o * stride + k * (dilate + 1)) as isize - pad as isize;
    (i >= 0 && (i as usize) < size).then_some(i as usize)
}

/// Calls `f(n, g, oc, ic, [od, oh, ow], [id, ih, iw], [kd, kh, kw])` for every tap of the
/// convolution that does not fall in the padding.
fn for_each_tap(conf: &JobConfig, mut f: impl FnMut(usize, usize, usize, usize, [usize; 3], [usize; 3], [usize; 3])) {
    for n in 0..conf.mb {
        for g in 0..conf.ngroups {
            for oc in 0..conf.oc {
                for ic in 0..conf.ic {
                    for od in 0..conf.od {
                        for oh in 0..conf.oh {
                            for ow in 0..conf.ow {
                                for kd in 0..conf.kd {
                                    let Some(id) = in_coord(od, kd, conf.stride_d, conf.f_pad, conf.dilate_d, conf.id) else { continue };
                                    for kh in 0..conf.kh {
                                        let Some(ih) = in_coord(oh, kh, conf.stride_h, conf.t_pad, conf.dilate_h, conf.ih) else { continue };
                                        for kw in 0..conf.kw {
                                            let Some(iw) = in_coord(ow, kw, conf.stride_w, conf.l_pad, conf.dilate_w, conf.iw) else { continue };
                                            f(n, g, oc, ic, [od, oh, ow], [id, ih, iw], [kd, kh, kw])
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn fwd_reference<S: WithDType, W: WithDType, D: WithDType>(
    conf: &JobConfig,
    src: &[S],
    weights: &[W],
    bias: Option<&[D]>,
) -> Vec<f64> {
    let (sl, dl, wl) = (BlockedData::src(conf), BlockedData::dst(conf), BlockedWeights::new(conf));
    let mut acc = vec![0f64; dl.elem_count()];
    for_each_tap(conf, |n, g, oc, ic, [od, oh, ow], [id, ih, iw], [kd, kh, kw]| {
        let s = src[sl.offset(n, g * conf.nb_ic + ic / SIMD_W, id, ih, iw, ic % SIMD_W)];
        let w = weights[wl.offset(g, oc, ic, kd, kh, kw)];
        acc[dl.offset(n, g * conf.nb_oc + oc / SIMD_W, od, oh, ow, oc % SIMD_W)] +=
            s.to_f64() * w.to_f64();
    });
    for n in 0..conf.mb {
        for g in 0..conf.ngroups {
            for oc in 0..conf.oc {
                for od in 0..conf.od {
                    for oh in 0..conf.oh {
                        for ow in 0..conf.ow {
                            let cb = g * conf.nb_oc + oc / SIMD_W;
                            let v = &mut acc[dl.offset(n, cb, od, oh, ow, oc % SIMD_W)];
                            if let Some(bias) = bias
                                && oc < conf.oc_without_padding
                            {
                                *v += bias[g * conf.oc_without_padding + oc].to_f64();
                            }
                            if let Some(slope) = conf.kind.relu_slope()
                                && *v < 0.
                            {
                                *v *= slope as f64;
                            }
                            *v = D::from_f64(*v).to_f64();
                        }
                    }
                }
            }
        }
    }
    acc
}

fn bwd_data_reference<D: WithDType, W: WithDType, S: WithDType>(
    conf: &JobConfig,
    diff_dst: &[D],
    weights: &[W],
) -> Vec<f64> {
    let (sl, dl, wl) = (BlockedData::src(conf), BlockedData::dst(conf), BlockedWeights::new(conf));
    let mut acc = vec![0f64; sl.elem_count()];
    for_each_tap(conf, |n, g, oc, ic, [od, oh, ow], [id, ih, iw], [kd, kh, kw]| {
        let d = diff_dst[dl.offset(n, g * conf.nb_oc + oc / SIMD_W, od, oh, ow, oc % SIMD_W)];
        let w = weights[wl.offset(g, oc, ic, kd, kh, kw)];
        acc[sl.offset(n, g * conf.nb_ic + ic / SIMD_W, id, ih, iw, ic % SIMD_W)] +=
            d.to_f64() * w.to_f64();
    });
    acc.iter().map(|v| S::from_f64(*v).to_f64()).collect()
}

/// Weights gradient and per channel bias gradient, `ngroups * oc` padded channels.
fn bwd_weights_reference<S: WithDType, D: WithDType>(
    conf: &JobConfig,
    src: &[S],
    diff_dst: &[D],
) -> (Vec<f64>, Vec<f64>) {
    let (sl, dl, wl) = (BlockedData::src(conf), BlockedData::dst(conf), BlockedWeights::new(conf));
    let mut dw = vec![0f64; wl.elem_count()];
    for_each_tap(conf, |n, g, oc, ic, [od, oh, ow], [id, ih, iw], [kd, kh, kw]| {
        let s = src[sl.offset(n, g * conf.nb_ic + ic / SIMD_W, id, ih, iw, ic % SIMD_W)];
        let d = diff_dst[dl.offset(n, g * conf.nb_oc + oc / SIMD_W, od, oh, ow, oc % SIMD_W)];
        dw[wl.offset(g, oc, ic, kd, kh, kw)] += s.to_f64() * d.to_f64();
    });
    let mut db = vec![0f64; conf.ngroups * conf.oc];
    for n in 0..conf.mb {
        for g in 0..conf.ngroups {
            for oc in 0..conf.oc {
                for od in 0..conf.od {
                    for oh in 0..conf.oh {
                        for ow in 0..conf.ow {
                            let cb = g * conf.nb_oc + oc / SIMD_W;
                            db[g * conf.oc + oc] += diff_dst[dl.offset(n, cb, od, oh, ow, oc % SIMD_W)].to_f64();
                        }
                    }
                }
            }
        }
    }
    (dw, db)
}

// =============================================================================
// Forward tests
// =============================================================================

fn fwd_2d_padded_bias_impl<S: WithDType, W: WithDType, D: WithDType>() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let desc = ConvDesc {
        mb: 4,
        ic: 20,
        oc: 40,
        ih: 7,
        iw: 6,
        kh: 3,
        kw: 3,
        padding: [0, 1, 1],
        with_bias: true,
        ..Default::default()
    };
    let tuning = ConvTuning { mb_block: 2, ..Default::default() };
    let conf = job::<S, W, D>(ConvKind::ForwardPlain, desc, tuning)?;
    let src: Vec<S> = random_data(&mut rng, &BlockedData::src(&conf), conf.nb_ic, 20);
    let weights: Vec<W> = random_vec(&mut rng, BlockedWeights::new(&conf).elem_count());
    let bias: Vec<D> = random_vec(&mut rng, 40);

    let mut fwd = ConvolutionFwd::<S, W, D, _>::new(conf.clone(), RefFwdKernel, 3)?;
    let mut dst = vec![D::zero(); BlockedData::dst(&conf).elem_count()];
    fwd.execute(&src, &weights, Some(bias.as_slice()), &mut dst)?;
    assert_eq!(to_f64(&dst), fwd_reference(&conf, &src, &weights, Some(bias.as_slice())));

    let padded = fwd.padded_bias().expect("oc is not a multiple of 16");
    assert_eq!(padded.oc(), 48);
    assert_eq!(&padded.as_slice()[..40], bias.as_slice());
    assert!(padded.as_slice()[40..].iter().all(|v| *v == D::zero()));

    // The plan is replayed as is.
    let mut dst2 = vec![D::zero(); dst.len()];
    fwd.execute(&src, &weights, Some(bias.as_slice()), &mut dst2)?;
    assert_eq!(to_f64(&dst), to_f64(&dst2));
    Ok(())
}
test_dtypes!(fwd_2d_padded_bias, fwd_2d_padded_bias_impl);

fn fwd_3d_relu_impl<S: WithDType, W: WithDType, D: WithDType>() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(1337);
    let desc = ConvDesc {
        groups: 2,
        mb: 2,
        ic: 16,
        oc: 32,
        id: Some(4),
        ih: 5,
        iw: 5,
        kd: 2,
        kh: 3,
        kw: 3,
        stride: [1, 2, 1],
        padding: [0, 1, 1],
        dilation: [0, 0, 1],
        with_bias: true,
        ..Default::default()
    };
    let tuning = ConvTuning { mb_block: 2, oc_buffs: 2, ..Default::default() };
    let kind = ConvKind::ForwardWithActivation { negative_slope: 0.5 };
    let conf = job::<S, W, D>(kind, desc, tuning)?;
    assert!(conf.is_3d());
    let src: Vec<S> = random_data(&mut rng, &BlockedData::src(&conf), conf.nb_ic, 16);
    let weights: Vec<W> = random_vec(&mut rng, BlockedWeights::new(&conf).elem_count());
    let bias: Vec<D> = random_vec(&mut rng, conf.bias_elem_count());

    let mut fwd = ConvolutionFwd::<S, W, D, _>::new(conf.clone(), RefFwdKernel, 4)?;
    assert!(fwd.padded_bias().is_none());
    let mut dst = vec![D::zero(); BlockedData::dst(&conf).elem_count()];
    fwd.execute(&src, &weights, Some(bias.as_slice()), &mut dst)?;
    let expected = fwd_reference(&conf, &src, &weights, Some(bias.as_slice()));
    assert_eq!(to_f64(&dst), expected);
    assert!(expected.iter().any(|v| *v < 0.));
    Ok(())
}
test_dtypes!(fwd_3d_relu, fwd_3d_relu_impl);

#[test]
fn fwd_plan_covers_work_once() -> Result<()> {
    let desc = ConvDesc { mb: 4, oc: 48, ih: 4, ..Default::default() };
    let tuning = ConvTuning { mb_block: 2, ..Default::default() };
    let conf = JobConfig::new(ConvKind::ForwardPlain, &desc, tuning)?;
    let fwd = ConvolutionFwd::<f32, f32, f32, _>::new(conf, RefFwdKernel, 2)?;
    let partition = fwd.work_partition();
    assert_eq!(partition.work_amount(), 48);
    assert_eq!(partition.ranges(), &[0..24, 24..48]);

    let mut seen = vec![0usize; 48];
    for (ithr, chunks) in fwd.plan().iter().enumerate() {
        let mut flat = vec![];
        for c in chunks {
            for m in c.mb.clone() {
                // (g, mbb, row, c_iter, m) over extents (1, 2, 4, 3, 2).
                flat.push(((((c.g * 2 + c.mbb) * 4 + c.row) * 3) + c.c_iter) * 2 + m);
            }
        }
        assert_eq!(flat, partition.range(ithr).collect::<Vec<_>>());
        flat.iter().for_each(|i| seen[*i] += 1);
    }
    assert!(seen.iter().all(|v| *v == 1));
    Ok(())
}

// =============================================================================
// Backward data tests
// =============================================================================

fn bwd_data_2d_impl<D: WithDType, W: WithDType, S: WithDType>() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let desc = ConvDesc {
        mb: 3,
        ic: 40,
        oc: 20,
        ih: 6,
        iw: 5,
        kh: 3,
        kw: 2,
        stride: [1, 2, 1],
        padding: [0, 1, 0],
        ..Default::default()
    };
    let tuning = ConvTuning { ic_buffs: 3, ..Default::default() };
    let conf = job::<S, W, D>(ConvKind::BackwardData, desc, tuning)?;
    let diff_dst: Vec<D> = random_data(&mut rng, &BlockedData::dst(&conf), conf.nb_oc, 20);
    let weights: Vec<W> = random_vec(&mut rng, BlockedWeights::new(&conf).elem_count());

    let mut bwd = ConvolutionBwdData::<D, W, S, _>::new(conf.clone(), RefBwdDataKernel, 4)?;
    let mut diff_src = vec![S::from_f64(11.); BlockedData::src(&conf).elem_count()];
    bwd.execute(&diff_dst, &weights, &mut diff_src)?;
    assert_eq!(to_f64(&diff_src), bwd_data_reference::<D, W, S>(&conf, &diff_dst, &weights));
    Ok(())
}
test_dtypes!(bwd_data_2d, bwd_data_2d_impl);

fn bwd_data_3d_groups_impl<D: WithDType, W: WithDType, S: WithDType>() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(8);
    let desc = ConvDesc {
        groups: 2,
        mb: 2,
        ic: 32,
        oc: 16,
        id: Some(4),
        ih: 4,
        iw: 6,
        kd: 2,
        kh: 2,
        kw: 3,
        stride: [2, 1, 1],
        padding: [1, 0, 1],
        dilation: [0, 1, 0],
        ..Default::default()
    };
    let tuning = ConvTuning { mb_block: 2, ic_buffs: 2, ..Default::default() };
    let conf = job::<S, W, D>(ConvKind::BackwardData, desc, tuning)?;
    let diff_dst: Vec<D> = random_data(&mut rng, &BlockedData::dst(&conf), conf.nb_oc, 16);
    let weights: Vec<W> = random_vec(&mut rng, BlockedWeights::new(&conf).elem_count());

    let mut bwd = ConvolutionBwdData::<D, W, S, _>::new(conf.clone(), RefBwdDataKernel, 5)?;
    let expected_format = if S::DTYPE == W::DTYPE { "gOIdhw16o16i" } else { "gOIdhw8o16i2o" };
    assert_eq!(bwd.weights_format().to_string(), expected_format);
    let mut diff_src = vec![S::zero(); BlockedData::src(&conf).elem_count()];
    bwd.execute(&diff_dst, &weights, &mut diff_src)?;
    assert_eq!(to_f64(&diff_src), bwd_data_reference::<D, W, S>(&conf, &diff_dst, &weights));
    Ok(())
}
test_dtypes!(bwd_data_3d_groups, bwd_data_3d_groups_impl);

// =============================================================================
// Backward weights tests
// =============================================================================

#[derive(Debug, Default)]
struct CountingKernel {
    calls: AtomicUsize,
}

impl<S: WithDType, D: WithDType, W: WithDType> BwdWeightsKernel<S, D, W> for CountingKernel {
    fn name(&self) -> String {
        "counting".to_string()
    }

    fn backward_weights(
        &self,
        conf: &JobConfig,
        tr_src: &[S],
        tr_diff_dst: &[D],
        diff_weights: &mut [W],
    ) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        RefBwdWeightsKernel.backward_weights(conf, tr_src, tr_diff_dst, diff_weights)
    }
}

/// Delays every transposition, a worker starting to accumulate before the others of its
/// sharing set are done would read stale rows.
#[derive(Debug, Clone, Copy)]
struct SlowTranspose;

impl<T: WithDType> TransposeKernel<T> for SlowTranspose {
    fn transpose(&self, src: &[T], dst: &mut [T], rows: usize, width: usize) {
        std::thread::sleep(std::time::Duration::from_micros(200));
        RefTranspose.transpose(src, dst, rows, width)
    }
}

fn check_bwd_weights<S, D, W, T>(conf: &JobConfig, transpose: T, grids: &[ReductionGrid]) -> Result<()>
where
    S: WithDType,
    D: WithDType,
    W: WithDType,
    T: TransposeKernel<S> + TransposeKernel<D> + Copy,
{
    let mut rng = StdRng::seed_from_u64(grids.len() as u64);
    let src: Vec<S> =
        random_data(&mut rng, &BlockedData::src(conf), conf.nb_ic, conf.ic_without_padding);
    let diff_dst: Vec<D> =
        random_data(&mut rng, &BlockedData::dst(conf), conf.nb_oc, conf.oc_without_padding);
    let (dw_ref, db_ref) = bwd_weights_reference(conf, &src, &diff_dst);
    let bias_len =
        if conf.want_padded_bias() { conf.oc_without_padding } else { conf.bias_elem_count() };

    for grid in grids {
        let kernel = CountingKernel::default();
        let mut bwd = ConvolutionBwdWeights::<S, D, W, _, T>::new(
            conf.clone(),
            kernel,
            transpose,
            grid.nthr(),
            &FixedGrid(*grid),
        )?;
        assert_eq!(bwd.grid(), *grid);
        assert_eq!(bwd.ws_reduction_len(), (grid.nthr_mb - 1) * dw_ref.len());
        let mut diff_weights = vec![W::from_f64(5.); dw_ref.len()];
        let mut diff_bias = vec![W::from_f64(-5.); bias_len];
        let bias = conf.with_bias.then_some(diff_bias.as_mut_slice());
        bwd.execute(&src, &diff_dst, &mut diff_weights, bias)?;
        assert_eq!(to_f64(&diff_weights), dw_ref, "grid {grid}");
        if conf.with_bias {
            assert_eq!(to_f64(&diff_bias), db_ref[..bias_len], "grid {grid}");
        }
        let calls = conf.mb * conf.ngroups * conf.nb_oc * conf.nb_ic;
        assert_eq!(bwd_calls(&bwd), calls, "grid {grid}");
    }
    Ok(())
}

fn bwd_calls<S, D, W, T>(bwd: &ConvolutionBwdWeights<S, D, W, CountingKernel, T>) -> usize
where
    S: WithDType,
    D: WithDType,
    W: WithDType,
    T: TransposeKernel<S> + TransposeKernel<D>,
{
    bwd.kernel().calls.load(Ordering::Relaxed)
}

fn bwd_weights_groups_impl<S: WithDType, D: WithDType, W: WithDType>() -> Result<()> {
    let desc = ConvDesc {
        groups: 2,
        mb: 5,
        ic: 32,
        oc: 32,
        ih: 6,
        iw: 7,
        kh: 3,
        kw: 3,
        padding: [0, 1, 1],
        with_bias: true,
        ..Default::default()
    };
    let conf = job::<S, W, D>(ConvKind::BackwardWeights, desc, ConvTuning::default())?;
    let grids = [
        ReductionGrid::SERIAL,
        ReductionGrid::new(4, 1, 1, 1),
        ReductionGrid::new(5, 1, 1, 1),
        ReductionGrid::new(2, 1, 2, 2),
        ReductionGrid::new(1, 2, 2, 1),
        ReductionGrid::new(3, 2, 1, 2),
        MemoryCostStrategy.grid(&conf, 6),
    ];
    check_bwd_weights::<S, D, W, _>(&conf, RefTranspose, &grids)
}
test_dtypes!(bwd_weights_groups, bwd_weights_groups_impl);

fn bwd_weights_3d_padded_bias_impl<S: WithDType, D: WithDType, W: WithDType>() -> Result<()> {
    let desc = ConvDesc {
        mb: 4,
        ic: 20,
        oc: 24,
        id: Some(3),
        ih: 4,
        iw: 5,
        kd: 2,
        kh: 2,
        kw: 3,
        stride: [1, 1, 2],
        padding: [1, 0, 1],
        with_bias: true,
        ..Default::default()
    };
    let conf = job::<S, W, D>(ConvKind::BackwardWeights, desc, ConvTuning::default())?;
    assert!(conf.want_padded_bias());
    let grids =
        [ReductionGrid::new(2, 1, 2, 1), ReductionGrid::new(4, 1, 1, 1), ReductionGrid::new(1, 1, 2, 2)];
    check_bwd_weights::<S, D, W, _>(&conf, RefTranspose, &grids)
}
test_dtypes!(bwd_weights_3d_padded_bias, bwd_weights_3d_padded_bias_impl);

#[test]
fn bwd_weights_transpose_barriers() -> Result<()> {
    let desc = ConvDesc { mb: 3, ic: 48, oc: 48, ih: 5, iw: 4, kh: 2, kw: 2, ..Default::default() };
    let conf = JobConfig::new(ConvKind::BackwardWeights, &desc, ConvTuning::default())?;
    // Three threads share each transposed source, two each transposed diff_dst.
    let grids = [ReductionGrid::new(1, 1, 3, 2), ReductionGrid::new(3, 1, 3, 1)];
    check_bwd_weights::<f32, f32, f32, _>(&conf, SlowTranspose, &grids)
}

#[test]
fn bwd_weights_default_strategy() -> Result<()> {
    let desc = ConvDesc {
        mb: 6,
        ic: 16,
        oc: 40,
        ih: 4,
        iw: 4,
        kh: 3,
        kw: 3,
        padding: [0, 1, 1],
        with_bias: true,
        ..Default::default()
    };
    let conf = JobConfig::new(ConvKind::BackwardWeights, &desc, ConvTuning::default())?;
    let bwd = ConvolutionBwdWeights::<f32, f32, f32, _>::new(
        conf.clone(),
        RefBwdWeightsKernel,
        RefTranspose,
        8,
        &MemoryCostStrategy,
    )?;
    assert!(bwd.nthr() <= 8);
    assert_eq!(bwd.nthr(), bwd.grid().nthr());
    let balancer = bwd.bias_balancer().expect("configured with bias");
    assert_eq!(balancer.nthr, bwd.nthr());
    assert_eq!(balancer.njobs, 3);
    assert!(bwd.padded_bias().is_some_and(|p| p.oc() == 48));

    let grids = [bwd.grid()];
    check_bwd_weights::<f32, f32, f32, _>(&conf, RefTranspose, &grids)
}

#[test]
fn bwd_weights_rejects_missing_bias() -> Result<()> {
    let desc = ConvDesc { with_bias: true, ..Default::default() };
    let conf = JobConfig::new(ConvKind::BackwardWeights, &desc, ConvTuning::default())?;
    let mut bwd = ConvolutionBwdWeights::<f32, f32, f32, _>::new(
        conf,
        RefBwdWeightsKernel,
        RefTranspose,
        2,
        &MemoryCostStrategy,
    )?;
    let mut dw = vec![0f32; 256];
    assert!(bwd.execute(&[0.; 16], &[0.; 16], &mut dw, None).is_err());
    let mut db = vec![0f32; 15];
    assert!(bwd.execute(&[0.; 16], &[0.; 16], &mut dw, Some(&mut db)).is_err());
    Ok(())
}

/// Panics on the first worker, leaving its transposition peer waiting on the barrier.
#[derive(Debug, Clone, Copy)]
struct FaultyTranspose;

impl<T: WithDType> TransposeKernel<T> for FaultyTranspose {
    fn transpose(&self, src: &[T], dst: &mut [T], rows: usize, width: usize) {
        if std::thread::current().name() == Some("xn-conv-0") {
            panic!("transpose fault")
        }
        RefTranspose.transpose(src, dst, rows, width)
    }
}

const FAULT_CHILD_ENV: &str = "XN_CONV_FAULT_CHILD";

// Re-runs itself in a child process, the child is expected to abort rather than hang.
#[cfg(unix)]
#[test]
fn kernel_fault_aborts_the_job() {
    use std::os::unix::process::ExitStatusExt;

    if std::env::var_os(FAULT_CHILD_ENV).is_some() {
        let desc = ConvDesc { oc: 32, ih: 2, iw: 2, ..Default::default() };
        let conf = JobConfig::new(ConvKind::BackwardWeights, &desc, ConvTuning::default())
            .expect("valid config");
        let grid = FixedGrid(ReductionGrid::new(1, 1, 2, 1));
        let mut bwd = ConvolutionBwdWeights::<f32, f32, f32, _, _>::new(
            conf.clone(),
            RefBwdWeightsKernel,
            FaultyTranspose,
            2,
            &grid,
        )
        .expect("valid grid");
        let src = vec![1f32; BlockedData::src(&conf).elem_count()];
        let diff_dst = vec![1f32; BlockedData::dst(&conf).elem_count()];
        let mut dw = vec![0f32; BlockedWeights::new(&conf).elem_count()];
        let _ = bwd.execute(&src, &diff_dst, &mut dw, None);
        return;
    }

    let exe = std::env::current_exe().expect("test binary path");
    let status = std::process::Command::new(exe)
        .args(["kernel_fault_aborts_the_job", "--exact", "--test-threads=1"])
        .env(FAULT_CHILD_ENV, "1")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .expect("spawning the child test");
    assert!(!status.success());
    // SIGABRT
    assert_eq!(status.signal(), Some(6), "{status:?}");
}
