//! Portable scalar kernels for the blocked layouts, accumulating in f64.
use crate::kernel::{
    BwdDataArgs, BwdDataCall, BwdDataKernel, BwdWeightsKernel, FwdArgs, FwdCall, FwdKernel,
    TransposeKernel,
};
use crate::layout::{BlockedData, BlockedWeights};
use crate::{JobConfig, SIMD_W, WithDType};

// Input coordinate read by output coordinate `o` through filter tap `k`, `None` when it falls in
// the padding.
#[inline(always)]
fn input_coord(o: usize, k: usize, stride: usize, pad: usize, dilate: usize, size: usize) -> Option<usize> {
    let i = (o * stride + k * (dilate + 1)).checked_sub(pad)?;
    (i < size).then_some(i)
}

// Output coordinate reading input coordinate `i` through filter tap `k`, the inverse of
// `input_coord` when it exists.
#[inline(always)]
fn output_coord(i: usize, k: usize, stride: usize, pad: usize, dilate: usize, size: usize) -> Option<usize> {
    let n = (i + pad).checked_sub(k * (dilate + 1))?;
    if !n.is_multiple_of(stride) {
        return None;
    }
    let o = n / stride;
    (o < size).then_some(o)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefFwdKernel;

impl<S: WithDType, W: WithDType, D: WithDType> FwdKernel<S, W, D> for RefFwdKernel {
    fn name(&self) -> String {
        "ref-fwd".to_string()
    }

    #[tracing::instrument(skip_all)]
    fn forward(&self, conf: &JobConfig, args: &FwdArgs<'_, S, W, D>, call: &FwdCall) {
        let src_l = BlockedData::src(conf);
        let dst_l = BlockedData::dst(conf);
        let wei_l = BlockedWeights::new(conf);
        let slope = conf.kind.relu_slope().map(|s| s as f64);
        let g = call.g;
        let mut acc = vec![0f64; conf.ow * SIMD_W];
        for n in call.mb.clone() {
            for ocb in call.ocb.clone() {
                acc.fill(0.);
                for kd in 0..conf.kd {
                    let Some(id) =
                        input_coord(call.od, kd, conf.stride_d, conf.f_pad, conf.dilate_d, conf.id)
                    else {
                        continue;
                    };
                    for kh in 0..conf.kh {
                        let Some(ih) = input_coord(
                            call.oh,
                            kh,
                            conf.stride_h,
                            conf.t_pad,
                            conf.dilate_h,
                            conf.ih,
                        ) else {
                            continue;
                        };
                        for icb in 0..conf.nb_ic {
                            let src_row = src_l.row_offset(n, g * conf.nb_ic + icb, id, ih);
                            for ow in 0..conf.ow {
                                for kw in 0..conf.kw {
                                    let Some(iw) = input_coord(
                                        ow,
                                        kw,
                                        conf.stride_w,
                                        conf.l_pad,
                                        conf.dilate_w,
                                        conf.iw,
                                    ) else {
                                        continue;
                                    };
                                    let s = &args.src[src_row + iw * SIMD_W..][..SIMD_W];
                                    for o in 0..SIMD_W {
                                        let oc = ocb * SIMD_W + o;
                                        let mut v = 0f64;
                                        for (i, s) in s.iter().enumerate() {
                                            let w = wei_l.offset(g, oc, icb * SIMD_W + i, kd, kh, kw);
                                            v += s.to_f64() * args.weights[w].to_f64();
                                        }
                                        acc[ow * SIMD_W + o] += v;
                                    }
                                }
                            }
                        }
                    }
                }
                let cb = g * conf.nb_oc + ocb;
                let row = dst_l.row_offset(n, cb, call.od, call.oh);
                // SAFETY: the orchestrator hands this row to a single call.
                let dst = unsafe { args.dst.slice_mut(row..row + conf.ow * SIMD_W) };
                for (idx, (d, a)) in dst.iter_mut().zip(acc.iter()).enumerate() {
                    let mut v = *a;
                    if let Some(bias) = args.bias {
                        v += bias[g * conf.oc + ocb * SIMD_W + idx % SIMD_W].to_f64();
                    }
                    if let Some(slope) = slope
                        && v < 0.
                    {
                        v *= slope
                    }
                    *d = D::from_f64(v);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefBwdDataKernel;

impl<D: WithDType, W: WithDType, S: WithDType> BwdDataKernel<D, W, S> for RefBwdDataKernel {
    fn name(&self) -> String {
        "ref-bwd-data".to_string()
    }

    #[tracing::instrument(skip_all)]
    fn backward_data(&self, conf: &JobConfig, args: &BwdDataArgs<'_, D, W, S>, call: &BwdDataCall) {
        let src_l = BlockedData::src(conf);
        let dst_l = BlockedData::dst(conf);
        let wei_l = BlockedWeights::new(conf);
        let g = call.g;
        let mut acc = vec![0f64; conf.iw * SIMD_W];
        for n in call.mb.clone() {
            for icb in call.icb.clone() {
                acc.fill(0.);
                for kd in 0..conf.kd {
                    let Some(od) =
                        output_coord(call.id, kd, conf.stride_d, conf.f_pad, conf.dilate_d, conf.od)
                    else {
                        continue;
                    };
                    for kh in 0..conf.kh {
                        let Some(oh) = output_coord(
                            call.ih,
                            kh,
                            conf.stride_h,
                            conf.t_pad,
                            conf.dilate_h,
                            conf.oh,
                        ) else {
                            continue;
                        };
                        for ocb in 0..conf.nb_oc {
                            let dd_row = dst_l.row_offset(n, g * conf.nb_oc + ocb, od, oh);
                            for iw in 0..conf.iw {
                                for kw in 0..conf.kw {
                                    let Some(ow) = output_coord(
                                        iw,
                                        kw,
                                        conf.stride_w,
                                        conf.l_pad,
                                        conf.dilate_w,
                                        conf.ow,
                                    ) else {
                                        continue;
                                    };
                                    let dd = &args.diff_dst[dd_row + ow * SIMD_W..][..SIMD_W];
                                    for i in 0..SIMD_W {
                                        let ic = icb * SIMD_W + i;
                                        let mut v = 0f64;
                                        for (o, d) in dd.iter().enumerate() {
                                            let w = wei_l.offset(g, ocb * SIMD_W + o, ic, kd, kh, kw);
                                            v += d.to_f64() * args.weights[w].to_f64();
                                        }
                                        acc[iw * SIMD_W + i] += v;
                                    }
                                }
                            }
                        }
                    }
                }
                let row = src_l.row_offset(n, g * conf.nb_ic + icb, call.id, call.ih);
                // SAFETY: the orchestrator hands this row to a single call.
                let diff_src = unsafe { args.diff_src.slice_mut(row..row + conf.iw * SIMD_W) };
                for (d, a) in diff_src.iter_mut().zip(acc.iter()) {
                    *d = S::from_f64(*a);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefBwdWeightsKernel;

impl<S: WithDType, D: WithDType, W: WithDType> BwdWeightsKernel<S, D, W> for RefBwdWeightsKernel {
    fn name(&self) -> String {
        "ref-bwd-weights".to_string()
    }

    fn backward_weights(
        &self,
        conf: &JobConfig,
        tr_src: &[S],
        tr_diff_dst: &[D],
        diff_weights: &mut [W],
    ) {
        let src_row_len = SIMD_W * conf.iw;
        let dd_row_len = SIMD_W * conf.ow;
        for od in 0..conf.od {
            for kd in 0..conf.kd {
                let Some(id) = input_coord(od, kd, conf.stride_d, conf.f_pad, conf.dilate_d, conf.id)
                else {
                    continue;
                };
                for oh in 0..conf.oh {
                    let dd_row = &tr_diff_dst[(od * conf.oh + oh) * dd_row_len..][..dd_row_len];
                    for kh in 0..conf.kh {
                        let Some(ih) =
                            input_coord(oh, kh, conf.stride_h, conf.t_pad, conf.dilate_h, conf.ih)
                        else {
                            continue;
                        };
                        let src_row = &tr_src[(id * conf.ih + ih) * src_row_len..][..src_row_len];
                        for kw in 0..conf.kw {
                            let blk = ((kd * conf.kh + kh) * conf.kw + kw) * SIMD_W * SIMD_W;
                            let blk = &mut diff_weights[blk..blk + SIMD_W * SIMD_W];
                            for o in 0..SIMD_W {
                                let dd = &dd_row[o * conf.ow..(o + 1) * conf.ow];
                                for i in 0..SIMD_W {
                                    let s = &src_row[i * conf.iw..(i + 1) * conf.iw];
                                    let mut v = 0f64;
                                    for (ow, d) in dd.iter().enumerate() {
                                        let Some(iw) = input_coord(
                                            ow,
                                            kw,
                                            conf.stride_w,
                                            conf.l_pad,
                                            conf.dilate_w,
                                            conf.iw,
                                        ) else {
                                            continue;
                                        };
                                        v += d.to_f64() * s[iw].to_f64();
                                    }
                                    let w = &mut blk[o * SIMD_W + i];
                                    *w = W::from_f64(w.to_f64() + v);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefTranspose;

impl<T: WithDType> TransposeKernel<T> for RefTranspose {
    fn transpose(&self, src: &[T], dst: &mut [T], rows: usize, width: usize) {
        let row_len = width * SIMD_W;
        for (s, d) in src.chunks_exact(row_len).zip(dst.chunks_exact_mut(row_len)).take(rows) {
            for w in 0..width {
                for c in 0..SIMD_W {
                    d[c * width + w] = s[w * SIMD_W + c];
                }
            }
        }
    }
}
