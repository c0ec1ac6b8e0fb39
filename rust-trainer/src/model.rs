use candle_core::{DType, Device, Error, Module, Result, Tensor};
use candle_nn::{init, ops, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelCnnConfig {
    pub hidden_dim: usize,
    pub n_res: usize,
    pub n_downsampling: usize,
    pub dropout_rate: f64,
    pub n_mix: usize,
    pub channels: usize,
    /// Size of the one-hot class context, if the model is conditional.
    pub num_classes: Option<usize>,
}

impl PixelCnnConfig {
    /// Mixture logits, then per channel means and log-scales, then the
    /// channel-mixing coefficients.
    pub fn output_channels(&self) -> usize {
        self.n_mix * (1 + 2 * self.channels + self.coeff_count())
    }

    fn coeff_count(&self) -> usize {
        self.channels * self.channels.saturating_sub(1) / 2
    }
}

#[derive(Debug)]
struct Conv {
    weight: Tensor,
    bias: Tensor,
    stride: usize,
}

impl Conv {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = kernel;
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kh, kw),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1.0 / ((in_channels * kh * kw) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight,
            bias,
            stride,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.conv2d(&self.weight, 0, self.stride, 1, 1)?;
        y.broadcast_add(&self.bias.reshape((1, (), 1, 1))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shift {
    /// Sees rows above and the current row, centered horizontally.
    Down,
    /// Sees rows above and columns to the left.
    DownRight,
}

#[derive(Debug)]
struct ShiftedConv {
    conv: Conv,
    shift: Shift,
    kernel: (usize, usize),
}

impl ShiftedConv {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: usize,
        shift: Shift,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = Conv::new(in_channels, out_channels, kernel, stride, vb)?;
        Ok(Self {
            conv,
            shift,
            kernel,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (kh, kw) = self.kernel;
        let x = match self.shift {
            Shift::Down => x.pad_with_zeros(3, (kw - 1) / 2, (kw - 1) / 2)?,
            Shift::DownRight => x.pad_with_zeros(3, kw - 1, 0)?,
        };
        let x = x.pad_with_zeros(2, kh - 1, 0)?;
        self.conv.forward(&x)
    }
}

/// Stride-2 transposed counterpart of [`ShiftedConv`]; doubles height and width.
#[derive(Debug)]
struct ShiftedDeconv {
    weight: Tensor,
    bias: Tensor,
    shift: Shift,
    kernel: (usize, usize),
}

impl ShiftedDeconv {
    fn new(
        channels: usize,
        kernel: (usize, usize),
        shift: Shift,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = kernel;
        let weight = vb.get_with_hints(
            (channels, channels, kh, kw),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1.0 / ((channels * kh * kw) as f64).sqrt();
        let bias = vb.get_with_hints(
            channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight,
            bias,
            shift,
            kernel,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let y = x
            .conv_transpose2d(&self.weight, 0, 0, 2, 1)?
            .broadcast_add(&self.bias.reshape((1, (), 1, 1))?)?;
        let col_offset = match self.shift {
            Shift::Down => (self.kernel.1 - 1) / 2,
            Shift::DownRight => 0,
        };
        y.narrow(2, 0, 2 * h)?.narrow(3, col_offset, 2 * w)
    }
}

fn down_shift(x: &Tensor) -> Result<Tensor> {
    let h = x.dim(2)?;
    x.narrow(2, 0, h - 1)?.pad_with_zeros(2, 1, 0)
}

fn right_shift(x: &Tensor) -> Result<Tensor> {
    let w = x.dim(3)?;
    x.narrow(3, 0, w - 1)?.pad_with_zeros(3, 1, 0)
}

fn concat_elu(x: &Tensor) -> Result<Tensor> {
    Tensor::cat(&[x, &x.neg()?], 1)?.elu(1.0)
}

/// Stable softplus: max(x, 0) + log(1 + exp(-abs(x))).
fn softplus(x: &Tensor) -> Result<Tensor> {
    let max_part = x.maximum(0f32)?;
    let log_part = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    max_part.broadcast_add(&log_part)
}

fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let summed = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (summed + max)?.squeeze(dim)
}

#[derive(Debug)]
struct GatedResnet {
    conv_input: ShiftedConv,
    nin_skip: Option<Conv>,
    conv_out: ShiftedConv,
    context: Option<Linear>,
    dropout_rate: f64,
    hidden_dim: usize,
}

impl GatedResnet {
    fn new(
        cfg: &PixelCnnConfig,
        shift: Shift,
        skip_inputs: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let c = cfg.hidden_dim;
        let kernel = match shift {
            Shift::Down => (2, 3),
            Shift::DownRight => (2, 2),
        };
        let conv_input = ShiftedConv::new(2 * c, c, kernel, 1, shift, vb.pp("conv_input"))?;
        let nin_skip = if skip_inputs > 0 {
            Some(Conv::new(2 * skip_inputs * c, c, (1, 1), 1, vb.pp("nin_skip"))?)
        } else {
            None
        };
        let conv_out = ShiftedConv::new(2 * c, 2 * c, kernel, 1, shift, vb.pp("conv_out"))?;
        let context = match cfg.num_classes {
            Some(classes) => Some(candle_nn::linear(classes, 2 * c, vb.pp("context"))?),
            None => None,
        };
        Ok(Self {
            conv_input,
            nin_skip,
            conv_out,
            context,
            dropout_rate: cfg.dropout_rate,
            hidden_dim: c,
        })
    }

    fn forward_t(
        &self,
        og_x: &Tensor,
        a: Option<&Tensor>,
        h: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut x = self.conv_input.forward(&concat_elu(og_x)?)?;
        if let (Some(nin), Some(a)) = (&self.nin_skip, a) {
            x = (x + nin.forward(&concat_elu(a)?)?)?;
        }
        let mut x = concat_elu(&x)?;
        if train && self.dropout_rate > 0.0 {
            x = ops::dropout(&x, self.dropout_rate as f32)?;
        }
        let mut x = self.conv_out.forward(&x)?;
        if let (Some(linear), Some(h)) = (&self.context, h) {
            let batch = h.dim(0)?;
            let projected = linear.forward(h)?.reshape((batch, 2 * self.hidden_dim, 1, 1))?;
            x = x.broadcast_add(&projected)?;
        }
        let gate = x.chunk(2, 1)?;
        let gated = (&gate[0] * ops::sigmoid(&gate[1])?)?;
        og_x + gated
    }
}

#[derive(Debug)]
struct StreamBlock {
    u: GatedResnet,
    ul: GatedResnet,
}

#[derive(Debug)]
struct Resample<T> {
    u: T,
    ul: T,
}

/// PixelCNN++ with `n_downsampling + 1` resolutions and two causal streams.
#[derive(Debug)]
pub struct PixelCnnPlus {
    cfg: PixelCnnConfig,
    u_init: ShiftedConv,
    ul_init_down: ShiftedConv,
    ul_init_right: ShiftedConv,
    up: Vec<Vec<StreamBlock>>,
    down: Vec<Vec<StreamBlock>>,
    downsize: Vec<Resample<ShiftedConv>>,
    upsize: Vec<Resample<ShiftedDeconv>>,
    nin_out: Conv,
}

impl PixelCnnPlus {
    pub fn new(cfg: &PixelCnnConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.hidden_dim == 0 || cfg.n_res == 0 || cfg.n_mix == 0 || cfg.channels == 0 {
            candle_core::bail!("PixelCNN++ dimensions must be non-zero: {cfg:?}");
        }
        let c = cfg.hidden_dim;
        let in_c = cfg.channels + 1;
        let levels = cfg.n_downsampling + 1;

        let u_init = ShiftedConv::new(in_c, c, (2, 3), 1, Shift::Down, vb.pp("u_init"))?;
        let ul_init_down =
            ShiftedConv::new(in_c, c, (1, 3), 1, Shift::Down, vb.pp("ul_init_down"))?;
        let ul_init_right =
            ShiftedConv::new(in_c, c, (2, 1), 1, Shift::DownRight, vb.pp("ul_init_right"))?;

        let mut up = Vec::with_capacity(levels);
        let mut down = Vec::with_capacity(levels);
        for level in 0..levels {
            let vb_up = vb.pp(format!("up{level}"));
            let mut blocks = Vec::with_capacity(cfg.n_res);
            for index in 0..cfg.n_res {
                let vb_block = vb_up.pp(index);
                blocks.push(StreamBlock {
                    u: GatedResnet::new(cfg, Shift::Down, 0, vb_block.pp("u"))?,
                    ul: GatedResnet::new(cfg, Shift::DownRight, 1, vb_block.pp("ul"))?,
                });
            }
            up.push(blocks);

            // The coarsest down stage has no downsized activation to consume.
            let depth = if level == 0 { cfg.n_res } else { cfg.n_res + 1 };
            let vb_down = vb.pp(format!("down{level}"));
            let mut blocks = Vec::with_capacity(depth);
            for index in 0..depth {
                let vb_block = vb_down.pp(index);
                blocks.push(StreamBlock {
                    u: GatedResnet::new(cfg, Shift::Down, 1, vb_block.pp("u"))?,
                    ul: GatedResnet::new(cfg, Shift::DownRight, 2, vb_block.pp("ul"))?,
                });
            }
            down.push(blocks);
        }

        let mut downsize = Vec::with_capacity(cfg.n_downsampling);
        let mut upsize = Vec::with_capacity(cfg.n_downsampling);
        for index in 0..cfg.n_downsampling {
            let vb_d = vb.pp(format!("downsize{index}"));
            downsize.push(Resample {
                u: ShiftedConv::new(c, c, (2, 3), 2, Shift::Down, vb_d.pp("u"))?,
                ul: ShiftedConv::new(c, c, (2, 2), 2, Shift::DownRight, vb_d.pp("ul"))?,
            });
            let vb_u = vb.pp(format!("upsize{index}"));
            upsize.push(Resample {
                u: ShiftedDeconv::new(c, (2, 3), Shift::Down, vb_u.pp("u"))?,
                ul: ShiftedDeconv::new(c, (2, 2), Shift::DownRight, vb_u.pp("ul"))?,
            });
        }

        let nin_out = Conv::new(c, cfg.output_channels(), (1, 1), 1, vb.pp("nin_out"))?;

        Ok(Self {
            cfg: cfg.clone(),
            u_init,
            ul_init_down,
            ul_init_right,
            up,
            down,
            downsize,
            upsize,
            nin_out,
        })
    }

    pub fn config(&self) -> &PixelCnnConfig {
        &self.cfg
    }

    /// Maps `[B, C, H, W]` images in `[-1, 1]` to mixture parameters
    /// `[B, output_channels, H, W]`. The output at a pixel only depends on
    /// pixels before it in raster order.
    pub fn forward_t(&self, x: &Tensor, context: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (b, _, h, w) = x.dims4()?;
        let ones = Tensor::ones((b, 1, h, w), x.dtype(), x.device())?;
        let x = Tensor::cat(&[x, &ones], 1)?;

        let mut u_list = vec![down_shift(&self.u_init.forward(&x)?)?];
        let mut ul_list = vec![(down_shift(&self.ul_init_down.forward(&x)?)?
            + right_shift(&self.ul_init_right.forward(&x)?)?)?];

        for (level, blocks) in self.up.iter().enumerate() {
            for block in blocks {
                let u = block.u.forward_t(last(&u_list)?, None, context, train)?;
                let ul = block.ul.forward_t(last(&ul_list)?, Some(&u), context, train)?;
                u_list.push(u);
                ul_list.push(ul);
            }
            if let Some(resample) = self.downsize.get(level) {
                let u = resample.u.forward(last(&u_list)?)?;
                let ul = resample.ul.forward(last(&ul_list)?)?;
                u_list.push(u);
                ul_list.push(ul);
            }
        }

        let mut u = pop(&mut u_list)?;
        let mut ul = pop(&mut ul_list)?;
        for (level, blocks) in self.down.iter().enumerate() {
            for block in blocks {
                let skip_u = pop(&mut u_list)?;
                u = block.u.forward_t(&u, Some(&skip_u), context, train)?;
                let skip_ul = Tensor::cat(&[&u, &pop(&mut ul_list)?], 1)?;
                ul = block.ul.forward_t(&ul, Some(&skip_ul), context, train)?;
            }
            if let Some(resample) = self.upsize.get(level) {
                u = resample.u.forward(&u)?;
                ul = resample.ul.forward(&ul)?;
            }
        }
        debug_assert!(u_list.is_empty() && ul_list.is_empty());

        self.nin_out.forward(&ul.elu(1.0)?)
    }

    /// Ancestral sampling, one pixel at a time.
    pub fn sample(
        &self,
        count: usize,
        height: usize,
        width: usize,
        context: Option<&Tensor>,
        device: &Device,
    ) -> Result<Tensor> {
        let c = self.cfg.channels;
        let mut x = Tensor::zeros((count, c, height, width), DType::F32, device)?;
        for row in 0..height {
            for col in 0..width {
                let params = self.forward_t(&x, context, false)?;
                let params = params.narrow(2, row, 1)?.narrow(3, col, 1)?;
                let pixel = sample_discretized_mix_logistic(&params, c, self.cfg.n_mix)?;
                x = x.slice_assign(&[0..count, 0..c, row..row + 1, col..col + 1], &pixel)?;
            }
        }
        Ok(x)
    }
}

fn last(list: &[Tensor]) -> Result<&Tensor> {
    list.last()
        .ok_or_else(|| Error::Msg("PixelCNN++ stream is empty".to_string()))
}

fn pop(list: &mut Vec<Tensor>) -> Result<Tensor> {
    list.pop()
        .ok_or_else(|| Error::Msg("PixelCNN++ skip connections exhausted".to_string()))
}

struct MixParams {
    logit_probs: Tensor,
    means: Tensor,
    log_scales: Tensor,
    coeffs: Option<Tensor>,
}

fn split_mix_params(l: &Tensor, channels: usize, n_mix: usize) -> Result<MixParams> {
    let (b, _, h, w) = l.dims4()?;
    let (c, m) = (channels, n_mix);
    let n_coeff = c * c.saturating_sub(1) / 2;
    let logit_probs = l.narrow(1, 0, m)?;
    let means = l.narrow(1, m, c * m)?.reshape((b, c, m, h, w))?;
    let log_scales = l
        .narrow(1, m + c * m, c * m)?
        .reshape((b, c, m, h, w))?
        .maximum(-7f32)?;
    let coeffs = if n_coeff > 0 {
        Some(
            l.narrow(1, m + 2 * c * m, n_coeff * m)?
                .reshape((b, n_coeff, m, h, w))?
                .tanh()?,
        )
    } else {
        None
    };
    Ok(MixParams {
        logit_probs,
        means,
        log_scales,
        coeffs,
    })
}

/// Mean negative log-likelihood (nats per sub-pixel) of images `x` in `[-1, 1]`
/// under the discretized logistic mixture `l`.
pub fn discretized_mix_logistic_loss(x: &Tensor, l: &Tensor, n_mix: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let params = split_mix_params(l, c, n_mix)?;
    let x5 = x.unsqueeze(2)?;

    let means = match &params.coeffs {
        Some(coeffs) => {
            let mut adjusted = Vec::with_capacity(c);
            let mut coeff_index = 0;
            for channel in 0..c {
                let mut mean = params.means.narrow(1, channel, 1)?;
                for previous in 0..channel {
                    let coeff = coeffs.narrow(1, coeff_index, 1)?;
                    coeff_index += 1;
                    mean = (mean + coeff.broadcast_mul(&x5.narrow(1, previous, 1)?)?)?;
                }
                adjusted.push(mean);
            }
            Tensor::cat(&adjusted, 1)?
        }
        None => params.means.clone(),
    };
    let log_scales = &params.log_scales;
    let x = x5.broadcast_as(means.shape())?;

    let centered = (&x - &means)?;
    let inv_stdv = log_scales.neg()?.exp()?;
    let plus_in = (&inv_stdv * (&centered + 1.0 / 255.0)?)?;
    let min_in = (&inv_stdv * (&centered - 1.0 / 255.0)?)?;
    let cdf_delta = (ops::sigmoid(&plus_in)? - ops::sigmoid(&min_in)?)?;

    // Edge bins at 0 and 255 integrate the tails.
    let log_cdf_plus = (&plus_in - softplus(&plus_in)?)?;
    let log_one_minus_cdf_min = softplus(&min_in)?.neg()?;

    let mid_in = (&inv_stdv * &centered)?;
    let log_pdf_mid = ((&mid_in - log_scales)? - (softplus(&mid_in)? * 2.0)?)?;

    let log_prob_mid = cdf_delta.gt(1e-5f32)?.where_cond(
        &cdf_delta.maximum(1e-12f32)?.log()?,
        &(log_pdf_mid - 127.5f64.ln())?,
    )?;
    let log_probs = x
        .gt(0.999f32)?
        .where_cond(&log_one_minus_cdf_min, &log_prob_mid)?;
    let log_probs = x.lt(-0.999f32)?.where_cond(&log_cdf_plus, &log_probs)?;

    let log_probs = (log_probs.sum(1)? + ops::log_softmax(&params.logit_probs, 1)?)?;
    let log_likelihood = log_sum_exp(&log_probs, 1)?.sum_all()?;
    log_likelihood.neg()? / (b * c * h * w) as f64
}

/// Draw one sample per pixel from mixture parameters `l`, clamped to `[-1, 1]`.
pub fn sample_discretized_mix_logistic(l: &Tensor, channels: usize, n_mix: usize) -> Result<Tensor> {
    let device = l.device();
    let params = split_mix_params(l, channels, n_mix)?;

    // Gumbel-max picks one mixture component per pixel.
    let u = Tensor::rand(1e-5f32, 1.0 - 1e-5, params.logit_probs.shape(), device)?;
    let gumbel = (&params.logit_probs - u.log()?.neg()?.log()?)?;
    let choice = gumbel.argmax_keepdim(1)?;
    let components = Tensor::arange(0u32, n_mix as u32, device)?.reshape((1, n_mix, 1, 1))?;
    let selected = components
        .broadcast_eq(&choice)?
        .to_dtype(DType::F32)?
        .unsqueeze(1)?;

    let pick = |t: &Tensor| -> Result<Tensor> { t.broadcast_mul(&selected)?.sum(2) };
    let means = pick(&params.means)?;
    let log_scales = pick(&params.log_scales)?;
    let coeffs = params.coeffs.as_ref().map(pick).transpose()?;

    let u = Tensor::rand(1e-5f32, 1.0 - 1e-5, means.shape(), device)?;
    let logistic = (u.log()? - u.affine(-1.0, 1.0)?.log()?)?;
    let raw = (means + (log_scales.exp()? * logistic)?)?;

    let mut sampled: Vec<Tensor> = Vec::with_capacity(channels);
    let mut coeff_index = 0;
    for channel in 0..channels {
        let mut value = raw.narrow(1, channel, 1)?;
        if let Some(coeffs) = &coeffs {
            for previous in sampled.iter() {
                let coeff = coeffs.narrow(1, coeff_index, 1)?;
                coeff_index += 1;
                value = (value + (coeff * previous)?)?;
            }
        }
        sampled.push(value.clamp(-1f32, 1f32)?);
    }
    Tensor::cat(&sampled, 1)
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;

    use super::*;

    fn tiny_config(channels: usize, num_classes: Option<usize>) -> PixelCnnConfig {
        PixelCnnConfig {
            hidden_dim: 4,
            n_res: 1,
            n_downsampling: 1,
            dropout_rate: 0.5,
            n_mix: 2,
            channels,
            num_classes,
        }
    }

    fn build(cfg: &PixelCnnConfig) -> (VarMap, PixelCnnPlus) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = PixelCnnPlus::new(cfg, vb).unwrap();
        (varmap, model)
    }

    fn random_images(b: usize, c: usize, h: usize, w: usize) -> Tensor {
        Tensor::rand(-1f32, 1f32, (b, c, h, w), &Device::Cpu).unwrap()
    }

    #[test]
    fn output_channel_count_follows_channels() {
        assert_eq!(tiny_config(1, None).output_channels(), 2 * 3);
        assert_eq!(tiny_config(3, None).output_channels(), 2 * 10);
    }

    #[test]
    fn forward_shape_for_grayscale_and_rgb() {
        for channels in [1, 3] {
            let cfg = tiny_config(channels, None);
            let (_varmap, model) = build(&cfg);
            let out = model
                .forward_t(&random_images(2, channels, 8, 8), None, true)
                .unwrap();
            assert_eq!(out.dims(), &[2, cfg.output_channels(), 8, 8]);
        }
    }

    /// Perturbs each listed pixel and checks that no output at or before it in
    /// raster order moves.
    fn assert_causal(cfg: &PixelCnnConfig, h: usize, w: usize, positions: &[(usize, usize)]) {
        let (_varmap, model) = build(cfg);
        let c = cfg.channels;
        let x = Tensor::rand(-0.5f32, 0.5f32, (1, c, h, w), &Device::Cpu).unwrap();
        let context = cfg.num_classes.map(|classes| {
            let mut row = vec![0f32; classes];
            row[classes - 1] = 1.0;
            Tensor::from_vec(row, (1, classes), &Device::Cpu).unwrap()
        });
        let before = model.forward_t(&x, context.as_ref(), false).unwrap();
        let patch = Tensor::full(0.9f32, (1, c, 1, 1), &Device::Cpu).unwrap();

        for &(row, col) in positions {
            let changed = x
                .slice_assign(&[0..1, 0..c, row..row + 1, col..col + 1], &patch)
                .unwrap();
            let after = model.forward_t(&changed, context.as_ref(), false).unwrap();
            let diff = (&before - after)
                .unwrap()
                .abs()
                .unwrap()
                .sum(1)
                .unwrap()
                .squeeze(0)
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();

            for (i, diff_row) in diff.iter().enumerate() {
                for (j, value) in diff_row.iter().enumerate() {
                    if i * w + j <= row * w + col {
                        assert!(
                            *value < 1e-5,
                            "{h}x{w}: pixel ({i}, {j}) saw ({row}, {col}): {value}"
                        );
                    }
                }
            }
            if row * w + col + 1 < h * w {
                let (ni, nj) = ((row * w + col + 1) / w, (row * w + col + 1) % w);
                let below = if row + 1 < h { diff[row + 1][col] } else { 0.0 };
                assert!(diff[ni][nj] > 0.0 || below > 0.0, "({row}, {col}) has no effect");
            }
        }
    }

    #[test]
    fn output_is_causal_in_raster_order() {
        assert_causal(&tiny_config(1, None), 8, 8, &[(0, 0), (3, 4), (5, 7)]);
    }

    #[test]
    fn mnist_resolution_is_causal() {
        let positions = [(0, 0), (0, 27), (6, 6), (13, 14), (20, 27), (27, 26)];
        for num_classes in [None, Some(10)] {
            let cfg = PixelCnnConfig {
                n_downsampling: 2,
                ..tiny_config(1, num_classes)
            };
            assert_causal(&cfg, 28, 28, &positions);
        }
    }

    #[test]
    fn cifar_resolution_is_causal() {
        let positions = [(0, 0), (0, 31), (7, 8), (16, 15), (31, 30)];
        for num_classes in [None, Some(10)] {
            let cfg = PixelCnnConfig {
                n_downsampling: 2,
                ..tiny_config(3, num_classes)
            };
            assert_causal(&cfg, 32, 32, &positions);
        }
    }

    #[test]
    fn conv_matches_direct_convolution() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = Conv::new(8, 8, (2, 3), 1, vb).unwrap();
        for side in [7, 8, 9] {
            let x = Tensor::rand(-1f32, 1f32, (1, 8, side, side), &Device::Cpu).unwrap();
            let got = conv.forward(&x).unwrap().squeeze(0).unwrap().to_vec3::<f32>().unwrap();

            let input = x.squeeze(0).unwrap().to_vec3::<f32>().unwrap();
            let weight = conv.weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let bias = conv.bias.to_vec1::<f32>().unwrap();
            let mut max_err = 0f32;
            for (o, plane) in got.iter().enumerate() {
                for (i, row) in plane.iter().enumerate() {
                    for (j, value) in row.iter().enumerate() {
                        let mut expected = bias[o];
                        for (ci, channel) in input.iter().enumerate() {
                            for ki in 0..2 {
                                for kj in 0..3 {
                                    let k = weight[((o * 8 + ci) * 2 + ki) * 3 + kj];
                                    expected += k * channel[i + ki][j + kj];
                                }
                            }
                        }
                        max_err = max_err.max((expected - value).abs());
                    }
                }
            }
            assert_eq!(got[0].len(), side - 1);
            assert!(max_err < 1e-4, "{side}x{side}: conv2d off by {max_err}");
        }
    }

    #[test]
    fn context_changes_output() {
        let cfg = tiny_config(1, Some(3));
        let (_varmap, model) = build(&cfg);
        let x = random_images(1, 1, 4, 4);
        let first = Tensor::new(&[[1f32, 0., 0.]], &Device::Cpu).unwrap();
        let second = Tensor::new(&[[0f32, 0., 1.]], &Device::Cpu).unwrap();
        let a = model.forward_t(&x, Some(&first), false).unwrap();
        let b = model.forward_t(&x, Some(&second), false).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn loss_is_finite_and_trainable() {
        let cfg = tiny_config(3, None);
        let (varmap, model) = build(&cfg);
        let x = random_images(2, 3, 4, 4);
        let out = model.forward_t(&x, None, true).unwrap();
        let loss = discretized_mix_logistic_loss(&x, &out, cfg.n_mix).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());

        let grads = loss.backward().unwrap();
        let vars = varmap.all_vars();
        assert!(vars.iter().any(|var| grads.get(var.as_tensor()).is_some()));
    }

    #[test]
    fn loss_rewards_matching_means() {
        // One component centered on the data with a small scale.
        let x = Tensor::new(&[[[[0.2f32]]]], &Device::Cpu).unwrap();
        let good = Tensor::new(&[[[[0f32]], [[0.2]], [[-4.0]]]], &Device::Cpu).unwrap();
        let bad = Tensor::new(&[[[[0f32]], [[-0.8]], [[-4.0]]]], &Device::Cpu).unwrap();
        let good = discretized_mix_logistic_loss(&x, &good, 1).unwrap();
        let bad = discretized_mix_logistic_loss(&x, &bad, 1).unwrap();
        assert!(good.to_scalar::<f32>().unwrap() < bad.to_scalar::<f32>().unwrap());
    }

    #[test]
    fn loss_handles_edge_pixels() {
        let x = Tensor::new(&[[[[-1f32, 1.0]]]], &Device::Cpu).unwrap();
        let l = Tensor::zeros((1, 3, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let loss = discretized_mix_logistic_loss(&x, &l, 1).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value > 0.0);
    }

    #[test]
    fn samples_stay_in_range() {
        let l = Tensor::rand(-3f32, 3f32, (4, 20, 2, 2), &Device::Cpu).unwrap();
        let sample = sample_discretized_mix_logistic(&l, 3, 2).unwrap();
        assert_eq!(sample.dims(), &[4, 3, 2, 2]);
        let min = sample.min_all().unwrap().to_scalar::<f32>().unwrap();
        let max = sample.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= -1.0 && max <= 1.0);
    }

    #[test]
    fn ancestral_sampling_fills_every_pixel() {
        let cfg = PixelCnnConfig {
            n_downsampling: 0,
            ..tiny_config(1, Some(2))
        };
        let (_varmap, model) = build(&cfg);
        let context = Tensor::new(&[[1f32, 0.], [0., 1.]], &Device::Cpu).unwrap();
        let samples = model.sample(2, 3, 3, Some(&context), &Device::Cpu).unwrap();
        assert_eq!(samples.dims(), &[2, 1, 3, 3]);
        let max = samples.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0);
    }
}
