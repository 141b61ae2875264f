//! Child networks instantiated from a net code over the shared weights.

use std::collections::HashMap;

use nao_data::Batch;
use nao_types::{
    internal_error, ArchError, LayerSpec, NaoResult, NetCode, Postprocessor, Preprocessor,
    SearchSpace, Side, EOS_ID, UNK_ID,
};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::criterion::{Criterion, LoggingOutput};
use crate::shared::{LayerKey, LayerParams, ModelGrads, SharedHandle, SharedWeights};

/// A sequence-to-sequence model reading the shared weights.
pub trait TranslationModel: Send + Sync {
    fn describe(&self) -> String;

    fn shared(&self) -> &SharedHandle;

    fn num_parameters(&self) -> usize;

    /// Decoder states for every position of `prev_output`, shape `(T, hidden)`.
    ///
    /// Dropout is active only when `rng` is given.
    fn decoder_states(
        &self,
        weights: &SharedWeights,
        src: &[u32],
        prev_output: &[u32],
        rng: Option<&mut ChaCha8Rng>,
    ) -> NaoResult<Array2<f64>>;

    /// Decoder states plus the trace of the top decoder layer, when the
    /// model has architecture-specific layers to train.
    fn decoder_forward(
        &self,
        weights: &SharedWeights,
        src: &[u32],
        prev_output: &[u32],
        rng: Option<&mut ChaCha8Rng>,
    ) -> NaoResult<DecoderForward> {
        Ok(DecoderForward {
            states: self.decoder_states(weights, src, prev_output, rng)?,
            top_layer: None,
        })
    }
}

pub struct DecoderForward {
    pub states: Array2<f64>,
    pub top_layer: Option<LayerTrace>,
}

/// Forward values of one decoder layer kept for its backward pass.
#[derive(Debug, Clone)]
pub struct LayerTrace {
    key: LayerKey,
    spec: LayerSpec,
    /// Layer input after preprocessing.
    input: Array2<f64>,
    /// Layer output before postprocessing.
    output: Array2<f64>,
    /// Dropout multiplier applied by the postprocessor.
    post_mask: Option<Array2<f64>>,
    attention: Option<AttentionForward>,
}

impl LayerTrace {
    pub fn key(&self) -> LayerKey {
        self.key
    }
}

/// The shared weights without any architecture-specific layers.
pub struct SharedModel {
    shared: SharedHandle,
}

impl SharedModel {
    pub fn new(shared: SharedHandle) -> Self {
        Self { shared }
    }
}

impl TranslationModel for SharedModel {
    fn describe(&self) -> String {
        "shared".to_string()
    }

    fn shared(&self) -> &SharedHandle {
        &self.shared
    }

    fn num_parameters(&self) -> usize {
        self.shared.read().num_global_parameters()
    }

    fn decoder_states(
        &self,
        weights: &SharedWeights,
        src: &[u32],
        prev_output: &[u32],
        _rng: Option<&mut ChaCha8Rng>,
    ) -> NaoResult<Array2<f64>> {
        let encoded = embed(&weights.src_embed, src);
        decoder_input(weights, &encoded, prev_output)
    }
}

/// Network built from one net code. Holds no weights of its own.
pub struct ChildNet {
    code: NetCode,
    encoder: Vec<LayerSpec>,
    decoder: Vec<LayerSpec>,
    shared: SharedHandle,
    dropout: f64,
}

impl ChildNet {
    /// Validate `code` against the search space and the shared layer bank.
    pub fn new(code: NetCode, space: &SearchSpace, shared: SharedHandle, dropout: f64) -> NaoResult<Self> {
        let (num_enc, num_dec) = {
            let weights = shared.read();
            (weights.num_layers(Side::Encoder), weights.num_layers(Side::Decoder))
        };
        if code.encoder().len() != num_enc || code.decoder().len() != num_dec {
            return Err(ArchError::LayerCountMismatch {
                expected_enc: num_enc,
                expected_dec: num_dec,
                actual_enc: code.encoder().len(),
                actual_dec: code.decoder().len(),
            }
            .into());
        }
        let describe = |side: Side| -> NaoResult<Vec<LayerSpec>> {
            code.layers(side)
                .iter()
                .enumerate()
                .map(|(i, layer)| space.describe_layer(side, i, layer))
                .collect()
        };
        let encoder = describe(Side::Encoder)?;
        let decoder = describe(Side::Decoder)?;
        Ok(Self {
            code,
            encoder,
            decoder,
            shared,
            dropout,
        })
    }

    pub fn net_code(&self) -> &NetCode {
        &self.code
    }

    pub fn layer_specs(&self, side: Side) -> &[LayerSpec] {
        match side {
            Side::Encoder => &self.encoder,
            Side::Decoder => &self.decoder,
        }
    }

    /// Encoder output, shape `(S', hidden)`; strided convolutions shorten it.
    pub fn encode(&self, weights: &SharedWeights, src: &[u32], rng: Option<&mut ChaCha8Rng>) -> NaoResult<Array2<f64>> {
        let x = embed(&weights.src_embed, src);
        Ok(run_stack(weights, Side::Encoder, &self.encoder, x, self.dropout, rng, false)?.0)
    }
}

impl TranslationModel for ChildNet {
    fn describe(&self) -> String {
        self.code.to_string()
    }

    fn shared(&self) -> &SharedHandle {
        &self.shared
    }

    fn num_parameters(&self) -> usize {
        let weights = self.shared.read();
        let d = weights.hidden_size();
        let layers: usize = self
            .encoder
            .iter()
            .chain(&self.decoder)
            .map(|spec| match spec {
                LayerSpec::Lstm { .. } => 2 * d * d + d,
                LayerSpec::Conv { kernel_size, .. } => kernel_size * d * d + d,
                LayerSpec::Attention { ffn_hidden, .. } => 4 * d * d + 2 * d * ffn_hidden,
            })
            .sum();
        weights.num_global_parameters() + layers
    }

    fn decoder_states(
        &self,
        weights: &SharedWeights,
        src: &[u32],
        prev_output: &[u32],
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> NaoResult<Array2<f64>> {
        let encoded = self.encode(weights, src, rng.as_deref_mut())?;
        let x = decoder_input(weights, &encoded, prev_output)?;
        Ok(run_stack(weights, Side::Decoder, &self.decoder, x, self.dropout, rng, false)?.0)
    }

    fn decoder_forward(
        &self,
        weights: &SharedWeights,
        src: &[u32],
        prev_output: &[u32],
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> NaoResult<DecoderForward> {
        let encoded = self.encode(weights, src, rng.as_deref_mut())?;
        let x = decoder_input(weights, &encoded, prev_output)?;
        let (states, top_layer) = run_stack(weights, Side::Decoder, &self.decoder, x, self.dropout, rng, true)?;
        Ok(DecoderForward { states, top_layer })
    }
}

/// Output logits for decoder states.
pub fn readout(weights: &SharedWeights, states: &Array2<f64>) -> Array2<f64> {
    states.dot(&weights.out_proj) + &weights.out_bias
}

/// Shifted decoder input: EOS followed by the target without its last token.
pub fn shift_target(target: &[u32]) -> Vec<u32> {
    std::iter::once(EOS_ID)
        .chain(target.iter().copied().take(target.len().saturating_sub(1)))
        .collect()
}

/// Loss statistics and gradients of one batch.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub logging: LoggingOutput,
    /// Normalized by the batch sample size.
    pub grads: ModelGrads,
}

/// Forward pass over the gold target with gradients for the readout and
/// the bank slot of the top decoder layer.
///
/// `train_seed` enables dropout; each sentence gets its own generator so the
/// result does not depend on scheduling.
pub fn forward_backward(
    model: &dyn TranslationModel,
    batch: &Batch,
    criterion: &dyn Criterion,
    train_seed: Option<u64>,
) -> NaoResult<BatchOutput> {
    let guard = model.shared().read();
    let weights: &SharedWeights = &guard;

    let per_sentence = batch
        .src_tokens
        .par_iter()
        .zip(batch.trg_tokens.par_iter())
        .enumerate()
        .map(|(i, (src, trg))| {
            let mut rng = train_seed.map(|seed| ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64)));
            let forward = model.decoder_forward(weights, src, &shift_target(trg), rng.as_mut())?;
            let logits = readout(weights, &forward.states);
            let out = criterion.forward(logits.view(), trg, true);
            let grad_logits = out
                .grad_logits
                .ok_or_else(|| internal_error!("criterion {} returned no gradient", criterion.name()))?;
            let mut grads = ModelGrads {
                out_proj: forward.states.t().dot(&grad_logits),
                out_bias: grad_logits.sum_axis(Axis(0)),
                layers: HashMap::new(),
            };
            if let Some(trace) = &forward.top_layer {
                let grad_states = grad_logits.dot(&weights.out_proj.t());
                grads.layers.insert(trace.key(), layer_grads(weights, trace, &grad_states)?);
            }
            Ok((out.logging, grads))
        })
        .collect::<NaoResult<Vec<_>>>()?;

    let mut logging = LoggingOutput::default();
    let mut grads = ModelGrads::zeros(weights.hidden_size(), weights.out_bias.len());
    for (sentence_logging, sentence_grads) in &per_sentence {
        logging.merge(sentence_logging);
        grads.accumulate(sentence_grads);
    }
    if logging.sample_size > 0 {
        grads.scale(1.0 / logging.sample_size as f64);
    }
    Ok(BatchOutput { logging, grads })
}

/// Loss over the gold target without gradients.
pub fn batch_loss(model: &dyn TranslationModel, batch: &Batch, criterion: &dyn Criterion) -> NaoResult<LoggingOutput> {
    let guard = model.shared().read();
    let weights: &SharedWeights = &guard;

    let outputs = batch
        .src_tokens
        .par_iter()
        .zip(batch.trg_tokens.par_iter())
        .map(|(src, trg)| {
            let states = model.decoder_states(weights, src, &shift_target(trg), None)?;
            Ok(criterion.forward(readout(weights, &states).view(), trg, false).logging)
        })
        .collect::<NaoResult<Vec<_>>>()?;

    let mut logging = LoggingOutput::default();
    for output in &outputs {
        logging.merge(output);
    }
    Ok(logging)
}

fn embed(table: &Array2<f64>, tokens: &[u32]) -> Array2<f64> {
    let d = table.ncols();
    let mut x = Array2::zeros((tokens.len(), d));
    for (t, &token) in tokens.iter().enumerate() {
        let row = if (token as usize) < table.nrows() { token as usize } else { UNK_ID as usize };
        x.row_mut(t).assign(&table.row(row));
    }
    add_positions(&mut x);
    x
}

/// Sinusoidal position signal.
fn add_positions(x: &mut Array2<f64>) {
    let d = x.ncols();
    for ((t, i), value) in x.indexed_iter_mut() {
        let rate = 1.0 / 10_000f64.powf((2 * (i / 2)) as f64 / d as f64);
        let angle = t as f64 * rate;
        *value += if i % 2 == 0 { angle.sin() } else { angle.cos() };
    }
}

fn decoder_input(weights: &SharedWeights, encoded: &Array2<f64>, prev_output: &[u32]) -> NaoResult<Array2<f64>> {
    let context = encoded
        .mean_axis(Axis(0))
        .ok_or_else(|| internal_error!("empty encoder output"))?;
    let mut x = embed(&weights.trg_embed, prev_output);
    x += &context;
    Ok(x)
}

fn run_stack(
    weights: &SharedWeights,
    side: Side,
    specs: &[LayerSpec],
    mut x: Array2<f64>,
    dropout: f64,
    mut rng: Option<&mut ChaCha8Rng>,
    trace_top: bool,
) -> NaoResult<(Array2<f64>, Option<LayerTrace>)> {
    let causal = side == Side::Decoder;
    let d = weights.hidden_size();
    let mut top = None;
    for (index, spec) in specs.iter().enumerate() {
        let key = LayerKey {
            side,
            index,
            kind: spec.kind(),
        };
        let keep = trace_top && index + 1 == specs.len();
        let mut attention_forward = None;
        let residual = x.clone();
        let h = preprocess(x, spec.pre(), dropout, rng.as_deref_mut());
        let out = match (spec, weights.layer(key)?) {
            (
                LayerSpec::Lstm {
                    hidden_size,
                    bidirectional,
                    reversed,
                    ..
                },
                LayerParams::Recurrent { w_in, w_rec, bias },
            ) => {
                let width = (*hidden_size).min(d);
                let run = |backwards| recurrent(&h, w_in, w_rec, bias, width, backwards);
                if causal {
                    run(false)
                } else if *bidirectional {
                    (run(false) + run(true)) * 0.5
                } else {
                    run(*reversed)
                }
            }
            (
                LayerSpec::Conv {
                    out_channels,
                    kernel_size,
                    stride,
                    ..
                },
                LayerParams::Conv { taps, bias },
            ) => {
                let stride = if causal { 1 } else { *stride };
                convolution(&h, taps, bias, *kernel_size, stride, (*out_channels).min(d), causal)
            }
            (
                LayerSpec::Attention {
                    num_heads,
                    ffn_hidden,
                    attention_dropout,
                    ..
                },
                params,
            ) => {
                let forward = attention(&h, params, *num_heads, *ffn_hidden, *attention_dropout, causal, rng.as_deref_mut())?;
                let output = forward.output.clone();
                if keep {
                    attention_forward = Some(forward);
                }
                output
            }
            (spec, _) => {
                return Err(internal_error!(
                    "{} layer {} resolved to mismatched {} weights",
                    side,
                    index,
                    spec.kind()
                ))
            }
        };
        let traced_output = keep.then(|| out.clone());
        let (next, post_mask) = postprocess(out, residual, spec.post(), dropout, rng.as_deref_mut());
        if let Some(output) = traced_output {
            top = Some(LayerTrace {
                key,
                spec: spec.clone(),
                input: h,
                output,
                post_mask,
                attention: attention_forward,
            });
        }
        x = next;
    }
    Ok((x, top))
}

fn preprocess(x: Array2<f64>, pre: Preprocessor, p: f64, rng: Option<&mut ChaCha8Rng>) -> Array2<f64> {
    match pre {
        Preprocessor::None => x,
        Preprocessor::Dropout => apply_dropout(x, p, rng),
        Preprocessor::Norm => layer_norm(x),
        Preprocessor::DropoutNorm => layer_norm(apply_dropout(x, p, rng)),
    }
}

fn postprocess(
    h: Array2<f64>,
    residual: Array2<f64>,
    post: Postprocessor,
    p: f64,
    rng: Option<&mut ChaCha8Rng>,
) -> (Array2<f64>, Option<Array2<f64>>) {
    let add_residual = |h: Array2<f64>| {
        // Strided layers change the length; skip the shortcut then.
        if h.dim() == residual.dim() {
            h + &residual
        } else {
            h
        }
    };
    match post {
        Postprocessor::None => (h, None),
        Postprocessor::Dropout => masked_dropout(h, p, rng),
        Postprocessor::Residual => (add_residual(h), None),
        Postprocessor::DropoutResidual => {
            let (h, mask) = masked_dropout(h, p, rng);
            (add_residual(h), mask)
        }
    }
}

fn apply_dropout(x: Array2<f64>, p: f64, rng: Option<&mut ChaCha8Rng>) -> Array2<f64> {
    masked_dropout(x, p, rng).0
}

/// Inverted dropout; also returns the multiplier it applied.
fn masked_dropout(x: Array2<f64>, p: f64, rng: Option<&mut ChaCha8Rng>) -> (Array2<f64>, Option<Array2<f64>>) {
    let Some(rng) = rng else { return (x, None) };
    if p <= 0.0 {
        return (x, None);
    }
    let keep = 1.0 - p;
    let mask = Array2::from_shape_fn(x.raw_dim(), |_| if rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 });
    (x * &mask, Some(mask))
}

fn layer_norm(mut x: Array2<f64>) -> Array2<f64> {
    for mut row in x.rows_mut() {
        let n = row.len().max(1) as f64;
        let mean = row.sum() / n;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let inv = 1.0 / (var + 1e-5).sqrt();
        row.mapv_inplace(|v| (v - mean) * inv);
    }
    x
}

fn recurrent(
    x: &Array2<f64>,
    w_in: &Array2<f64>,
    w_rec: &Array2<f64>,
    bias: &Array1<f64>,
    width: usize,
    backwards: bool,
) -> Array2<f64> {
    let (len, d) = x.dim();
    let projected = x.dot(w_in) + bias;
    let mut out = Array2::zeros((len, d));
    let mut state = Array1::<f64>::zeros(d);
    let order: Vec<usize> = if backwards { (0..len).rev().collect() } else { (0..len).collect() };
    for t in order {
        let mut next = &projected.row(t) + &state.dot(w_rec);
        next.mapv_inplace(f64::tanh);
        next.slice_mut(s![width..]).fill(0.0);
        out.row_mut(t).assign(&next);
        state = next;
    }
    out
}

fn convolution(
    x: &Array2<f64>,
    taps: &[Array2<f64>],
    bias: &Array1<f64>,
    kernel: usize,
    stride: usize,
    width: usize,
    causal: bool,
) -> Array2<f64> {
    let (len, d) = x.dim();
    let kernel = kernel.clamp(1, taps.len().max(1));
    let mut out = Array2::zeros((len, d));
    for t in 0..len {
        let mut acc = bias.clone();
        for (k, tap) in taps.iter().take(kernel).enumerate() {
            let offset = if causal {
                k as isize - (kernel as isize - 1)
            } else {
                k as isize - (kernel / 2) as isize
            };
            let source = t as isize + offset;
            if source < 0 || source >= len as isize {
                continue;
            }
            acc += &x.row(source as usize).dot(tap);
        }
        acc.mapv_inplace(f64::tanh);
        acc.slice_mut(s![width..]).fill(0.0);
        out.row_mut(t).assign(&acc);
    }
    if stride > 1 {
        let step = stride as isize;
        out.slice(s![..;step, ..]).to_owned()
    } else {
        out
    }
}

fn effective_heads(requested: usize, d: usize) -> usize {
    (1..=requested.min(d).max(1)).rev().find(|h| d % h == 0).unwrap_or(1)
}

fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

fn attention(
    x: &Array2<f64>,
    params: &LayerParams,
    num_heads: usize,
    ffn_hidden: usize,
    attention_dropout: f64,
    causal: bool,
    mut rng: Option<&mut ChaCha8Rng>,
) -> NaoResult<AttentionForward> {
    let LayerParams::Attention {
        w_q,
        w_k,
        w_v,
        w_o,
        ffn_in,
        ffn_out,
    } = params
    else {
        return Err(internal_error!("attention layer given non-attention weights"));
    };
    let (len, d) = x.dim();
    let heads = effective_heads(num_heads, d);
    let head_dim = d / heads;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let q = x.dot(w_q);
    let k = x.dot(w_k);
    let v = x.dot(w_v);
    let mut context = Array2::zeros((len, d));
    for head in 0..heads {
        let (lo, hi) = (head * head_dim, (head + 1) * head_dim);
        let qh: ArrayView2<f64> = q.slice(s![.., lo..hi]);
        let kh: ArrayView2<f64> = k.slice(s![.., lo..hi]);
        let mut scores = qh.dot(&kh.t()) * scale;
        if causal {
            for i in 0..len {
                for j in (i + 1)..len {
                    scores[[i, j]] = f64::NEG_INFINITY;
                }
            }
        }
        softmax_rows(&mut scores);
        let probs = apply_dropout(scores, attention_dropout, rng.as_deref_mut());
        context
            .slice_mut(s![.., lo..hi])
            .assign(&probs.dot(&v.slice(s![.., lo..hi])));
    }
    let attended = context.dot(w_o);

    let ffn = ffn_hidden.clamp(1, ffn_in.ncols());
    let hidden = attended.dot(&ffn_in.slice(s![.., ..ffn])).mapv(|h| h.max(0.0));
    let output = &attended + &hidden.dot(&ffn_out.slice(s![..ffn, ..]));
    Ok(AttentionForward {
        context,
        attended,
        hidden,
        ffn,
        output,
    })
}

#[derive(Debug, Clone)]
struct AttentionForward {
    /// Head outputs before `w_o`.
    context: Array2<f64>,
    attended: Array2<f64>,
    /// Feed-forward activations after the ReLU.
    hidden: Array2<f64>,
    ffn: usize,
    output: Array2<f64>,
}

/// Gradient before a `tanh` whose output columns from `width` on are zeroed.
fn tanh_grad(output: &Array2<f64>, grad_out: &Array2<f64>, width: usize) -> Array2<f64> {
    let mut grad = grad_out * &output.mapv(|y| 1.0 - y * y);
    grad.slice_mut(s![.., width..]).fill(0.0);
    grad
}

/// Gradients of a traced decoder layer's bank slot, given the loss gradient
/// with respect to that layer's postprocessed output.
///
/// Recurrent layers truncate back-propagation through time to one step.
/// Attention layers train `w_o` and the feed-forward block; the query, key
/// and value projections get zero gradients.
pub fn layer_grads(weights: &SharedWeights, trace: &LayerTrace, grad_states: &Array2<f64>) -> NaoResult<LayerParams> {
    if grad_states.dim() != trace.output.dim() {
        return Err(internal_error!(
            "gradient of shape {:?} for {} layer {} output of shape {:?}",
            grad_states.dim(),
            trace.key.side,
            trace.key.index,
            trace.output.dim()
        ));
    }
    let params = weights.layer(trace.key)?;
    let grad_out = match &trace.post_mask {
        Some(mask) => grad_states * mask,
        None => grad_states.clone(),
    };
    let (len, d) = trace.output.dim();
    let mut grads = params.zeros_like();

    match (&trace.spec, &mut grads) {
        (LayerSpec::Lstm { hidden_size, .. }, LayerParams::Recurrent { w_in, w_rec, bias }) => {
            let grad_pre = tanh_grad(&trace.output, &grad_out, (*hidden_size).min(d));
            let mut prev_state = Array2::zeros((len, d));
            if len > 1 {
                prev_state
                    .slice_mut(s![1.., ..])
                    .assign(&trace.output.slice(s![..len - 1, ..]));
            }
            *w_in = trace.input.t().dot(&grad_pre);
            *w_rec = prev_state.t().dot(&grad_pre);
            *bias = grad_pre.sum_axis(Axis(0));
        }
        (
            LayerSpec::Conv {
                out_channels,
                kernel_size,
                ..
            },
            LayerParams::Conv { taps, bias },
        ) => {
            let grad_pre = tanh_grad(&trace.output, &grad_out, (*out_channels).min(d));
            let kernel = (*kernel_size).clamp(1, taps.len().max(1));
            for (k, tap) in taps.iter_mut().take(kernel).enumerate() {
                // Causal tap k reads `kernel - 1 - k` positions back.
                let lag = kernel - 1 - k;
                if lag >= len {
                    continue;
                }
                *tap = trace
                    .input
                    .slice(s![..len - lag, ..])
                    .t()
                    .dot(&grad_pre.slice(s![lag.., ..]));
            }
            *bias = grad_pre.sum_axis(Axis(0));
        }
        (LayerSpec::Attention { .. }, LayerParams::Attention { w_o, ffn_in, ffn_out, .. }) => {
            let forward = trace
                .attention
                .as_ref()
                .ok_or_else(|| internal_error!("attention layer traced without its activations"))?;
            let LayerParams::Attention {
                ffn_in: weight_in,
                ffn_out: weight_out,
                ..
            } = params
            else {
                return Err(internal_error!("attention layer given non-attention weights"));
            };
            let ffn = forward.ffn;
            let mut grad_hidden = grad_out.dot(&weight_out.slice(s![..ffn, ..]).t());
            grad_hidden.zip_mut_with(&forward.hidden, |g, &h| {
                if h <= 0.0 {
                    *g = 0.0;
                }
            });
            let grad_attended = &grad_out + &grad_hidden.dot(&weight_in.slice(s![.., ..ffn]).t());
            ffn_out
                .slice_mut(s![..ffn, ..])
                .assign(&forward.hidden.t().dot(&grad_out));
            ffn_in
                .slice_mut(s![.., ..ffn])
                .assign(&forward.attended.t().dot(&grad_hidden));
            *w_o = forward.context.t().dot(&grad_attended);
        }
        (spec, _) => {
            return Err(internal_error!(
                "{} layer {} traced as {} but its slot holds other weights",
                trace.key.side,
                trace.key.index,
                spec.kind()
            ))
        }
    }
    Ok(grads)
}
