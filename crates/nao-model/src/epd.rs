//! Encoder-predictor-decoder network over architecture token sequences.
//!
//! ```text
//! h      = tanh(mean_t(E[s_t] + P[t]) · W_e + b_e)
//! perf   = sigmoid(h · w_p + b_p)
//! z_t    = tanh(h · W_d + Q[t])
//! logits = z_t · U + c            (masked to the tokens valid at t)
//! ```
//!
//! Trained jointly on `trade_off · MSE(perf) + (1 − trade_off) · CE(reconstruction)`
//! with hand-derived gradients and plain SGD.

use nao_types::{ArchError, LayerKind, NaoResult, LAYER_CODE_LEN};
use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::seq::ArchSeqCodec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpdConfig {
    pub hidden_size: usize,
    /// Weight of the predictor loss; the reconstruction loss gets the rest.
    pub trade_off: f64,
    pub lr: f64,
}

impl Default for EpdConfig {
    fn default() -> Self {
        Self {
            hidden_size: 32,
            trade_off: 0.8,
            lr: 0.1,
        }
    }
}

/// Mean losses over one training batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpdLoss {
    pub mse: f64,
    pub cross_entropy: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
struct EpdParams {
    embed: Array2<f64>,
    pos: Array2<f64>,
    enc_w: Array2<f64>,
    enc_b: Array1<f64>,
    pred_w: Array1<f64>,
    pred_b: f64,
    dec_w: Array2<f64>,
    dec_pos: Array2<f64>,
    out_w: Array2<f64>,
    out_b: Array1<f64>,
}

impl EpdParams {
    fn zeros_like(other: &EpdParams) -> Self {
        Self {
            embed: Array2::zeros(other.embed.raw_dim()),
            pos: Array2::zeros(other.pos.raw_dim()),
            enc_w: Array2::zeros(other.enc_w.raw_dim()),
            enc_b: Array1::zeros(other.enc_b.raw_dim()),
            pred_w: Array1::zeros(other.pred_w.raw_dim()),
            pred_b: 0.0,
            dec_w: Array2::zeros(other.dec_w.raw_dim()),
            dec_pos: Array2::zeros(other.dec_pos.raw_dim()),
            out_w: Array2::zeros(other.out_w.raw_dim()),
            out_b: Array1::zeros(other.out_b.raw_dim()),
        }
    }

    /// `self -= lr * grads`
    fn descend(&mut self, grads: &EpdParams, lr: f64) {
        self.embed.scaled_add(-lr, &grads.embed);
        self.pos.scaled_add(-lr, &grads.pos);
        self.enc_w.scaled_add(-lr, &grads.enc_w);
        self.enc_b.scaled_add(-lr, &grads.enc_b);
        self.pred_w.scaled_add(-lr, &grads.pred_w);
        self.pred_b -= lr * grads.pred_b;
        self.dec_w.scaled_add(-lr, &grads.dec_w);
        self.dec_pos.scaled_add(-lr, &grads.dec_pos);
        self.out_w.scaled_add(-lr, &grads.out_w);
        self.out_b.scaled_add(-lr, &grads.out_b);
    }
}

fn init<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize, scale: f64) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-scale..scale))
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Softmax restricted to `range`; entries outside are zero.
fn masked_softmax(logits: &Array1<f64>, range: std::ops::Range<usize>) -> Array1<f64> {
    let mut probs = Array1::zeros(logits.len());
    let max = range.clone().map(|v| logits[v]).fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in range.clone() {
        probs[v] = (logits[v] - max).exp();
        sum += probs[v];
    }
    if sum > 0.0 {
        for v in range {
            probs[v] /= sum;
        }
    }
    probs
}

#[derive(Debug, Clone)]
pub struct Epd {
    codec: ArchSeqCodec,
    config: EpdConfig,
    params: EpdParams,
}

impl Epd {
    pub fn new<R: Rng + ?Sized>(codec: ArchSeqCodec, config: EpdConfig, rng: &mut R) -> Self {
        let vocab = codec.vocab_size();
        let len = codec.seq_len();
        let h = config.hidden_size;
        let scale = 1.0 / (h as f64).sqrt();
        let params = EpdParams {
            embed: init(rng, vocab, h, 0.5),
            pos: init(rng, len, h, 0.5),
            enc_w: init(rng, h, h, scale),
            enc_b: Array1::zeros(h),
            pred_w: Array1::from_shape_fn(h, |_| rng.gen_range(-scale..scale)),
            pred_b: 0.0,
            dec_w: init(rng, h, h, scale),
            dec_pos: init(rng, len, h, 0.5),
            out_w: init(rng, h, vocab, scale),
            out_b: Array1::zeros(vocab),
        };
        Self { codec, config, params }
    }

    pub fn codec(&self) -> &ArchSeqCodec {
        &self.codec
    }

    pub fn config(&self) -> &EpdConfig {
        &self.config
    }

    fn check_seq(&self, seq: &[usize]) -> NaoResult<()> {
        if seq.len() != self.codec.seq_len() {
            return Err(ArchError::BadSequence {
                message: format!("expected {} tokens, got {}", self.codec.seq_len(), seq.len()),
            }
            .into());
        }
        if let Some(&token) = seq.iter().find(|&&t| t >= self.codec.vocab_size()) {
            return Err(ArchError::BadSequence {
                message: format!("token {} outside vocabulary of {}", token, self.codec.vocab_size()),
            }
            .into());
        }
        Ok(())
    }

    /// Mean input embedding and encoder state.
    fn encode_parts(&self, seq: &[usize]) -> (Array1<f64>, Array1<f64>) {
        let p = &self.params;
        let mut mean = Array1::zeros(self.config.hidden_size);
        for (t, &token) in seq.iter().enumerate() {
            mean += &p.embed.row(token);
            mean += &p.pos.row(t);
        }
        mean /= seq.len().max(1) as f64;
        let hidden = (mean.dot(&p.enc_w) + &p.enc_b).mapv(f64::tanh);
        (mean, hidden)
    }

    pub fn encode(&self, seq: &[usize]) -> NaoResult<Array1<f64>> {
        self.check_seq(seq)?;
        Ok(self.encode_parts(seq).1)
    }

    pub fn predict_hidden(&self, hidden: &Array1<f64>) -> f64 {
        sigmoid(hidden.dot(&self.params.pred_w) + self.params.pred_b)
    }

    pub fn predict(&self, seq: &[usize]) -> NaoResult<f64> {
        Ok(self.predict_hidden(&self.encode(seq)?))
    }

    /// Gradient of the predicted performance with respect to the encoder state.
    pub fn predictor_gradient(&self, hidden: &Array1<f64>) -> Array1<f64> {
        let p = self.predict_hidden(hidden);
        &self.params.pred_w * (p * (1.0 - p))
    }

    fn decoder_step(&self, hidden: &Array1<f64>, position: usize) -> (Array1<f64>, Array1<f64>) {
        let p = &self.params;
        let z = (hidden.dot(&p.dec_w) + &p.dec_pos.row(position)).mapv(f64::tanh);
        let logits = z.dot(&p.out_w) + &p.out_b;
        (z, logits)
    }

    /// Greedy decoding restricted to valid tokens, so the result always parses.
    pub fn decode(&self, hidden: &Array1<f64>) -> Vec<usize> {
        let mut seq = Vec::with_capacity(self.codec.seq_len());
        let mut kind = None;
        for position in 0..self.codec.seq_len() {
            let slot = position % LAYER_CODE_LEN;
            let range = self.codec.valid_tokens(position, if slot == 0 { None } else { kind });
            let (_, logits) = self.decoder_step(hidden, position);
            let best = range
                .clone()
                .max_by(|&a, &b| logits[a].total_cmp(&logits[b]))
                .unwrap_or(range.start);
            if slot == 0 {
                kind = self
                    .codec
                    .token_to_value(position, best)
                    .and_then(LayerKind::from_code);
            }
            seq.push(best);
        }
        seq
    }

    /// Move the encoding of `seq` along the predictor gradient and decode.
    pub fn improve(&self, seq: &[usize], lambda: f64) -> NaoResult<Vec<usize>> {
        let hidden = self.encode(seq)?;
        let moved = &hidden + &(self.predictor_gradient(&hidden) * lambda);
        Ok(self.decode(&moved))
    }

    fn kind_at(&self, seq: &[usize], position: usize) -> Option<LayerKind> {
        let start = position - position % LAYER_CODE_LEN;
        self.codec
            .token_to_value(start, seq[start])
            .and_then(LayerKind::from_code)
    }

    /// One SGD step on a batch of `(sequence, target performance)` pairs.
    pub fn train_batch(&mut self, batch: &[(Vec<usize>, f64)]) -> NaoResult<EpdLoss> {
        if batch.is_empty() {
            return Ok(EpdLoss::default());
        }
        for (seq, _) in batch {
            self.check_seq(seq)?;
        }

        let trade_off = self.config.trade_off;
        let len = self.codec.seq_len() as f64;
        let mut grads = EpdParams::zeros_like(&self.params);
        let mut loss = EpdLoss::default();

        for (seq, target) in batch {
            let p = &self.params;
            let (mean, hidden) = self.encode_parts(seq);

            let perf = self.predict_hidden(&hidden);
            loss.mse += (perf - target).powi(2);
            let d_pre = trade_off * 2.0 * (perf - target) * perf * (1.0 - perf);
            grads.pred_w.scaled_add(d_pre, &hidden);
            grads.pred_b += d_pre;
            let mut d_hidden = &p.pred_w * d_pre;

            for (position, &token) in seq.iter().enumerate() {
                let kind = self.kind_at(seq, position);
                let slot = position % LAYER_CODE_LEN;
                let range = self.codec.valid_tokens(position, if slot == 0 { None } else { kind });
                let (z, logits) = self.decoder_step(&hidden, position);
                let mut d_logits = masked_softmax(&logits, range);
                loss.cross_entropy -= d_logits[token].max(1e-12).ln() / len;
                d_logits[token] -= 1.0;
                d_logits *= (1.0 - trade_off) / len;

                grads.out_w += &outer(&z, &d_logits);
                grads.out_b += &d_logits;
                let d_z = p.out_w.dot(&d_logits);
                let d_u = d_z * &z.mapv(|v| 1.0 - v * v);
                grads.dec_w += &outer(&hidden, &d_u);
                let mut pos_grad = grads.dec_pos.row_mut(position);
                pos_grad += &d_u;
                d_hidden += &p.dec_w.dot(&d_u);
            }

            let d_enc = d_hidden * &hidden.mapv(|v| 1.0 - v * v);
            grads.enc_w += &outer(&mean, &d_enc);
            grads.enc_b += &d_enc;
            let d_mean = p.enc_w.dot(&d_enc) / len;
            for (t, &token) in seq.iter().enumerate() {
                let mut row = grads.embed.row_mut(token);
                row += &d_mean;
                let mut row = grads.pos.row_mut(t);
                row += &d_mean;
            }
        }

        let n = batch.len() as f64;
        loss.mse /= n;
        loss.cross_entropy /= n;
        loss.total = trade_off * loss.mse + (1.0 - trade_off) * loss.cross_entropy;
        let lr = self.config.lr / n;
        self.params.descend(&grads, lr);
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::SearchSpace;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup(seed: u64) -> (Epd, ChaCha8Rng) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let codec = ArchSeqCodec::new(SearchSpace::normal(), 1, 1);
        let epd = Epd::new(
            codec,
            EpdConfig {
                hidden_size: 16,
                trade_off: 0.5,
                lr: 0.5,
            },
            &mut rng,
        );
        (epd, rng)
    }

    fn sample_seqs(epd: &Epd, rng: &mut ChaCha8Rng, n: usize) -> Vec<Vec<usize>> {
        (0..n)
            .map(|_| {
                let code = epd.codec().space().sample_net_code(rng, 1, 1);
                epd.codec().encode(&code).unwrap()
            })
            .collect()
    }

    #[test]
    fn prediction_is_a_probability() {
        let (epd, mut rng) = setup(1);
        for seq in sample_seqs(&epd, &mut rng, 5) {
            let p = epd.predict(&seq).unwrap();
            assert!(p > 0.0 && p < 1.0);
        }
    }

    #[test]
    fn decoded_sequences_always_parse() {
        let (epd, mut rng) = setup(2);
        for seq in sample_seqs(&epd, &mut rng, 5) {
            for lambda in [0.0, 1.0, 10.0] {
                let out = epd.improve(&seq, lambda).unwrap();
                assert!(epd.codec().decode(&out).is_ok());
            }
        }
    }

    #[test]
    fn training_reduces_loss() {
        let (mut epd, mut rng) = setup(3);
        let seqs = sample_seqs(&epd, &mut rng, 4);
        let batch: Vec<(Vec<usize>, f64)> = seqs.into_iter().zip([0.0, 0.3, 0.6, 1.0]).collect();

        let first = epd.train_batch(&batch).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = epd.train_batch(&batch).unwrap();
        }
        assert!(last.total < first.total);
        assert!(last.cross_entropy < first.cross_entropy);
    }

    #[test]
    fn learns_to_reconstruct() {
        let (mut epd, mut rng) = setup(4);
        let seq = sample_seqs(&epd, &mut rng, 1).remove(0);
        let batch = vec![(seq.clone(), 0.7)];
        for _ in 0..500 {
            epd.train_batch(&batch).unwrap();
        }
        let hidden = epd.encode(&seq).unwrap();
        assert_eq!(epd.decode(&hidden), seq);
    }

    #[test]
    fn predictor_gradient_points_uphill() {
        let (epd, mut rng) = setup(5);
        let seq = &sample_seqs(&epd, &mut rng, 1)[0];
        let hidden = epd.encode(seq).unwrap();
        let step = &hidden + &(epd.predictor_gradient(&hidden) * 0.1);
        assert!(epd.predict_hidden(&step) > epd.predict_hidden(&hidden));
    }

    #[test]
    fn rejects_malformed_sequences() {
        let (mut epd, _) = setup(6);
        assert!(epd.predict(&[1, 2, 3]).is_err());
        let too_big = vec![epd.codec().vocab_size(); epd.codec().seq_len()];
        assert!(epd.train_batch(&[(too_big, 0.5)]).is_err());
    }
}
