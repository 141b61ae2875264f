//! The weight store shared by every child network of a search run.
//!
//! Embeddings and the output readout are global. Layer weights live in a bank
//! keyed by (side, layer position, layer kind), so two architectures that put
//! the same kind of layer at the same position train the same parameters.

use std::collections::HashMap;
use std::sync::Arc;

use nao_types::{internal_error, LayerKind, NaoResult, SearchSpace, Side};
use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD};
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::optim::Optimizer;

/// Handle to the shared weights, cloned into every child network.
pub type SharedHandle = Arc<RwLock<SharedWeights>>;

/// Sizes the shared store is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub src_vocab: usize,
    pub trg_vocab: usize,
    pub hidden_size: usize,
    pub num_enc_layers: usize,
    pub num_dec_layers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerKey {
    pub side: Side,
    pub index: usize,
    pub kind: LayerKind,
}

impl LayerKey {
    /// Optimizer state key of one tensor in this slot.
    pub fn param_name(&self, tensor: &str) -> String {
        format!("{}.{}.{}.{}", self.side, self.index, self.kind, tensor)
    }
}

/// Weights of one bank slot. Gradients of a slot use the same shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerParams {
    Recurrent {
        w_in: Array2<f64>,
        w_rec: Array2<f64>,
        bias: Array1<f64>,
    },
    Conv {
        /// One matrix per kernel tap, as many as the widest kernel.
        taps: Vec<Array2<f64>>,
        bias: Array1<f64>,
    },
    Attention {
        w_q: Array2<f64>,
        w_k: Array2<f64>,
        w_v: Array2<f64>,
        w_o: Array2<f64>,
        /// Sized for the widest feed-forward choice; narrower layers use a slice.
        ffn_in: Array2<f64>,
        ffn_out: Array2<f64>,
    },
}

impl LayerParams {
    pub fn num_elements(&self) -> usize {
        match self {
            LayerParams::Recurrent { w_in, w_rec, bias } => w_in.len() + w_rec.len() + bias.len(),
            LayerParams::Conv { taps, bias } => taps.iter().map(Array2::len).sum::<usize>() + bias.len(),
            LayerParams::Attention {
                w_q,
                w_k,
                w_v,
                w_o,
                ffn_in,
                ffn_out,
            } => w_q.len() + w_k.len() + w_v.len() + w_o.len() + ffn_in.len() + ffn_out.len(),
        }
    }

    /// Named tensors of the slot, in a fixed order per kind.
    pub fn tensors(&self) -> Vec<(String, ArrayViewD<'_, f64>)> {
        match self {
            LayerParams::Recurrent { w_in, w_rec, bias } => vec![
                ("w_in".to_string(), w_in.view().into_dyn()),
                ("w_rec".to_string(), w_rec.view().into_dyn()),
                ("bias".to_string(), bias.view().into_dyn()),
            ],
            LayerParams::Conv { taps, bias } => taps
                .iter()
                .enumerate()
                .map(|(k, tap)| (format!("tap{}", k), tap.view().into_dyn()))
                .chain(std::iter::once(("bias".to_string(), bias.view().into_dyn())))
                .collect(),
            LayerParams::Attention {
                w_q,
                w_k,
                w_v,
                w_o,
                ffn_in,
                ffn_out,
            } => vec![
                ("w_q".to_string(), w_q.view().into_dyn()),
                ("w_k".to_string(), w_k.view().into_dyn()),
                ("w_v".to_string(), w_v.view().into_dyn()),
                ("w_o".to_string(), w_o.view().into_dyn()),
                ("ffn_in".to_string(), ffn_in.view().into_dyn()),
                ("ffn_out".to_string(), ffn_out.view().into_dyn()),
            ],
        }
    }

    pub fn tensors_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f64>)> {
        match self {
            LayerParams::Recurrent { w_in, w_rec, bias } => vec![
                ("w_in".to_string(), w_in.view_mut().into_dyn()),
                ("w_rec".to_string(), w_rec.view_mut().into_dyn()),
                ("bias".to_string(), bias.view_mut().into_dyn()),
            ],
            LayerParams::Conv { taps, bias } => taps
                .iter_mut()
                .enumerate()
                .map(|(k, tap)| (format!("tap{}", k), tap.view_mut().into_dyn()))
                .chain(std::iter::once(("bias".to_string(), bias.view_mut().into_dyn())))
                .collect(),
            LayerParams::Attention {
                w_q,
                w_k,
                w_v,
                w_o,
                ffn_in,
                ffn_out,
            } => vec![
                ("w_q".to_string(), w_q.view_mut().into_dyn()),
                ("w_k".to_string(), w_k.view_mut().into_dyn()),
                ("w_v".to_string(), w_v.view_mut().into_dyn()),
                ("w_o".to_string(), w_o.view_mut().into_dyn()),
                ("ffn_in".to_string(), ffn_in.view_mut().into_dyn()),
                ("ffn_out".to_string(), ffn_out.view_mut().into_dyn()),
            ],
        }
    }

    /// Same shapes, all zero.
    pub fn zeros_like(&self) -> Self {
        let mut zeros = self.clone();
        for (_, mut tensor) in zeros.tensors_mut() {
            tensor.fill(0.0);
        }
        zeros
    }

    fn add_assign(&mut self, other: &LayerParams) {
        for ((name, mut acc), (other_name, grad)) in self.tensors_mut().into_iter().zip(other.tensors()) {
            if name == other_name && acc.shape() == grad.shape() {
                acc += &grad;
            }
        }
    }

    fn scale(&mut self, factor: f64) {
        for (_, mut tensor) in self.tensors_mut() {
            tensor.mapv_inplace(|v| v * factor);
        }
    }

    fn sum_squares(&self) -> f64 {
        self.tensors()
            .iter()
            .map(|(_, tensor)| tensor.iter().map(|g| g * g).sum::<f64>())
            .sum()
    }
}

/// Gradients of one update: the output readout plus the bank slots a child
/// back-propagates into.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGrads {
    pub out_proj: Array2<f64>,
    pub out_bias: Array1<f64>,
    pub layers: HashMap<LayerKey, LayerParams>,
}

impl ModelGrads {
    pub fn zeros(hidden_size: usize, trg_vocab: usize) -> Self {
        Self {
            out_proj: Array2::zeros((hidden_size, trg_vocab)),
            out_bias: Array1::zeros(trg_vocab),
            layers: HashMap::new(),
        }
    }

    pub fn accumulate(&mut self, other: &ModelGrads) {
        self.out_proj += &other.out_proj;
        self.out_bias += &other.out_bias;
        for (key, grads) in &other.layers {
            match self.layers.get_mut(key) {
                Some(acc) => acc.add_assign(grads),
                None => {
                    self.layers.insert(*key, grads.clone());
                }
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.out_proj *= factor;
        self.out_bias *= factor;
        for grads in self.layers.values_mut() {
            grads.scale(factor);
        }
    }

    pub fn norm(&self) -> f64 {
        let readout: f64 = self.out_proj.iter().chain(self.out_bias.iter()).map(|g| g * g).sum();
        let layers: f64 = self.layers.values().map(LayerParams::sum_squares).sum();
        (readout + layers).sqrt()
    }

    /// Rescale so the global norm is at most `max_norm`; returns the norm before clipping.
    pub fn clip_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.norm();
        if max_norm > 0.0 && norm > max_norm {
            self.scale(max_norm / (norm + 1e-6));
        }
        norm
    }
}

/// Global parameters persisted across search steps.
#[derive(Debug, Clone)]
pub struct SharedWeights {
    dims: ModelDims,
    pub src_embed: Array2<f64>,
    pub trg_embed: Array2<f64>,
    pub out_proj: Array2<f64>,
    pub out_bias: Array1<f64>,
    layers: HashMap<LayerKey, LayerParams>,
    num_updates: u64,
}

fn init_matrix<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize) -> Array2<f64> {
    let bound = 1.0 / (rows.max(1) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}

impl SharedWeights {
    pub fn new<R: Rng + ?Sized>(dims: ModelDims, space: &SearchSpace, rng: &mut R) -> Self {
        let d = dims.hidden_size;
        let max_kernel = space.conv.kernel_sizes.iter().copied().max().unwrap_or(1);
        let max_ffn = space.attention.ffn_hidden.iter().copied().max().unwrap_or(d);

        let mut layers = HashMap::new();
        for (side, count) in [(Side::Encoder, dims.num_enc_layers), (Side::Decoder, dims.num_dec_layers)] {
            for index in 0..count {
                for kind in LayerKind::ALL {
                    let params = match kind {
                        LayerKind::Lstm => LayerParams::Recurrent {
                            w_in: init_matrix(rng, d, d),
                            w_rec: init_matrix(rng, d, d),
                            bias: Array1::zeros(d),
                        },
                        LayerKind::Convolutional => LayerParams::Conv {
                            taps: (0..max_kernel).map(|_| init_matrix(rng, d, d)).collect(),
                            bias: Array1::zeros(d),
                        },
                        LayerKind::Attention => LayerParams::Attention {
                            w_q: init_matrix(rng, d, d),
                            w_k: init_matrix(rng, d, d),
                            w_v: init_matrix(rng, d, d),
                            w_o: init_matrix(rng, d, d),
                            ffn_in: init_matrix(rng, d, max_ffn),
                            ffn_out: init_matrix(rng, max_ffn, d),
                        },
                    };
                    layers.insert(LayerKey { side, index, kind }, params);
                }
            }
        }

        let weights = Self {
            dims,
            src_embed: init_matrix(rng, dims.src_vocab, d),
            trg_embed: init_matrix(rng, dims.trg_vocab, d),
            out_proj: init_matrix(rng, d, dims.trg_vocab),
            out_bias: Array1::zeros(dims.trg_vocab),
            layers,
            num_updates: 0,
        };
        debug!(
            "Built shared weights: {} layer slots, {} parameters",
            weights.layers.len(),
            weights.num_parameters()
        );
        weights
    }

    pub fn into_handle(self) -> SharedHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn dims(&self) -> ModelDims {
        self.dims
    }

    pub fn hidden_size(&self) -> usize {
        self.dims.hidden_size
    }

    pub fn num_layers(&self, side: Side) -> usize {
        match side {
            Side::Encoder => self.dims.num_enc_layers,
            Side::Decoder => self.dims.num_dec_layers,
        }
    }

    pub fn layer(&self, key: LayerKey) -> NaoResult<&LayerParams> {
        self.layers
            .get(&key)
            .ok_or_else(|| internal_error!("no shared {} weights for {} layer {}", key.kind, key.side, key.index))
    }

    /// Embedding and readout parameters, present in every child.
    pub fn num_global_parameters(&self) -> usize {
        self.src_embed.len() + self.trg_embed.len() + self.out_proj.len() + self.out_bias.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.num_global_parameters() + self.layers.values().map(LayerParams::num_elements).sum::<usize>()
    }

    /// Updates applied so far.
    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// Apply one optimizer step to the readout and every bank slot in `grads`.
    pub fn apply_grads(&mut self, grads: &ModelGrads, optimizer: &mut dyn Optimizer) -> NaoResult<()> {
        for key in grads.layers.keys() {
            self.layer(*key)?;
        }
        optimizer.begin_step();
        optimizer.update("out_proj", self.out_proj.view_mut().into_dyn(), grads.out_proj.view().into_dyn());
        optimizer.update("out_bias", self.out_bias.view_mut().into_dyn(), grads.out_bias.view().into_dyn());
        for (key, layer_grads) in &grads.layers {
            let Some(params) = self.layers.get_mut(key) else { continue };
            for ((name, param), (_, grad)) in params.tensors_mut().into_iter().zip(layer_grads.tensors()) {
                optimizer.update(&key.param_name(&name), param, grad);
            }
        }
        self.num_updates += 1;
        Ok(())
    }
}
