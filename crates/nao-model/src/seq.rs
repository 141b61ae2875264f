//! Flat integer sequences for net codes.
//!
//! Every slot of a layer code gets its own token range, so a token identifies
//! both the slot and the chosen index. Token 0 is the start-of-sequence
//! marker and never encodes a layer value.

use std::ops::Range;

use nao_types::{
    ArchError, LayerKind, NaoResult, NetCode, SearchSpace, Side, LAYER_CODE_LEN,
};

/// Start-of-sequence marker.
pub const SOS_TOKEN: usize = 0;

/// Bijection between net codes of a fixed depth and token sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchSeqCodec {
    space: SearchSpace,
    num_enc_layers: usize,
    num_dec_layers: usize,
    offsets: [usize; LAYER_CODE_LEN],
    widths: [usize; LAYER_CODE_LEN],
}

impl ArchSeqCodec {
    pub fn new(space: SearchSpace, num_enc_layers: usize, num_dec_layers: usize) -> Self {
        let widths = space.max_slot_sizes();
        let mut offsets = [0; LAYER_CODE_LEN];
        let mut next = SOS_TOKEN + 1;
        for slot in 0..LAYER_CODE_LEN {
            offsets[slot] = next;
            next += widths[slot];
        }
        Self {
            space,
            num_enc_layers,
            num_dec_layers,
            offsets,
            widths,
        }
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Token count, the start marker included.
    pub fn vocab_size(&self) -> usize {
        self.offsets[LAYER_CODE_LEN - 1] + self.widths[LAYER_CODE_LEN - 1]
    }

    pub fn seq_len(&self) -> usize {
        (self.num_enc_layers + self.num_dec_layers) * LAYER_CODE_LEN
    }

    /// Tokens allowed at `position`. Slots after the kind slot depend on the
    /// layer kind already chosen for that layer.
    pub fn valid_tokens(&self, position: usize, kind: Option<LayerKind>) -> Range<usize> {
        let slot = position % LAYER_CODE_LEN;
        let width = match (slot, kind) {
            (0, _) | (_, None) => self.widths[slot],
            (_, Some(kind)) => self.space.slot_sizes(kind)[slot - 1],
        };
        self.offsets[slot]..self.offsets[slot] + width
    }

    pub fn token_to_value(&self, position: usize, token: usize) -> Option<usize> {
        let slot = position % LAYER_CODE_LEN;
        let offset = self.offsets[slot];
        (token >= offset && token < offset + self.widths[slot]).then(|| token - offset)
    }

    fn check_depth(&self, num_enc: usize, num_dec: usize) -> NaoResult<()> {
        if num_enc != self.num_enc_layers || num_dec != self.num_dec_layers {
            return Err(ArchError::LayerCountMismatch {
                expected_enc: self.num_enc_layers,
                expected_dec: self.num_dec_layers,
                actual_enc: num_enc,
                actual_dec: num_dec,
            }
            .into());
        }
        Ok(())
    }

    /// Net code to tokens (no start marker).
    pub fn encode(&self, code: &NetCode) -> NaoResult<Vec<usize>> {
        self.check_depth(code.encoder().len(), code.decoder().len())?;
        self.space.check_correctness(code)?;
        let seq = code
            .encoder()
            .iter()
            .chain(code.decoder())
            .flat_map(|layer| layer.iter().enumerate().map(|(slot, &v)| self.offsets[slot] + v))
            .collect();
        Ok(seq)
    }

    /// Tokens back to a validated net code.
    pub fn decode(&self, seq: &[usize]) -> NaoResult<NetCode> {
        if seq.len() % LAYER_CODE_LEN != 0 {
            return Err(ArchError::BadSequence {
                message: format!("length {} is not a multiple of {}", seq.len(), LAYER_CODE_LEN),
            }
            .into());
        }
        let num_layers = seq.len() / LAYER_CODE_LEN;
        if num_layers < self.num_enc_layers {
            self.check_depth(num_layers, 0)?;
        }
        self.check_depth(self.num_enc_layers, num_layers - self.num_enc_layers)?;

        let mut layers = Vec::with_capacity(num_layers);
        for (layer, chunk) in seq.chunks(LAYER_CODE_LEN).enumerate() {
            let mut code = Vec::with_capacity(LAYER_CODE_LEN);
            for (slot, &token) in chunk.iter().enumerate() {
                let position = layer * LAYER_CODE_LEN + slot;
                let value = self.token_to_value(position, token).ok_or_else(|| ArchError::BadSequence {
                    message: format!("token {} is not valid at position {}", token, position),
                })?;
                code.push(value);
            }
            layers.push(code);
        }
        let decoder = layers.split_off(self.num_enc_layers);
        let code = NetCode::new(layers, decoder);
        self.space.check_correctness(&code)?;
        Ok(code)
    }

    /// Side and layer index of a sequence position.
    pub fn locate(&self, position: usize) -> (Side, usize) {
        let layer = position / LAYER_CODE_LEN;
        if layer < self.num_enc_layers {
            (Side::Encoder, layer)
        } else {
            (Side::Decoder, layer - self.num_enc_layers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::NaoError;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn codec() -> ArchSeqCodec {
        ArchSeqCodec::new(SearchSpace::normal(), 2, 2)
    }

    #[test]
    fn token_ranges_are_disjoint_and_skip_sos() {
        let codec = codec();
        assert_eq!(codec.vocab_size(), 1 + 3 + 4 + 4 + 3 + 4 + 4);
        let mut previous_end = 1;
        for slot in 0..LAYER_CODE_LEN {
            let range = codec.valid_tokens(slot, None);
            assert_eq!(range.start, previous_end);
            assert!(!range.contains(&SOS_TOKEN));
            previous_end = range.end;
        }
    }

    #[test]
    fn kind_narrows_valid_tokens() {
        let codec = codec();
        // Bidirectional flag has two choices, the widest slot has four.
        assert_eq!(codec.valid_tokens(2, Some(LayerKind::Lstm)).len(), 2);
        assert_eq!(codec.valid_tokens(2, None).len(), 4);
        assert_eq!(codec.valid_tokens(8, Some(LayerKind::Convolutional)).len(), 4);
    }

    #[test]
    fn round_trip_random_codes() {
        let codec = codec();
        let space = SearchSpace::normal();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let code = space.sample_net_code(&mut rng, 2, 2);
            let seq = codec.encode(&code).unwrap();
            assert_eq!(seq.len(), codec.seq_len());
            assert!(seq.iter().all(|&t| t != SOS_TOKEN && t < codec.vocab_size()));
            assert_eq!(codec.decode(&seq).unwrap(), code);
        }
    }

    #[test]
    fn decode_rejects_index_invalid_for_kind() {
        let codec = codec();
        let space = SearchSpace::normal();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut code = space.sample_net_code(&mut rng, 2, 2);
        let mut encoder = code.encoder().to_vec();
        // An LSTM only has two bidirectional choices.
        encoder[0] = vec![0, 0, 3, 0, 0, 0];
        code = NetCode::new(encoder, code.decoder().to_vec());

        let mut seq = Vec::new();
        for layer in code.encoder().iter().chain(code.decoder()) {
            for (slot, &v) in layer.iter().enumerate() {
                seq.push(codec.valid_tokens(slot, None).start + v);
            }
        }
        assert!(matches!(codec.decode(&seq), Err(NaoError::Arch(ArchError::IndexOutOfRange { .. }))));
    }

    #[test]
    fn wrong_depth_is_mismatch() {
        let codec = codec();
        let code = SearchSpace::normal().sample_net_code(&mut ChaCha8Rng::seed_from_u64(0), 1, 2);
        assert!(matches!(
            codec.encode(&code),
            Err(NaoError::Arch(ArchError::LayerCountMismatch { .. }))
        ));
        assert!(matches!(
            codec.decode(&[1; 6]),
            Err(NaoError::Arch(ArchError::LayerCountMismatch { .. }))
        ));
        assert!(matches!(
            codec.decode(&[1; 7]),
            Err(NaoError::Arch(ArchError::BadSequence { .. }))
        ));
    }

    #[test]
    fn locate_positions() {
        let codec = codec();
        assert_eq!(codec.locate(0), (Side::Encoder, 0));
        assert_eq!(codec.locate(13), (Side::Decoder, 0));
        assert_eq!(codec.locate(23), (Side::Decoder, 1));
    }
}
