use std::{cmp::Reverse, fmt::Display};

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use plane::ml::{
    layer::LayerInitStrategy,
    nn::{
        dense::Dense,
        embedding::EmbeddingLayer,
        linear::Linear,
        lstm::{LstmLayer, LstmState},
        solver::source::OptimizerSource,
    },
    NodeValue, RngStrategy,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::data::{Embeddings, PhrasePair};

/// A batch ready for the network, ordered by input length, longest first.
#[derive(Debug, Clone)]
pub struct PackedBatch {
    /// input tokens, every row padded with `#END` to the longest input
    pub input_tokens: Vec<Vec<usize>>,
    pub input_lengths: Vec<usize>,
    pub input_masks: Vec<Linear>,
    pub inputs: Vec<Linear>,
    /// embedded `output[..len - 1]`, fed to the decoder with teacher forcing
    pub decoder_inputs: Vec<Linear>,
    pub outputs: Vec<Vec<usize>>,
}

impl PackedBatch {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn max_input_len(&self) -> usize {
        self.input_lengths.first().copied().unwrap_or_default()
    }

    /// expected decoder outputs for a batch row, `output[1..]`
    pub fn targets(&self, row: usize) -> &[usize] {
        &self.outputs[row][1..]
    }
}

#[instrument(level = "debug", skip_all)]
pub fn pack_batch(batch: &[PhrasePair], embeddings: &Embeddings) -> Result<PackedBatch> {
    let mut batch = batch.iter().collect_vec();
    batch.sort_by_key(|sample| Reverse(sample.input.len()));
    let max_len = batch.first().context("can not pack an empty batch")?.input.len();
    let layer = embeddings.layer();

    let mut packed = PackedBatch {
        input_tokens: Vec::with_capacity(batch.len()),
        input_lengths: Vec::with_capacity(batch.len()),
        input_masks: Vec::with_capacity(batch.len()),
        inputs: Vec::with_capacity(batch.len()),
        decoder_inputs: Vec::with_capacity(batch.len()),
        outputs: Vec::with_capacity(batch.len()),
    };

    for sample in batch {
        if sample.input.is_empty() {
            return Err(anyhow!("sample input sequence is empty"));
        }
        if sample.output.len() < 2 {
            return Err(anyhow!("sample output sequence needs at least two tokens"));
        }
        let decoder_input = &sample.output[..sample.output.len() - 1];

        let (tokens, mask) =
            EmbeddingLayer::pad_inputs(&sample.input, max_len, embeddings.end_index());

        packed.inputs.push(layer.forward(&tokens)?);
        packed.decoder_inputs.push(layer.forward(decoder_input)?);
        packed.input_tokens.push(tokens);
        packed.input_lengths.push(sample.input.len());
        packed.input_masks.push(mask);
        packed.outputs.push(sample.output.clone());
    }

    Ok(packed)
}

/// LSTM encoder-decoder with a dense projection onto the vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhraseModel {
    encoder: LstmLayer,
    decoder: LstmLayer,
    output: Dense,
    hid_size: usize,
}

impl PhraseModel {
    pub fn new(emb_size: usize, dict_size: usize, hid_size: usize, rng: &RngStrategy) -> Self {
        Self {
            encoder: LstmLayer::new(emb_size, hid_size, rng),
            decoder: LstmLayer::new(emb_size, hid_size, rng),
            output: Dense::new(hid_size, dict_size, &LayerInitStrategy::UniformFanIn, rng),
            hid_size,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.encoder.parameter_count()
            + self.decoder.parameter_count()
            + self.output.parameter_count()
    }

    /// Final encoder state for every row of the batch.
    #[instrument(level = "debug", skip_all)]
    pub fn encode(&self, batch: &PackedBatch) -> Result<Vec<LstmState>> {
        batch
            .inputs
            .iter()
            .zip(&batch.input_masks)
            .map(|(inputs, mask)| {
                let initial_state = LstmState::zero(self.hid_size);
                let output = self.encoder.forward(inputs, &initial_state, Some(mask))?;
                Ok(output.state)
            })
            .collect()
    }

    /// Teacher-forced decode, returning one row of logits per input step.
    pub fn decode_teacher(&self, hid: &LstmState, inputs: &Linear) -> Result<Linear> {
        let decoded = self.decoder.forward(inputs, hid, None)?;
        self.output.forward(&decoded.outputs)
    }

    /// Backpropagates `dlogits` for one batch row through the output layer,
    /// the decoder and then the encoder.
    pub fn backward_teacher(
        &self,
        batch: &PackedBatch,
        row: usize,
        encoder_state: &LstmState,
        dlogits: &Linear,
    ) -> Result<()> {
        let decoder_inputs = batch
            .decoder_inputs
            .get(row)
            .with_context(|| format!("batch row {row} out of range"))?;
        let decoded = self.decoder.forward(decoder_inputs, encoder_state, None)?;
        let doutputs = self.output.backward(&decoded.outputs, dlogits)?;
        let decoder_gradients =
            self.decoder
                .backward(decoder_inputs, encoder_state, None, &doutputs, None)?;

        let inputs = &batch.inputs[row];
        let encoder_output_gradients = Linear::new(inputs.count(), self.hid_size);
        self.encoder.backward(
            inputs,
            &LstmState::zero(self.hid_size),
            Some(&batch.input_masks[row]),
            &encoder_output_gradients,
            Some(&decoder_gradients.initial_state),
        )?;
        Ok(())
    }

    /// Greedy decode from `#BEG`, stopping after `#END` or `max_len` tokens.
    pub fn decode_chain_argmax(
        &self,
        hid: &LstmState,
        embeddings: &Embeddings,
        max_len: usize,
    ) -> Result<Vec<usize>> {
        let mut state = hid.clone();
        let mut token = embeddings.begin_index();
        let mut tokens = vec![];

        for _ in 0..max_len {
            let inputs = embeddings.layer().forward([token])?;
            let decoded = self.decoder.forward(&inputs, &state, None)?;
            let logits = self.output.forward(&decoded.outputs)?;
            token = logits
                .as_single_stride()?
                .position_max()
                .context("can not sample from empty logits")?;

            state = decoded.state;
            tokens.push(token);
            if token == embeddings.end_index() {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.encoder.apply_gradients(&optimizer.with_index(1))?;
        self.decoder.apply_gradients(&optimizer.with_index(2))?;
        self.output.apply_gradients(&optimizer.with_index(3))?;
        Ok(())
    }

    /// L2 norm over every pending parameter gradient.
    pub fn gradient_norm(&self) -> NodeValue {
        let sum_squares = self.encoder.gradient_sum_squares()
            + self.decoder.gradient_sum_squares()
            + self.output.gradient_sum_squares();
        sum_squares.sqrt()
    }

    pub fn reset_gradients(&self) {
        self.encoder.reset_gradients();
        self.decoder.reset_gradients();
        self.output.reset_gradients();
    }
}

impl Display for PhraseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "PhraseModel(")?;
        for (name, lstm) in [("encoder", &self.encoder), ("decoder", &self.decoder)] {
            let (inputs, hidden) = (lstm.input_dimension(), lstm.hidden_dimension());
            writeln!(f, "  ({name}): LSTM({inputs}, {hidden})")?;
        }
        writeln!(
            f,
            "  (output): Linear(in_features={}, out_features={}, bias=True)",
            self.output.inputs_count(),
            self.output.outputs_count()
        )?;
        write!(f, ")")
    }
}
