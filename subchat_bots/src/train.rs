use anyhow::{anyhow, Result};
use itertools::Itertools;
use plane::ml::{
    nn::{linear::Linear, loss::cross_entropy, lstm::LstmState},
    NodeValue,
};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    data::{Embeddings, PhrasePair},
    model::{pack_batch, PackedBatch, PhraseModel},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchReport {
    pub loss: NodeValue,
    /// decoder steps contributing to the loss
    pub steps: usize,
    pub samples: usize,
    pub gradient_norm: NodeValue,
}

struct BatchForward {
    batch: PackedBatch,
    states: Vec<LstmState>,
    step_counts: Vec<usize>,
    loss: NodeValue,
    dlogits: Linear,
}

/// Runs one forward and one backward pass over `samples`, leaving the
/// gradients queued on the network parameters.
#[instrument(level = "info", skip_all)]
pub fn train_batch(
    net: &PhraseModel,
    embeddings: &Embeddings,
    samples: &[PhrasePair],
) -> Result<BatchReport> {
    let forward = forward_batch(net, embeddings, samples)?;

    let mut offset = 0;
    let mut sample_dlogits = Vec::with_capacity(forward.step_counts.len());
    for &count in &forward.step_counts {
        sample_dlogits.push(forward.dlogits.rows(offset, count)?);
        offset += count;
    }

    #[cfg(feature = "threadpool")]
    use rayon::prelude::*;

    let sample_dlogits_iter = {
        #[cfg(feature = "threadpool")]
        {
            sample_dlogits.par_iter()
        }
        #[cfg(not(feature = "threadpool"))]
        {
            sample_dlogits.iter()
        }
    };
    sample_dlogits_iter
        .enumerate()
        .map(|(row, dlogits)| {
            net.backward_teacher(&forward.batch, row, &forward.states[row], dlogits)
        })
        .collect::<Result<Vec<()>>>()?;

    let report = BatchReport {
        loss: forward.loss,
        steps: offset,
        samples: forward.batch.len(),
        gradient_norm: net.gradient_norm(),
    };
    debug!("Completed batch: {report:?}");
    Ok(report)
}

/// Mean cross-entropy over `samples` without touching the gradients.
pub fn batch_loss(
    net: &PhraseModel,
    embeddings: &Embeddings,
    samples: &[PhrasePair],
) -> Result<NodeValue> {
    Ok(forward_batch(net, embeddings, samples)?.loss)
}

fn forward_batch(
    net: &PhraseModel,
    embeddings: &Embeddings,
    samples: &[PhrasePair],
) -> Result<BatchForward> {
    let batch = pack_batch(samples, embeddings)?;
    let states = net.encode(&batch)?;

    #[cfg(feature = "threadpool")]
    use rayon::prelude::*;

    let states_iter = {
        #[cfg(feature = "threadpool")]
        {
            states.par_iter()
        }
        #[cfg(not(feature = "threadpool"))]
        {
            states.iter()
        }
    };
    let sample_logits = states_iter
        .zip(&batch.decoder_inputs)
        .map(|(state, decoder_inputs)| net.decode_teacher(state, decoder_inputs))
        .collect::<Result<Vec<_>>>()?;

    let step_counts = sample_logits.iter().map(|x| x.count()).collect_vec();
    let logits = Linear::vstack(&sample_logits)?;
    let targets = (0..batch.len())
        .flat_map(|row| batch.targets(row).iter().copied())
        .collect_vec();

    let (loss, dlogits) = cross_entropy(&logits, &targets)?;
    if !loss.is_finite() {
        return Err(anyhow!("batch loss is not finite: {loss}"));
    }

    Ok(BatchForward {
        batch,
        states,
        step_counts,
        loss,
        dlogits,
    })
}

/// Greedy reply to a single encoded phrase.
pub fn generate_reply(
    net: &PhraseModel,
    embeddings: &Embeddings,
    input: &[usize],
    max_len: usize,
) -> Result<Vec<usize>> {
    let sample = PhrasePair {
        input: input.to_vec(),
        output: vec![embeddings.begin_index(), embeddings.end_index()],
    };
    let batch = pack_batch(&[sample], embeddings)?;
    let states = net.encode(&batch)?;
    let state = states
        .first()
        .ok_or_else(|| anyhow!("encoder produced no state"))?;
    net.decode_chain_argmax(state, embeddings, max_len)
}
