//! Feed-forward neural joint model inference on candle.
//!
//! The network is the classic joint-model shape: one shared embedding table
//! over the concatenated (source window + target history) context, two tanh
//! hidden layers, and an output layer producing per-word logits. With a
//! self-normalized model the raw output logit is already a log-probability
//! and the softmax is skipped.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::{Embedding, Linear, Module};
use tracing::warn;

use crate::nnjm::JointScorer;
use crate::vocab::SymbolId;

const LN_10: f64 = std::f64::consts::LN_10;
/// Returned when a forward pass fails; matches the decoder's pseudo-zero.
const SCORE_FLOOR: f64 = -99.0;

pub struct NeuralJointModel {
    embeddings: Embedding,
    hidden1: Linear,
    hidden2: Linear,
    output: Linear,
    context_len: usize,
    normalize: bool,
    device: Device,
}

impl NeuralJointModel {
    /// Load weights from a safetensors file.
    ///
    /// Expected tensors: `embeddings.weight [vocab, dim]`,
    /// `hidden1.{weight,bias}`, `hidden2.{weight,bias}`,
    /// `output.{weight,bias} [vocab, h2]`.
    pub fn open(path: &Path, context_len: usize, normalize: bool) -> anyhow::Result<Self> {
        let device = Device::Cpu;
        let tensors = candle_core::safetensors::load(path, &device)?;

        let emb_weight = tensor(&tensors, "embeddings.weight")?;
        let (_, dim) = emb_weight.dims2()?;
        let embeddings = Embedding::new(emb_weight, dim);

        let hidden1 = linear(&tensors, "hidden1")?;
        let hidden2 = linear(&tensors, "hidden2")?;
        let output = linear(&tensors, "output")?;

        Ok(Self {
            embeddings,
            hidden1,
            hidden2,
            output,
            context_len,
            normalize,
            device,
        })
    }

    /// Build from in-memory tensors (used by tests).
    pub fn from_tensors(
        embeddings: Tensor,
        hidden1: (Tensor, Tensor),
        hidden2: (Tensor, Tensor),
        output: (Tensor, Tensor),
        context_len: usize,
        normalize: bool,
    ) -> anyhow::Result<Self> {
        let (_, dim) = embeddings.dims2()?;
        Ok(Self {
            embeddings: Embedding::new(embeddings, dim),
            hidden1: Linear::new(hidden1.0, Some(hidden1.1)),
            hidden2: Linear::new(hidden2.0, Some(hidden2.1)),
            output: Linear::new(output.0, Some(output.1)),
            context_len,
            normalize,
            device: Device::Cpu,
        })
    }

    pub fn context_len(&self) -> usize {
        self.context_len
    }

    fn logit(&self, context: &[SymbolId], word: SymbolId) -> anyhow::Result<f64> {
        let ids = Tensor::new(context, &self.device)?;
        let embedded = self.embeddings.forward(&ids)?; // [ctx, dim]
        let flat = embedded.flatten_all()?.unsqueeze(0)?; // [1, ctx*dim]
        let h1 = self.hidden1.forward(&flat)?.tanh()?;
        let h2 = self.hidden2.forward(&h1)?.tanh()?;
        let logits = self.output.forward(&h2)?; // [1, vocab]
        let logits = if self.normalize {
            log_softmax(&logits, D::Minus1)?
        } else {
            logits
        };
        let value = logits
            .squeeze(0)?
            .get(word as usize)?
            .to_scalar::<f32>()?;
        Ok(value as f64)
    }
}

fn tensor(tensors: &HashMap<String, Tensor>, name: &str) -> anyhow::Result<Tensor> {
    tensors
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing tensor {name}"))
}

fn linear(tensors: &HashMap<String, Tensor>, name: &str) -> anyhow::Result<Linear> {
    let weight = tensor(tensors, &format!("{name}.weight"))?;
    let bias = tensor(tensors, &format!("{name}.bias"))?;
    Ok(Linear::new(weight, Some(bias)))
}

impl JointScorer for NeuralJointModel {
    fn score(
        &self,
        source_window: &[SymbolId],
        target_history: &[SymbolId],
        target_word: SymbolId,
    ) -> f64 {
        let mut context = Vec::with_capacity(source_window.len() + target_history.len());
        context.extend_from_slice(source_window);
        context.extend_from_slice(target_history);
        debug_assert_eq!(context.len(), self.context_len);
        match self.logit(&context, target_word) {
            // Model outputs are natural-log; the decoder works in log10.
            Ok(v) => v / LN_10,
            Err(e) => {
                warn!(error = %e, "nnjm forward failed, flooring score");
                SCORE_FLOOR
            }
        }
    }
}
