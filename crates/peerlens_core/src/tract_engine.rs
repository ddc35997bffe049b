/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tract_onnx::prelude::*;

use crate::inference::{InferenceEngine, Tensor as FlatTensor};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX model executed on the CPU with tract.
pub struct TractEngine {
    model: Arc<Plan>,
}

impl TractEngine {
    pub fn load<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, height as usize, width as usize)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self { model: Arc::new(model) })
    }
}

fn run_blocking(model: &Plan, input: FlatTensor) -> Result<FlatTensor> {
    let shape = tract_ndarray::IxDyn(input.shape());
    let array = tract_ndarray::ArrayD::from_shape_vec(shape, input.into_data())
        .context("input tensor layout")?;
    let outputs = model
        .run(tvec!(array.into_tensor().into()))
        .context("ONNX inference failed")?;
    let output = outputs
        .first()
        .ok_or_else(|| anyhow!("model produced no outputs"))?;
    let view = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?;
    FlatTensor::new(view.shape().to_vec(), view.iter().copied().collect())
}

#[async_trait]
impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    async fn run(&self, input: FlatTensor) -> Result<FlatTensor> {
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || run_blocking(&model, input))
            .await
            .map_err(|e| anyhow!("inference task panicked: {e}"))?
    }
}
