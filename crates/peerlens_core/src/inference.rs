/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::DetectorConfig;

/// Flat `f32` buffer plus its shape.
///
/// Owned by the stage that produced it until it is moved into the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))
            .ok_or_else(|| anyhow!("tensor shape overflows: {shape:?}"))?;
        if expected != data.len() {
            return Err(anyhow!(
                "tensor shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Opaque model execution engine.
///
/// Input is `float32[1,3,H,W]` RGB in `[0,1]`; output is
/// `float32[numProposals, 5 + numClasses]` (a leading batch axis of 1 is
/// tolerated).
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, input: Tensor) -> Result<Tensor>;
}

/// Loads the engine configured for this build.
///
/// Failure here is a model-load failure: callers disable detection for the
/// session and surface the message.
pub async fn load_engine(cfg: &DetectorConfig) -> Result<Arc<dyn InferenceEngine>> {
    let meta = tokio::fs::metadata(&cfg.model_path)
        .await
        .with_context(|| format!("model file not found: {}", cfg.model_path.display()))?;
    if !meta.is_file() {
        return Err(anyhow!("model path is not a file: {}", cfg.model_path.display()));
    }
    #[cfg(feature = "backend-tract")]
    {
        let cfg = cfg.clone();
        let engine = tokio::task::spawn_blocking(move || {
            crate::tract_engine::TractEngine::load(&cfg.model_path, cfg.input_width, cfg.input_height)
        })
        .await
        .map_err(|e| anyhow!("model loader panicked: {e}"))??;
        Ok(Arc::new(engine))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow!(
            "no inference backend compiled in (build with --features backend-tract to load {})",
            cfg.model_path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_rejects_mismatched_shape() {
        assert!(Tensor::new(vec![1, 3, 2, 2], vec![0.0; 12]).is_ok());
        assert!(Tensor::new(vec![1, 3, 2, 2], vec![0.0; 11]).is_err());
    }

    #[tokio::test]
    async fn missing_model_file_is_reported_before_backend() {
        let mut cfg = DetectorConfig::default();
        cfg.model_path = "/nonexistent/yolo.onnx".into();
        let err = load_engine(&cfg).await.err().unwrap();
        assert!(format!("{err:#}").starts_with("model file not found"));

        let dir = tempfile::tempdir().unwrap();
        cfg.model_path = dir.path().to_path_buf();
        let err = load_engine(&cfg).await.err().unwrap();
        assert!(err.to_string().starts_with("model path is not a file"));
    }

    #[test]
    fn tensor_rejects_overflowing_shape() {
        assert!(Tensor::new(vec![usize::MAX, 2], vec![]).is_err());
    }
}
