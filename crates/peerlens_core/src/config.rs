/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How the initiator delivers its offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferMode {
    /// Through the relay, to the discovered peer.
    #[default]
    Peer,
    /// `POST {api_url}/offer`; the HTTP response carries the answer.
    Server,
}

impl FromStr for OfferMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "wasm" is what the browser client calls in-page detection.
            "peer" | "wasm" => Ok(OfferMode::Peer),
            "server" => Ok(OfferMode::Server),
            other => Err(anyhow!("unknown mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub num_classes: usize,
    pub num_proposals: usize,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov5n-quantized.onnx"),
            input_width: 640,
            input_height: 640,
            num_classes: 80,
            num_proposals: 25_200,
            confidence_threshold: 0.45,
            iou_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub signaling_url: String,
    pub api_url: String,
    pub mode: OfferMode,
    pub ice_urls: Vec<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
    pub detector: DetectorConfig,
    /// Frame Source cadence (display refresh rate).
    pub capture_fps: u32,
    pub detect_tick_ms: u64,
    /// Run a benchmark for this long once detection is live, then write `metrics_out`.
    pub benchmark_secs: Option<u64>,
    pub metrics_out: PathBuf,
    /// Annex-B H.264 file the sender streams as its camera track.
    pub media_path: Option<PathBuf>,
    /// Frame rate the sender paces `media_path` at.
    pub media_fps: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:3001/ws".to_string(),
            api_url: "http://127.0.0.1:8000".to_string(),
            mode: OfferMode::Peer,
            ice_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ice_username: None,
            ice_credential: None,
            detector: DetectorConfig::default(),
            capture_fps: 60,
            detect_tick_ms: 16,
            benchmark_secs: None,
            metrics_out: PathBuf::from("metrics.json"),
            media_path: None,
            media_fps: 30,
        }
    }
}

impl CoreConfig {
    /// Reads the JSON file (if any), applies `PEERLENS_*` overrides and clamps.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).with_context(|| format!("read config {}", p.display()))?;
                Self::from_json_str(&text).with_context(|| format!("parse config {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let mut cfg: Self = serde_json::from_str(text).context("config json")?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Config path from the first CLI argument, falling back to `PEERLENS_CONFIG`.
    pub fn path_from_args() -> Option<PathBuf> {
        std::env::args()
            .nth(1)
            .or_else(|| std::env::var("PEERLENS_CONFIG").ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = get("PEERLENS_SIGNALING_URL") {
            self.signaling_url = v;
        }
        if let Some(v) = get("PEERLENS_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = get("PEERLENS_MODE") {
            self.mode = v.parse().context("PEERLENS_MODE")?;
        }
        if let Some(v) = get("PEERLENS_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(v);
        }
        if let Some(v) = get("PEERLENS_MEDIA_PATH") {
            self.media_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.signaling_url = self.signaling_url.trim().to_string();
        self.api_url = self.api_url.trim().trim_end_matches('/').to_string();
        self.ice_urls = self
            .ice_urls
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.ice_username = self.ice_username.take().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        self.ice_credential = self.ice_credential.take().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        self.capture_fps = self.capture_fps.clamp(1, 240);
        self.media_fps = self.media_fps.clamp(1, 120);
        self.detect_tick_ms = self.detect_tick_ms.clamp(1, 1000);
        self.benchmark_secs = self.benchmark_secs.filter(|s| *s > 0).map(|s| s.min(3600));

        let d = &mut self.detector;
        d.input_width = d.input_width.max(1);
        d.input_height = d.input_height.max(1);
        d.num_proposals = d.num_proposals.max(1);
        d.confidence_threshold = d.confidence_threshold.clamp(0.0, 1.0);
        d.iou_threshold = d.iou_threshold.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_yolov5n() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.detector.input_width, 640);
        assert_eq!(cfg.detector.num_proposals * (5 + cfg.detector.num_classes), 25_200 * 85);
        assert_eq!(cfg.detector.confidence_threshold, 0.45);
        assert_eq!(cfg.detector.iou_threshold, 0.5);
        assert_eq!(cfg.mode, OfferMode::Peer);
    }

    #[test]
    fn partial_json_keeps_defaults_and_clamps() {
        let cfg = CoreConfig::from_json_str(
            r#"{
                "mode": "server",
                "api_url": "http://10.0.0.2:8000/",
                "capture_fps": 0,
                "media_fps": 500,
                "ice_urls": ["  ", "stun:example.org:3478"],
                "detector": {"confidence_threshold": 3.0}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.mode, OfferMode::Server);
        assert_eq!(cfg.api_url, "http://10.0.0.2:8000");
        assert_eq!(cfg.capture_fps, 1);
        assert_eq!(cfg.media_fps, 120);
        assert_eq!(cfg.ice_urls, vec!["stun:example.org:3478".to_string()]);
        assert_eq!(cfg.detector.confidence_threshold, 1.0);
        assert_eq!(cfg.detector.input_height, 640);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("PEERLENS_MODE", "wasm"),
            ("PEERLENS_SIGNALING_URL", "ws://relay:3001/ws"),
            ("PEERLENS_MODEL_PATH", "/tmp/m.onnx"),
        ]
        .into_iter()
        .collect();
        let mut cfg = CoreConfig {
            mode: OfferMode::Server,
            ..CoreConfig::default()
        };
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.mode, OfferMode::Peer);
        assert_eq!(cfg.signaling_url, "ws://relay:3001/ws");
        assert_eq!(cfg.detector.model_path, PathBuf::from("/tmp/m.onnx"));
    }

    #[test]
    fn bad_mode_is_rejected() {
        let mut cfg = CoreConfig::default();
        assert!(cfg.apply_overrides(|k| (k == "PEERLENS_MODE").then(|| "mesh".to_string())).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerlens.json");
        std::fs::write(&path, r#"{"detect_tick_ms": 5000}"#).unwrap();
        let cfg = CoreConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.detect_tick_ms, 1000);
    }
}
