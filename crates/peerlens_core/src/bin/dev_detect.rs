/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One-shot detection over an image file:
//! `dev_detect <image> [config.json]`.

use anyhow::{anyhow, Result};
use peerlens_core::config::CoreConfig;
use peerlens_core::detection::Decoder;
use peerlens_core::frame_source::{StillImageSurface, VideoSurface};
use peerlens_core::inference::load_engine;
use peerlens_core::overlay::{class_counts, label_text};
use peerlens_core::preprocess::preprocess;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let image = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: dev_detect <image> [config.json]"))?;
    let cfg_path = args.next().map(PathBuf::from);
    let cfg = CoreConfig::load(cfg_path.as_deref())?;
    let d = &cfg.detector;

    let frame = StillImageSurface::open(&image)?.capture()?;
    info!(width = frame.width, height = frame.height, "image loaded");
    let engine = load_engine(d).await?;
    let decoder = Decoder::from_config(d);

    let started = Instant::now();
    let input = preprocess(&frame, d.input_width, d.input_height)?;
    let output = engine.run(input).await?;
    let boxes = decoder.detect_tensor(&output);
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    info!(boxes = boxes.len(), elapsed_ms, "detection finished");
    for b in &boxes {
        println!(
            "{:<24} x={:.1} y={:.1} w={:.1} h={:.1}",
            label_text(b),
            b.x,
            b.y,
            b.w,
            b.h
        );
    }
    for c in class_counts(&boxes) {
        println!("{}: {}", c.label, c.count);
    }
    Ok(())
}
