/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod detection;
pub mod frame_source;
pub mod inference;
pub mod labels;
pub mod metrics;
pub mod negotiation;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
pub mod remote_video;
pub mod runtime;
pub mod server_mode;
pub mod signaling;
#[cfg(feature = "backend-tract")]
pub mod tract_engine;
pub mod webrtc_transport;
