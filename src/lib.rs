//! # proctex
//!
//! **Lazy GPU compute graphs for procedural textures.**
//!
//! Chain small compute stages (noise, rounding, thresholding, normal maps) into a graph
//! and ask the last one for its texture. Only the stages whose parameters or inputs
//! changed since the last pull are recomputed; everything else is served from the
//! texture it already holds.
//!
//! ## Quick Start
//!
//! ```
//! use proctex::*;
//!
//! let backend = CpuBackend::new();
//! let mut graph = TextureGraph::new(&backend);
//!
//! let noise = graph.add(NoiseGenerator::new().with_size(64, 64));
//! let round = graph.add_after(RoundModifier::new(), noise)?;
//! let step = graph.add_after(StepModifier::with_levels(0.0, 1.0, 0.5), round)?;
//!
//! let texture = graph.texture(step)?.expect("chain is attached");
//! assert_eq!(texture.extent, Extent::new(64, 64));
//!
//! // Only the round and step stages recompute.
//! graph.stage_mut::<RoundModifier>(round).unwrap().set_round(0.25);
//! graph.texture(step)?;
//! # Ok::<(), GraphError>(())
//! ```
//!
//! ## Backends
//!
//! Stages never touch a device directly; they go through a [`ComputeBackend`]. Use
//! [`WgpuBackend`] for real work and [`CpuBackend`] for tests and headless tools.

mod backend;
mod config;
pub mod controls;
mod error;
mod graph;
pub mod kernels;
mod provider;
pub mod stages;
mod target;

pub use backend::cpu::BackendStats;
pub use backend::{
    BufferId, ComputeBackend, CpuBackend, Extent, KernelArgs, KernelId, TextureFormat,
    TextureHandle, TextureId, WgpuBackend, WgpuConfig,
};
pub use config::GraphConfig;
pub use controls::{Control, ControlTable, ControlValue, Controls};
pub use error::{BackendError, BackendResult, GraphError, GraphResult};
pub use graph::{NodeId, TextureGraph};
pub use provider::TextureProvider;
pub use stages::{
    Constant, ConstantGenerator, Generator, Modifier, Noise, NoiseGenerator, NormalMapModifier,
    Round, RoundModifier, StageKernel, Step, StepModifier,
};
pub use target::OutputTarget;

// Re-export wgpu for adapter options in WgpuConfig
pub use wgpu;
