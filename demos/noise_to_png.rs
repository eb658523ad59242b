//! Renders noise -> round -> step and a normal map of the noise to PNG files.
//!
//! Runs on the GPU when an adapter is available, on the CPU backend otherwise.
//!
//! ```text
//! RUST_LOG=debug cargo run --example noise_to_png -- out
//! ```

use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};
use proctex::{
    ComputeBackend, CpuBackend, GraphConfig, NodeId, NoiseGenerator, NormalMapModifier,
    RoundModifier, StepModifier, TextureGraph, WgpuBackend, WgpuConfig,
};

fn save(
    graph: &mut TextureGraph<'_>,
    id: NodeId,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let size = graph.texture_size(id)?;
    let texels = graph
        .read_texels(id)?
        .ok_or("stage has no upstream")?;

    let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let mut image = RgbaImage::new(size.width, size.height);
    for (pixel, t) in image.pixels_mut().zip(texels.chunks_exact(4)) {
        *pixel = Rgba([channel(t[0]), channel(t[1]), channel(t[2]), channel(t[3])]);
    }
    image.save(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run(backend: &dyn ComputeBackend, out: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut graph = TextureGraph::with_config(backend, GraphConfig::new().default_size(256, 256));

    let noise = graph.add(NoiseGenerator::new());
    graph.stage_mut::<NoiseGenerator>(noise).ok_or("noise")?.set_frequency(8.0);
    let round = graph.add_after(RoundModifier::new(), noise)?;
    graph.stage_mut::<RoundModifier>(round).ok_or("round")?.set_round(0.125);
    let step = graph.add_after(StepModifier::with_levels(0.1, 0.9, 0.5), round)?;
    let normals = graph.add_after(NormalMapModifier::new(), noise)?;

    std::fs::create_dir_all(out)?;
    save(&mut graph, step, &out.join("step.png"))?;
    save(&mut graph, normals, &out.join("normals.png"))?;

    // Only the step stage recomputes.
    graph.stage_mut::<StepModifier>(step).ok_or("step")?.set_boundary(0.3);
    save(&mut graph, step, &out.join("step_low.png"))?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let out = std::env::args().nth(1).map_or_else(|| PathBuf::from("out"), PathBuf::from);

    match WgpuBackend::new(WgpuConfig::default()) {
        Ok(backend) => run(&backend, &out),
        Err(err) => {
            log::warn!("falling back to the CPU backend: {err}");
            run(&CpuBackend::new(), &out)
        }
    }
}
