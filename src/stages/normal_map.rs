//! Normal maps derived from an upstream height field.

use std::any::Any;

use glam::Vec3;
use image::{ImageBuffer, Luma};
use log::warn;

use crate::backend::{ComputeBackend, Extent, TextureHandle, component_count};
use crate::controls::{self, Control, ControlTable, ControlValue, Controls};
use crate::error::{GraphError, GraphResult};
use crate::graph::{NodeId, TextureGraph};
use crate::provider::TextureProvider;
use crate::stages::UpstreamLink;
use crate::target::OutputTarget;

const STAGE: &str = "normalMap";

/// Gaussian sigma at `smoothing == 1`.
const MAX_SIGMA: f32 = 4.0;

type HeightField = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Converts the upstream's luminance into a tangent-space normal map.
///
/// Unlike the kernel stages this one computes on the host: the upstream is read back,
/// optionally blurred, differentiated and uploaded into the output. Gradients wrap
/// around the edges so tiling inputs give tiling normals. Normals are encoded as
/// `n * 0.5 + 0.5` in RGB with opaque alpha.
#[derive(Debug)]
pub struct NormalMapModifier {
    intensity: f32,
    smoothing: f32,
    link: UpstreamLink,
    dirty: bool,
    revision: u64,
    output: OutputTarget,
}

impl Default for NormalMapModifier {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            smoothing: 0.0,
            link: UpstreamLink::default(),
            dirty: true,
            revision: 0,
            output: OutputTarget::new(),
        }
    }
}

static NORMAL_MAP_CONTROLS: ControlTable<NormalMapModifier> = ControlTable::new(&[
    Control {
        name: "intensity",
        get: |n| n.intensity.into(),
        set: |n, v| {
            n.intensity = controls::float("intensity", v)?;
            Ok(())
        },
    },
    Control {
        name: "smoothing",
        get: |n| n.smoothing.into(),
        set: |n, v| {
            n.smoothing = controls::float("smoothing", v)?.clamp(0.0, 1.0);
            Ok(())
        },
    },
]);

impl NormalMapModifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Magnification of the gradients. `1.0` leaves them as measured.
    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        self.intensity = intensity;
        self.dirty = true;
    }

    /// Pre-blur amount in `[0, 1]`.
    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 1.0);
        self.dirty = true;
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }
}

impl TextureProvider for NormalMapModifier {
    fn stage_name(&self) -> &'static str {
        STAGE
    }

    fn upstream(&self) -> Option<NodeId> {
        self.link.node()
    }

    fn set_upstream(&mut self, upstream: Option<NodeId>) -> GraphResult<()> {
        self.link.set(upstream);
        self.dirty = true;
        Ok(())
    }

    fn texture_size(&self, graph: &TextureGraph<'_>) -> Extent {
        self.link.size(graph)
    }

    fn is_dirty(&self, graph: &TextureGraph<'_>) -> bool {
        self.dirty || self.link.is_stale(graph)
    }

    fn can_update(&self) -> bool {
        self.link.node().is_some()
    }

    fn update_texture(
        &mut self,
        graph: &mut TextureGraph<'_>,
    ) -> GraphResult<Option<TextureHandle>> {
        let Some(upstream) = self.link.node() else {
            return Ok(None);
        };
        let backend = graph.backend();
        let label = graph.config().resource_label(STAGE);

        let Some(input) = graph.texture(upstream)? else {
            return Ok(None);
        };
        let output = self
            .output
            .ensure(backend, input.extent, graph.config().format, &label)?;

        let texels = backend.read_texels(input)?;
        let normals = derive_normals(input.extent, &texels, self.intensity, self.smoothing)
            .map_err(|reason| {
                warn!("{label}: {reason}");
                GraphError::Derive {
                    stage: STAGE,
                    reason,
                }
            })?;
        backend
            .write_texels(output, &normals)
            .inspect_err(|e| warn!("{label}: {e}"))?;

        self.link.mark_consumed(graph);
        self.dirty = false;
        self.revision += 1;
        Ok(Some(output))
    }

    fn cached(&self) -> Option<TextureHandle> {
        self.output.handle()
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn controls(&self) -> Controls {
        NORMAL_MAP_CONTROLS.snapshot(self)
    }

    fn set_control(&mut self, name: &str, value: ControlValue) -> GraphResult<()> {
        NORMAL_MAP_CONTROLS.set(self, STAGE, name, value)?;
        self.dirty = true;
        Ok(())
    }

    fn release(&mut self, backend: &dyn ComputeBackend) {
        self.output.release(backend);
        self.dirty = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Builds encoded normals from interleaved RGBA `texels` of size `extent`.
fn derive_normals(
    extent: Extent,
    texels: &[f32],
    intensity: f32,
    smoothing: f32,
) -> Result<Vec<f32>, String> {
    let expected = component_count(extent);
    if texels.len() != expected {
        return Err(format!(
            "expected {expected} texel components for {extent}, got {}",
            texels.len()
        ));
    }

    let luminance: Vec<f32> = texels
        .chunks_exact(4)
        .map(|t| 0.299 * t[0] + 0.587 * t[1] + 0.114 * t[2])
        .collect();
    let heights = HeightField::from_raw(extent.width, extent.height, luminance)
        .ok_or_else(|| format!("height field does not fit {extent}"))?;
    let heights = if smoothing > 0.0 {
        image::imageops::blur(&heights, smoothing * MAX_SIGMA)
    } else {
        heights
    };

    let (w, h) = (extent.width, extent.height);
    let height = |x: u32, y: u32| heights.get_pixel(x % w, y % h).0[0];

    let mut normals = Vec::with_capacity(expected);
    for y in 0..h {
        for x in 0..w {
            let dx = (height(x + 1, y) - height(x + w - 1, y)) * 0.5;
            let dy = (height(x, y + 1) - height(x, y + h - 1)) * 0.5;
            let n = Vec3::new(-dx * intensity, -dy * intensity, 1.0).normalize() * 0.5 + 0.5;
            normals.extend_from_slice(&[n.x, n.y, n.z, 1.0]);
        }
    }
    Ok(normals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, TextureFormat};
    use crate::config::GraphConfig;
    use crate::error::BackendError;
    use crate::stages::ConstantGenerator;

    fn float_graph(backend: &CpuBackend) -> TextureGraph<'_> {
        TextureGraph::with_config(backend, GraphConfig::new().format(TextureFormat::Rgba32Float))
    }

    #[test]
    fn flat_input_points_straight_up() {
        let backend = CpuBackend::new();
        let mut graph = float_graph(&backend);
        let source = graph.add(ConstantGenerator::from_color([0.4, 0.4, 0.4, 1.0]).with_size(4, 4));
        let normals = graph.add(NormalMapModifier::new());
        graph.attach(normals, source).unwrap();

        let texels = graph.read_texels(normals).unwrap().unwrap();
        assert!(texels.chunks(4).all(|t| t == [0.5, 0.5, 1.0, 1.0]));
    }

    #[test]
    fn ramp_tilts_against_the_slope() {
        let extent = Extent::new(4, 1);
        let texels: Vec<f32> = (0..4)
            .flat_map(|x| {
                let v = x as f32 / 4.0;
                [v, v, v, 1.0]
            })
            .collect();

        let normals = derive_normals(extent, &texels, 1.0, 0.0).unwrap();
        let interior = &normals[4..8];
        assert!(interior[0] < 0.5);
        assert!((interior[1] - 0.5).abs() < 1e-6);

        let steeper = derive_normals(extent, &texels, 4.0, 0.0).unwrap();
        assert!(steeper[4] < interior[0]);
    }

    #[test]
    fn smoothing_keeps_flat_input_flat() {
        let extent = Extent::new(8, 8);
        let texels = vec![0.5; component_count(extent)];
        let normals = derive_normals(extent, &texels, 1.0, 1.0).unwrap();
        assert!(normals.chunks(4).all(|t| (t[2] - 1.0).abs() < 1e-4));
    }

    #[test]
    fn mismatched_texels_are_rejected() {
        assert!(derive_normals(Extent::new(4, 4), &[0.0; 12], 1.0, 0.0).is_err());
    }

    #[test]
    fn smoothing_is_clamped() {
        let mut normals = NormalMapModifier::new();
        normals.set_smoothing(3.0);
        assert_eq!(normals.smoothing(), 1.0);
        normals
            .set_control("smoothing", ControlValue::Float(-1.0))
            .unwrap();
        assert_eq!(normals.controls()["smoothing"], ControlValue::Float(0.0));
    }

    #[test]
    fn upstream_fault_leaves_both_dirty() {
        let backend = CpuBackend::new();
        let mut graph = float_graph(&backend);
        let source = graph.add(ConstantGenerator::new().with_size(4, 4));
        let normals = graph.add(NormalMapModifier::new());
        graph.attach(normals, source).unwrap();

        backend.fail_dispatch("constantGenerator");
        let err = graph.texture(normals).unwrap_err();
        assert!(matches!(err, GraphError::Backend(BackendError::Dispatch { .. })));
        assert!(graph.is_dirty(source).unwrap());
        assert!(graph.is_dirty(normals).unwrap());
        assert_eq!(backend.stats().dispatches, 0);
    }

    #[test]
    fn failed_conversion_publishes_nothing() {
        let backend = CpuBackend::new();
        let mut graph = float_graph(&backend);
        let source = graph.add(ConstantGenerator::new().with_size(4, 4));
        let normals = graph.add_after(NormalMapModifier::new(), source).unwrap();

        backend.truncate_readbacks(true);
        let err = graph.texture(normals).unwrap_err();
        assert!(matches!(err, GraphError::Derive { stage: "normalMap", .. }));
        assert!(graph.is_dirty(normals).unwrap());
        assert!(!graph.is_dirty(source).unwrap());
        assert_eq!(graph.revision(normals).unwrap(), 0);

        backend.clear_faults();
        let texels = graph.read_texels(normals).unwrap().unwrap();
        assert!(texels.chunks(4).all(|t| t == [0.5, 0.5, 1.0, 1.0]));
        assert!(!graph.is_dirty(normals).unwrap());
        assert_eq!(graph.revision(normals).unwrap(), 1);
    }

    #[test]
    fn failed_upload_leaves_the_stage_dirty() {
        let backend = CpuBackend::new();
        let mut graph = float_graph(&backend);
        let source = graph.add(ConstantGenerator::new().with_size(4, 4));
        let normals = graph.add_after(NormalMapModifier::new(), source).unwrap();

        backend.fail_uploads(true);
        let err = graph.texture(normals).unwrap_err();
        assert!(matches!(err, GraphError::Backend(BackendError::Device(_))));
        assert!(graph.is_dirty(normals).unwrap());
        assert_eq!(graph.revision(normals).unwrap(), 0);

        backend.fail_uploads(false);
        assert!(graph.texture(normals).unwrap().is_some());
        assert!(!graph.is_dirty(normals).unwrap());
    }
}
