use crate::backend::{Extent, TextureFormat};

/// Settings shared by every stage in a [`TextureGraph`](crate::TextureGraph).
#[derive(Clone, Debug, PartialEq)]
pub struct GraphConfig {
    /// Size of generators without an explicit size, and of detached modifiers.
    pub default_size: Extent,
    /// Storage format of every stage output.
    pub format: TextureFormat,
    /// Prefix for backend resource labels.
    pub label: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_size: Extent::new(128, 128),
            format: TextureFormat::Rgba8Unorm,
            label: "proctex".to_string(),
        }
    }
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_size(mut self, width: u32, height: u32) -> Self {
        self.default_size = Extent::new(width, height);
        self
    }

    pub fn format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Label for a resource owned by `stage`, e.g. `proctex/roundModifier`.
    pub(crate) fn resource_label(&self, stage: &str) -> String {
        format!("{}/{}", self.label, stage)
    }
}
