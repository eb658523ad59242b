use crate::controls::{self, Control, ControlTable};
use crate::kernels::{STEP_MODIFIER, StepUniforms};
use crate::stages::{Modifier, StageKernel};

/// Thresholds the upstream's red channel: `high` above `boundary`, `low` otherwise.
///
/// The result is written to all three colour channels with opaque alpha.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Step {
    pub low: f32,
    pub high: f32,
    pub boundary: f32,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 1.0,
            boundary: 0.5,
        }
    }
}

pub type StepModifier = Modifier<Step>;

static STEP_CONTROLS: ControlTable<Step> = ControlTable::new(&[
    Control {
        name: "lowValue",
        get: |s| s.low.into(),
        set: |s, v| {
            s.low = controls::float("lowValue", v)?;
            Ok(())
        },
    },
    Control {
        name: "highValue",
        get: |s| s.high.into(),
        set: |s, v| {
            s.high = controls::float("highValue", v)?;
            Ok(())
        },
    },
    Control {
        name: "boundary",
        get: |s| s.boundary.into(),
        set: |s, v| {
            s.boundary = controls::float("boundary", v)?;
            Ok(())
        },
    },
]);

impl StageKernel for Step {
    const KERNEL: &'static str = STEP_MODIFIER;
    type Uniforms = StepUniforms;

    fn uniforms(&self) -> StepUniforms {
        StepUniforms {
            low: self.low,
            high: self.high,
            boundary: self.boundary,
            _padding: 0.0,
        }
    }

    fn controls() -> &'static ControlTable<Self> {
        &STEP_CONTROLS
    }
}

impl Modifier<Step> {
    pub fn with_levels(low: f32, high: f32, boundary: f32) -> Self {
        Self::with_params(Step {
            low,
            high,
            boundary,
        })
    }

    pub fn set_low(&mut self, low: f32) {
        self.params_mut().low = low;
    }

    pub fn set_high(&mut self, high: f32) {
        self.params_mut().high = high;
    }

    pub fn set_boundary(&mut self, boundary: f32) {
        self.params_mut().boundary = boundary;
    }
}
