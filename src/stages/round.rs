use crate::controls::{self, Control, ControlTable};
use crate::kernels::{ROUND_MODIFIER, RoundUniforms};
use crate::stages::{Modifier, StageKernel};

/// Rounds each colour channel to the nearest multiple of `round`. Alpha passes through.
///
/// A `round` of zero leaves the input unchanged.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Round {
    pub round: f32,
}

impl Default for Round {
    fn default() -> Self {
        Self { round: 1.0 }
    }
}

pub type RoundModifier = Modifier<Round>;

static ROUND_CONTROLS: ControlTable<Round> = ControlTable::new(&[Control {
    name: "round",
    get: |r| r.round.into(),
    set: |r, v| {
        r.round = controls::float("round", v)?;
        Ok(())
    },
}]);

impl StageKernel for Round {
    const KERNEL: &'static str = ROUND_MODIFIER;
    type Uniforms = RoundUniforms;

    fn uniforms(&self) -> RoundUniforms {
        RoundUniforms {
            round: self.round,
            _padding: [0.0; 3],
        }
    }

    fn controls() -> &'static ControlTable<Self> {
        &ROUND_CONTROLS
    }
}

impl Modifier<Round> {
    pub fn round(&self) -> f32 {
        self.params().round
    }

    pub fn set_round(&mut self, round: f32) {
        self.params_mut().round = round;
    }
}
