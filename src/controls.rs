//! Named stage parameters.
//!
//! Every stage publishes its persistable parameters through a static [`ControlTable`]:
//! a list of names, each with a getter and a setter over the stage's parameter struct.
//! The graph uses the table to list, write and restore parameters by name; the typed
//! setters on each stage remain the primary API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

/// A scalar parameter value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlValue {
    Int(i64),
    Float(f32),
    Bool(bool),
}

impl ControlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlValue::Int(_) => "int",
            ControlValue::Float(_) => "float",
            ControlValue::Bool(_) => "bool",
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match *self {
            ControlValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            ControlValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ControlValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f32> for ControlValue {
    fn from(value: f32) -> Self {
        ControlValue::Float(value)
    }
}

impl From<i64> for ControlValue {
    fn from(value: i64) -> Self {
        ControlValue::Int(value)
    }
}

impl From<bool> for ControlValue {
    fn from(value: bool) -> Self {
        ControlValue::Bool(value)
    }
}

/// A snapshot of a stage's parameters, keyed by control name.
pub type Controls = BTreeMap<String, ControlValue>;

/// One named parameter of `T`.
pub struct Control<T: 'static> {
    pub name: &'static str,
    pub get: fn(&T) -> ControlValue,
    pub set: fn(&mut T, ControlValue) -> GraphResult<()>,
}

/// The parameters a stage exposes by name.
pub struct ControlTable<T: 'static> {
    controls: &'static [Control<T>],
}

impl<T: 'static> ControlTable<T> {
    pub const fn new(controls: &'static [Control<T>]) -> Self {
        Self { controls }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.controls.iter().map(|c| c.name)
    }

    pub fn get(&self, target: &T, name: &str) -> Option<ControlValue> {
        self.find(name).map(|c| (c.get)(target))
    }

    /// Writes one control. `stage` names the owner in the error for unknown names.
    pub fn set(
        &self,
        target: &mut T,
        stage: &'static str,
        name: &str,
        value: ControlValue,
    ) -> GraphResult<()> {
        let control = self.find(name).ok_or_else(|| GraphError::UnknownControl {
            stage,
            name: name.to_string(),
        })?;
        (control.set)(target, value)
    }

    /// Reads every control into a snapshot.
    pub fn snapshot(&self, target: &T) -> Controls {
        self.controls
            .iter()
            .map(|c| (c.name.to_string(), (c.get)(target)))
            .collect()
    }

    fn find(&self, name: &str) -> Option<&Control<T>> {
        self.controls.iter().find(|c| c.name == name)
    }
}

/// Extracts a float for control `name`.
pub fn float(name: &str, value: ControlValue) -> GraphResult<f32> {
    value.as_float().ok_or_else(|| GraphError::ControlType {
        name: name.to_string(),
        expected: "float",
    })
}

/// Extracts an integer for control `name`.
pub fn int(name: &str, value: ControlValue) -> GraphResult<i64> {
    value.as_int().ok_or_else(|| GraphError::ControlType {
        name: name.to_string(),
        expected: "int",
    })
}

/// Extracts a bool for control `name`.
pub fn flag(name: &str, value: ControlValue) -> GraphResult<bool> {
    value.as_bool().ok_or_else(|| GraphError::ControlType {
        name: name.to_string(),
        expected: "bool",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Params {
        gain: f32,
        taps: i64,
        invert: bool,
    }

    static TABLE: ControlTable<Params> = ControlTable::new(&[
        Control {
            name: "gain",
            get: |p| p.gain.into(),
            set: |p, v| {
                p.gain = float("gain", v)?;
                Ok(())
            },
        },
        Control {
            name: "taps",
            get: |p| p.taps.into(),
            set: |p, v| {
                p.taps = int("taps", v)?;
                Ok(())
            },
        },
        Control {
            name: "invert",
            get: |p| p.invert.into(),
            set: |p, v| {
                p.invert = flag("invert", v)?;
                Ok(())
            },
        },
    ]);

    #[test]
    fn set_and_get_by_name() {
        let mut params = Params::default();
        TABLE
            .set(&mut params, "test", "gain", ControlValue::Float(2.5))
            .unwrap();
        assert_eq!(TABLE.get(&params, "gain"), Some(ControlValue::Float(2.5)));
        assert_eq!(TABLE.names().collect::<Vec<_>>(), ["gain", "taps", "invert"]);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut params = Params::default();
        let err = TABLE
            .set(&mut params, "test", "taps", ControlValue::Float(1.0))
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::ControlType {
                name: "taps".to_string(),
                expected: "int"
            }
        );
        assert_eq!(params.taps, 0);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let mut params = Params::default();
        let err = TABLE
            .set(&mut params, "test", "nope", ControlValue::Bool(true))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownControl { stage: "test", .. }));
    }

    #[test]
    fn snapshot_survives_json() {
        let params = Params {
            gain: 0.5,
            taps: 3,
            invert: true,
        };
        let snapshot = TABLE.snapshot(&params);
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: Controls = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
        assert_eq!(restored["taps"], ControlValue::Int(3));
    }
}
