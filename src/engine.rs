//! The build seam: targets, requests, and the engine contract.
//!
//! The CAD pipeline proper is an external collaborator behind
//! [`BuildEngine`]; the gateway treats its output as opaque JSON.
//! [`StagedEngine`] stands in for it with scripted phases so the server
//! runs end to end without a pipeline attached.

use std::time::Duration;

use serde_json::{Value, json};

use crate::cache::{BuildFailure, CancelToken};
use crate::params::{Fingerprint, ParameterSet};

/// Assemblies that can be visualized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assembly {
    WindTurbine,
    StatorMold,
    RotorMold,
    MagnetJig,
    CoilWinder,
    BladeTemplate,
}

impl Assembly {
    pub fn from_path(segment: &str) -> Option<Assembly> {
        match segment {
            "WindTurbine" => Some(Assembly::WindTurbine),
            "StatorMold" => Some(Assembly::StatorMold),
            "RotorMold" => Some(Assembly::RotorMold),
            "MagnetJig" => Some(Assembly::MagnetJig),
            "CoilWinder" => Some(Assembly::CoilWinder),
            "BladeTemplate" => Some(Assembly::BladeTemplate),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Assembly::WindTurbine => "WindTurbine",
            Assembly::StatorMold => "StatorMold",
            Assembly::RotorMold => "RotorMold",
            Assembly::MagnetJig => "MagnetJig",
            Assembly::CoilWinder => "CoilWinder",
            Assembly::BladeTemplate => "BladeTemplate",
        }
    }
}

/// The three build operations the gateway exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildTarget {
    Visualize(Assembly),
    CncOverview,
    DimensionTables,
}

impl BuildTarget {
    /// Stable textual form, used in the fingerprint and in log lines.
    pub fn canonical_name(&self) -> String {
        match self {
            BuildTarget::Visualize(assembly) => format!("visualize/{}", assembly.name()),
            BuildTarget::CncOverview => "cncOverview".to_owned(),
            BuildTarget::DimensionTables => "dimensionTables".to_owned(),
        }
    }
}

/// One fully-parsed build request: what to build, with which parameters.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub target: BuildTarget,
    pub params: ParameterSet,
}

impl BuildRequest {
    /// Order-independent digest of the request. The target is part of the
    /// fingerprint: the same parameters for a different assembly are a
    /// different build.
    pub fn fingerprint(&self) -> Fingerprint {
        let canonical = json!({
            "params": self.params,
            "target": self.target.canonical_name(),
        });
        Fingerprint::digest(&canonical.to_string())
    }
}

/// Contract for the CAD pipeline.
///
/// `report` is non-blocking and safe to call freely from the build thread.
/// Implementations must poll `cancel` between phases and return
/// [`BuildFailure::Cancelled`] promptly once it is set; the longest
/// uninterruptible phase bounds cancellation latency.
pub trait BuildEngine: Send + Sync + 'static {
    fn build(
        &self,
        request: &BuildRequest,
        report: &dyn Fn(&str, u8),
        cancel: &CancelToken,
    ) -> Result<Value, BuildFailure>;
}

/// Scripted stand-in engine: walks fixed progress stages with a pause
/// between them and returns canned results shaped like the real pipeline's
/// output.
pub struct StagedEngine {
    stage_pause: Duration,
}

impl StagedEngine {
    const STAGES: &'static [(u8, &'static str)] = &[
        (10, "Initializing engine"),
        (25, "Loading documents"),
        (40, "Processing geometry"),
        (60, "Building assemblies"),
        (80, "Computing outputs"),
    ];

    pub fn new(stage_pause: Duration) -> Self {
        StagedEngine { stage_pause }
    }
}

impl Default for StagedEngine {
    fn default() -> Self {
        StagedEngine::new(Duration::from_secs(2))
    }
}

impl BuildEngine for StagedEngine {
    fn build(
        &self,
        request: &BuildRequest,
        report: &dyn Fn(&str, u8),
        cancel: &CancelToken,
    ) -> Result<Value, BuildFailure> {
        for (percent, message) in Self::STAGES {
            std::thread::sleep(self.stage_pause);
            if cancel.is_set() {
                log::info!("staged build interrupted at {percent}%");
                return Err(BuildFailure::Cancelled);
            }
            report(message, *percent);
        }
        report("Build complete", 100);

        Ok(match request.target {
            BuildTarget::Visualize(assembly) => json!({
                "objText": format!("# staged {} model\n", assembly.name()),
                "furlTransform": if assembly == Assembly::WindTurbine {
                    json!([])
                } else {
                    Value::Null
                },
            }),
            BuildTarget::CncOverview => json!({
                "svg": "<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>",
            }),
            BuildTarget::DimensionTables => json!({
                "tables": [],
            }),
        })
    }
}
