//! Detector handles built from the `model` section.

use crate::config::ComponentConfig;
use crate::error::{LaunchError, LaunchResult};
use crate::registry::Registry;
use rand::rngs::StdRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use toml::Table;

pub trait Detector: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &str;

    /// Initialize weights from the run's seeded generator.
    fn init_weights(&mut self, rng: &mut StdRng) -> LaunchResult<()>;

    fn set_classes(&mut self, classes: Vec<String>);

    fn classes(&self) -> &[String];

    /// Description recorded in the hand-off manifest.
    fn describe(&self) -> DetectorSummary;
}

/// Inputs to a detector builder.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSpec {
    pub model: ComponentConfig,
    pub train_cfg: Option<Table>,
    pub test_cfg: Option<Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub classes: Vec<String>,
    /// Seed the weights were initialized from.
    pub init_seed: Option<u64>,
    pub model: ComponentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_cfg: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cfg: Option<Table>,
}

/// A detector known only by its declaration. Weight initialization draws the
/// seed the trainer initializes the real network from.
#[derive(Debug, Clone)]
pub struct DeclaredDetector {
    spec: DetectorSpec,
    classes: Vec<String>,
    init_seed: Option<u64>,
}

impl DeclaredDetector {
    #[must_use]
    pub fn new(spec: DetectorSpec) -> Self {
        Self { spec, classes: Vec::new(), init_seed: None }
    }

    #[must_use]
    pub fn init_seed(&self) -> Option<u64> {
        self.init_seed
    }
}

impl Detector for DeclaredDetector {
    fn kind(&self) -> &str {
        &self.spec.model.kind
    }

    fn init_weights(&mut self, rng: &mut StdRng) -> LaunchResult<()> {
        self.init_seed = Some(rng.next_u64());
        Ok(())
    }

    fn set_classes(&mut self, classes: Vec<String>) {
        self.classes = classes;
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn describe(&self) -> DetectorSummary {
        DetectorSummary {
            kind: self.spec.model.kind.clone(),
            classes: self.classes.clone(),
            init_seed: self.init_seed,
            model: self.spec.model.clone(),
            train_cfg: self.spec.train_cfg.clone(),
            test_cfg: self.spec.test_cfg.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DetectorFactory {
    registry: Registry<DetectorSpec, LaunchResult<Box<dyn Detector>>>,
}

impl Default for DetectorFactory {
    fn default() -> Self {
        let mut registry: Registry<DetectorSpec, LaunchResult<Box<dyn Detector>>> = Registry::new();
        registry.set_fallback(|spec: &DetectorSpec| {
            Ok(Box::new(DeclaredDetector::new(spec.clone())) as Box<dyn Detector>)
        });
        Self { registry }
    }
}

impl DetectorFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(&DetectorSpec) -> LaunchResult<Box<dyn Detector>> + Send + Sync + 'static,
    {
        self.registry.register(kind, build);
        self
    }

    /// Build the detector. `train_cfg`/`test_cfg` may be given either at the
    /// top level or inside `model`, not both.
    pub fn build(
        &self,
        model: &ComponentConfig,
        train_cfg: Option<&Table>,
        test_cfg: Option<&Table>,
    ) -> LaunchResult<Box<dyn Detector>> {
        for (key, outer) in [("train_cfg", train_cfg), ("test_cfg", test_cfg)] {
            if outer.is_some() && model.args.contains_key(key) {
                return Err(LaunchError::Model(format!("{key} specified in both the outer field and the model field")));
            }
        }
        let spec = DetectorSpec { model: model.clone(), train_cfg: train_cfg.cloned(), test_cfg: test_cfg.cloned() };
        self.registry
            .build(&model.kind, &spec)
            .unwrap_or_else(|| Err(LaunchError::Model(format!("unknown detector type `{}`", model.kind))))
    }
}
