//! Checkpoint files: save/restore, retention, discovery and weight averaging
//!
//! A checkpoint is a single safetensors file `checkpoint_{step}.safetensors`.
//! Tensors are namespaced by field:
//!
//! - `model.*`: acoustic model weights
//! - `optimizer.{key}.exp_avg` / `optimizer.{key}.exp_avg_sq`: main Adam moments
//! - `flow_optimizer.{key}.exp_avg` / `.exp_avg_sq`: flow Adam moments
//! - `default_emb`: utterance embedding used for progress plots
//!
//! String metadata carries `step_counter`, `scheduler` and `flow_scheduler`
//! (JSON) and the model `config` (JSON).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlx_rs::{array, module::ModuleParameters, Array};
use safetensors::SafeTensors;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::lr_scheduler::ToucanWarmupScheduler;
use crate::error::{Error, Result};

pub const CHECKPOINT_PREFIX: &str = "checkpoint_";
pub const CHECKPOINT_EXTENSION: &str = "safetensors";
pub const EMBEDDING_FUNCTION_FILE: &str = "embedding_function.safetensors";
pub const BEST_MODEL_FILE: &str = "best.safetensors";

const MODEL_NAMESPACE: &str = "model.";
const OPTIMIZER_NAMESPACE: &str = "optimizer.";
const FLOW_OPTIMIZER_NAMESPACE: &str = "flow_optimizer.";
const DEFAULT_EMB_KEY: &str = "default_emb";
const STYLE_EMB_NAMESPACE: &str = "style_emb_func.";
const EXP_AVG_SUFFIX: &str = ".exp_avg";
const EXP_AVG_SQ_SUFFIX: &str = ".exp_avg_sq";

/// Adam first and second moments keyed by parameter
pub type AdamMoments = HashMap<Rc<str>, (Array, Array)>;

/// Everything needed to resume a training run
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model: HashMap<String, Array>,
    pub optimizer: AdamMoments,
    pub flow_optimizer: AdamMoments,
    pub step_counter: usize,
    pub scheduler: ToucanWarmupScheduler,
    pub flow_scheduler: ToucanWarmupScheduler,
    pub default_emb: Array,
    pub config: serde_json::Value,
}

impl Checkpoint {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors: HashMap<String, Array> = prefixed(MODEL_NAMESPACE, &self.model);
        tensors.extend(moments_to_tensors(OPTIMIZER_NAMESPACE, &self.optimizer));
        tensors.extend(moments_to_tensors(FLOW_OPTIMIZER_NAMESPACE, &self.flow_optimizer));
        tensors.insert(DEFAULT_EMB_KEY.to_string(), self.default_emb.clone());

        let mut metadata = HashMap::new();
        metadata.insert("step_counter".to_string(), self.step_counter.to_string());
        metadata.insert("scheduler".to_string(), serde_json::to_string(&self.scheduler)?);
        metadata.insert("flow_scheduler".to_string(), serde_json::to_string(&self.flow_scheduler)?);
        metadata.insert("config".to_string(), serde_json::to_string(&self.config)?);

        write_tensors(&tensors, &metadata, path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (tensors, metadata) = read_tensors(path)?;

        let step_counter = required(&metadata, "step_counter", path)?
            .parse()
            .map_err(|_| Error::checkpoint(format!("{}: step_counter is not an integer", path.display())))?;
        let scheduler = serde_json::from_str(required(&metadata, "scheduler", path)?)?;
        let flow_scheduler = serde_json::from_str(required(&metadata, "flow_scheduler", path)?)?;
        let config = serde_json::from_str(required(&metadata, "config", path)?)?;

        let default_emb = tensors
            .get(DEFAULT_EMB_KEY)
            .cloned()
            .ok_or_else(|| Error::weight_not_found(DEFAULT_EMB_KEY))?;

        Ok(Self {
            model: strip_namespace(MODEL_NAMESPACE, &tensors),
            optimizer: tensors_to_moments(OPTIMIZER_NAMESPACE, &tensors)?,
            flow_optimizer: tensors_to_moments(FLOW_OPTIMIZER_NAMESPACE, &tensors)?,
            step_counter,
            scheduler,
            flow_scheduler,
            default_emb,
            config,
        })
    }

    /// Model configuration stored alongside the weights
    pub fn model_config<C: DeserializeOwned>(&self) -> Result<C> {
        Ok(serde_json::from_value(self.config.clone())?)
    }
}

/// Model weights, default embedding and config ready for inference
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub model: HashMap<String, Array>,
    pub default_emb: Array,
    pub config: serde_json::Value,
}

impl ModelArtifact {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = prefixed(MODEL_NAMESPACE, &self.model);
        tensors.insert(DEFAULT_EMB_KEY.to_string(), self.default_emb.clone());

        let mut metadata = HashMap::new();
        metadata.insert("config".to_string(), serde_json::to_string(&self.config)?);

        write_tensors(&tensors, &metadata, path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (tensors, metadata) = read_tensors(path)?;
        let config = serde_json::from_str(required(&metadata, "config", path)?)?;
        let default_emb = tensors
            .get(DEFAULT_EMB_KEY)
            .cloned()
            .ok_or_else(|| Error::weight_not_found(DEFAULT_EMB_KEY))?;

        Ok(Self {
            model: strip_namespace(MODEL_NAMESPACE, &tensors),
            default_emb,
            config,
        })
    }
}

/// All parameters (trainable or frozen) of a module, keyed by flattened name
pub fn module_weights<M: ModuleParameters>(module: &M) -> HashMap<String, Array> {
    module
        .parameters()
        .flatten()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Load weights into a module. Every parameter of the module must be present.
pub fn load_module_weights<M: ModuleParameters>(
    module: &mut M,
    weights: &HashMap<String, Array>,
) -> Result<()> {
    let expected: Vec<String> = module
        .parameters()
        .flatten()
        .keys()
        .map(|k| k.to_string())
        .collect();
    if let Some(missing) = expected.iter().find(|k| !weights.contains_key(k.as_str())) {
        return Err(Error::weight_not_found(missing.clone()));
    }

    let update: HashMap<Rc<str>, Array> = expected
        .iter()
        .filter_map(|k| weights.get(k).map(|v| (Rc::from(k.as_str()), v.clone())))
        .collect();
    module.update_flattened(update);
    Ok(())
}

/// Path of the checkpoint written at `step`
pub fn checkpoint_path(dir: impl AsRef<Path>, step: usize) -> PathBuf {
    dir.as_ref()
        .join(format!("{}{}.{}", CHECKPOINT_PREFIX, step, CHECKPOINT_EXTENSION))
}

/// Step number encoded in a checkpoint file name
pub fn checkpoint_step(path: impl AsRef<Path>) -> Option<usize> {
    let name = path.as_ref().file_name()?.to_str()?;
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Checkpoints in `dir` ordered by step, oldest first
pub fn list_checkpoints(dir: impl AsRef<Path>) -> Result<Vec<(usize, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter_map(|p| checkpoint_step(&p).map(|step| (step, p)))
        .collect();
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints)
}

/// Checkpoint with the highest step in `dir`
pub fn most_recent_checkpoint(dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    Ok(list_checkpoints(dir)?.pop().map(|(_, p)| p))
}

/// Up to `n` most recent checkpoints, newest first
pub fn n_recent_checkpoint_paths(dir: impl AsRef<Path>, n: usize) -> Result<Vec<PathBuf>> {
    Ok(list_checkpoints(dir)?
        .into_iter()
        .rev()
        .take(n)
        .map(|(_, p)| p)
        .collect())
}

/// Remove all but the `keep` most recent checkpoints; returns the removed paths
pub fn delete_old_checkpoints(dir: impl AsRef<Path>, keep: usize) -> Result<Vec<PathBuf>> {
    let checkpoints = list_checkpoints(dir)?;
    let excess = checkpoints.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);
    for (step, path) in checkpoints.into_iter().take(excess) {
        std::fs::remove_file(&path)?;
        debug!(step, path = %path.display(), "Removed old checkpoint");
        removed.push(path);
    }
    Ok(removed)
}

/// Element-wise mean of the model weights of several checkpoints.
///
/// The default embedding and config come from the first (most recent) path.
pub fn average_checkpoints(paths: &[PathBuf]) -> Result<ModelArtifact> {
    let (first, rest) = paths
        .split_first()
        .ok_or_else(|| Error::checkpoint("no checkpoints to average"))?;

    let newest = Checkpoint::load(first)?;
    let mut sums = newest.model;
    for path in rest {
        let checkpoint = Checkpoint::load(path)?;
        for (name, sum) in sums.iter_mut() {
            let weight = checkpoint.model.get(name).ok_or_else(|| {
                Error::checkpoint(format!("{} is missing weight {}", path.display(), name))
            })?;
            *sum = sum.add(weight)?;
        }
    }

    let model = if rest.is_empty() {
        sums
    } else {
        let n = array!(paths.len() as f32);
        sums.into_iter()
            .map(|(name, sum)| {
                let dtype = sum.dtype();
                Ok((name, sum.divide(&n)?.as_dtype(dtype)?))
            })
            .collect::<Result<HashMap<_, _>>>()?
    };

    info!(count = paths.len(), "Averaged checkpoints");
    Ok(ModelArtifact {
        model,
        default_emb: newest.default_emb,
        config: newest.config,
    })
}

/// Write the inference artifact
pub fn save_model_for_use(artifact: &ModelArtifact, path: impl AsRef<Path>) -> Result<()> {
    artifact.save(path.as_ref())?;
    info!(path = %path.as_ref().display(), "Saved model for use");
    Ok(())
}

/// Save the style embedding function under the `style_emb_func` namespace
pub fn save_embedding_function<M: ModuleParameters>(
    module: &M,
    path: impl AsRef<Path>,
) -> Result<()> {
    let tensors = prefixed(STYLE_EMB_NAMESPACE, &module_weights(module));
    write_tensors(&tensors, &HashMap::new(), path.as_ref())
}

/// Load pretrained style embedding weights saved by [`save_embedding_function`]
pub fn load_embedding_function<M: ModuleParameters>(
    module: &mut M,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    let (tensors, _) = read_tensors(path)?;
    let weights = strip_namespace(STYLE_EMB_NAMESPACE, &tensors);
    if weights.is_empty() {
        return Err(Error::checkpoint(format!(
            "{} has no style_emb_func weights",
            path.display()
        )));
    }
    load_module_weights(module, &weights)
}

/// Serialize a value to the JSON stored in checkpoint metadata
pub fn config_to_json<C: Serialize>(config: &C) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(config)?)
}

fn prefixed(namespace: &str, weights: &HashMap<String, Array>) -> HashMap<String, Array> {
    weights
        .iter()
        .map(|(k, v)| (format!("{}{}", namespace, k), v.clone()))
        .collect()
}

fn strip_namespace(namespace: &str, tensors: &HashMap<String, Array>) -> HashMap<String, Array> {
    tensors
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(namespace).map(|name| (name.to_string(), v.clone())))
        .collect()
}

fn moments_to_tensors(namespace: &str, moments: &AdamMoments) -> Vec<(String, Array)> {
    moments
        .iter()
        .flat_map(|(key, (m, v))| {
            [
                (format!("{}{}{}", namespace, key, EXP_AVG_SUFFIX), m.clone()),
                (format!("{}{}{}", namespace, key, EXP_AVG_SQ_SUFFIX), v.clone()),
            ]
        })
        .collect()
}

fn tensors_to_moments(namespace: &str, tensors: &HashMap<String, Array>) -> Result<AdamMoments> {
    let mut first = HashMap::new();
    let mut second = HashMap::new();
    for (name, tensor) in strip_namespace(namespace, tensors) {
        if let Some(key) = name.strip_suffix(EXP_AVG_SQ_SUFFIX) {
            second.insert(key.to_string(), tensor);
        } else if let Some(key) = name.strip_suffix(EXP_AVG_SUFFIX) {
            first.insert(key.to_string(), tensor);
        }
    }

    let mut moments = AdamMoments::new();
    for (key, m) in first {
        let v = second
            .remove(&key)
            .ok_or_else(|| Error::weight_not_found(format!("{}{}{}", namespace, key, EXP_AVG_SQ_SUFFIX)))?;
        moments.insert(Rc::from(key.as_str()), (m, v));
    }
    if let Some(key) = second.keys().next() {
        return Err(Error::weight_not_found(format!("{}{}{}", namespace, key, EXP_AVG_SUFFIX)));
    }
    Ok(moments)
}

fn required<'a>(metadata: &'a HashMap<String, String>, key: &str, path: &Path) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::checkpoint(format!("{} has no `{}` field", path.display(), key)))
}

fn write_tensors(
    tensors: &HashMap<String, Array>,
    metadata: &HashMap<String, String>,
    path: &Path,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let refs: HashMap<String, &Array> = tensors.iter().map(|(k, v)| (k.clone(), v)).collect();
    Array::save_safetensors(refs, Some(metadata), path)?;
    Ok(())
}

fn read_tensors(path: &Path) -> Result<(HashMap<String, Array>, HashMap<String, String>)> {
    let data = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&data)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let tensors = SafeTensors::deserialize(&data)?;
    let mut arrays = HashMap::new();
    for (name, tensor) in tensors.tensors() {
        let array = Array::try_from(tensor).map_err(|e| {
            Error::checkpoint(format!("failed to convert tensor {}: {:?}", name, e))
        })?;
        arrays.insert(name.to_string(), array);
    }
    Ok((arrays, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, step: usize) {
        std::fs::write(checkpoint_path(dir, step), b"").unwrap();
    }

    fn scheduler() -> ToucanWarmupScheduler {
        let mut s = ToucanWarmupScheduler::new(1e-3, 10, 100);
        s.set_step(7);
        s
    }

    fn sample_checkpoint(step: usize, weight: f32) -> Checkpoint {
        let mut model = HashMap::new();
        model.insert("encoder.weight".to_string(), Array::from_slice(&[weight, weight * 2.0], &[2]));
        model.insert("post_flow.bias".to_string(), Array::from_slice(&[weight], &[1]));

        let mut optimizer = AdamMoments::new();
        optimizer.insert(
            Rc::from("net.encoder.weight"),
            (Array::from_slice(&[0.1f32, 0.2], &[2]), Array::from_slice(&[0.01f32, 0.04], &[2])),
        );
        let mut flow_optimizer = AdamMoments::new();
        flow_optimizer.insert(
            Rc::from("net.post_flow.bias"),
            (Array::from_slice(&[0.3f32], &[1]), Array::from_slice(&[0.09f32], &[1])),
        );

        Checkpoint {
            model,
            optimizer,
            flow_optimizer,
            step_counter: step,
            scheduler: scheduler(),
            flow_scheduler: ToucanWarmupScheduler::new(8e-3, 2, 100),
            default_emb: Array::from_slice(&[0.5f32, -0.5, 1.0], &[3]),
            config: serde_json::json!({ "hidden": 4, "name": "tiny" }),
        }
    }

    #[test]
    fn test_checkpoint_step_parsing() {
        assert_eq!(checkpoint_step("out/checkpoint_1200.safetensors"), Some(1200));
        assert_eq!(checkpoint_step("checkpoint_0.safetensors"), Some(0));
        assert_eq!(checkpoint_step("best.safetensors"), None);
        assert_eq!(checkpoint_step("checkpoint_abc.safetensors"), None);
        assert_eq!(checkpoint_step("checkpoint_12.pt"), None);
        assert_eq!(checkpoint_step(checkpoint_path("dir", 42)), Some(42));
    }

    #[test]
    fn test_most_recent_uses_step_not_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for step in [900, 1000, 80] {
            touch(dir.path(), step);
        }
        std::fs::write(dir.path().join(BEST_MODEL_FILE), b"").unwrap();

        let latest = most_recent_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(checkpoint_step(&latest), Some(1000));

        let recent = n_recent_checkpoint_paths(dir.path(), 2).unwrap();
        let steps: Vec<_> = recent.iter().filter_map(checkpoint_step).collect();
        assert_eq!(steps, vec![1000, 900]);

        // n larger than available is capped
        assert_eq!(n_recent_checkpoint_paths(dir.path(), 10).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_directory_has_no_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        assert!(most_recent_checkpoint(dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        for step in 1..=8 {
            touch(dir.path(), step * 100);
        }
        let removed = delete_old_checkpoints(dir.path(), 5).unwrap();
        assert_eq!(removed.len(), 3);

        let remaining: Vec<usize> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(remaining, vec![400, 500, 600, 700, 800]);

        // Nothing more to delete
        assert!(delete_old_checkpoints(dir.path(), 5).unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 30);
        sample_checkpoint(30, 1.5).save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.step_counter, 30);
        assert_eq!(loaded.scheduler, scheduler());
        assert_eq!(loaded.flow_scheduler.peak_lr(), 8e-3);
        assert_eq!(loaded.config["name"], "tiny");
        assert_eq!(loaded.model["encoder.weight"].as_slice::<f32>(), &[1.5, 3.0]);
        assert_eq!(loaded.default_emb.as_slice::<f32>(), &[0.5, -0.5, 1.0]);

        let (m, v) = &loaded.optimizer["net.encoder.weight"];
        assert_eq!(m.as_slice::<f32>(), &[0.1, 0.2]);
        assert_eq!(v.as_slice::<f32>(), &[0.01, 0.04]);
        assert_eq!(loaded.optimizer.len(), 1);
        assert!(loaded.flow_optimizer.contains_key("net.post_flow.bias"));
        assert!(!loaded.optimizer.contains_key("net.post_flow.bias"));
    }

    #[test]
    fn test_missing_metadata_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("model.w".to_string(), array!([1.0f32]));
        write_tensors(&tensors, &HashMap::new(), &path).unwrap();

        assert!(matches!(Checkpoint::load(&path), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_average_single_checkpoint_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 10);
        let checkpoint = sample_checkpoint(10, 0.3);
        checkpoint.save(&path).unwrap();

        let averaged = average_checkpoints(&[path]).unwrap();
        assert_eq!(averaged.model.len(), checkpoint.model.len());
        for (name, weight) in &checkpoint.model {
            assert_eq!(averaged.model[name].as_slice::<f32>(), weight.as_slice::<f32>());
        }
        assert_eq!(averaged.default_emb.as_slice::<f32>(), checkpoint.default_emb.as_slice::<f32>());
        assert_eq!(averaged.config, checkpoint.config);
    }

    #[test]
    fn test_average_two_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let newer = checkpoint_path(dir.path(), 20);
        let older = checkpoint_path(dir.path(), 10);
        sample_checkpoint(20, 3.0).save(&newer).unwrap();
        sample_checkpoint(10, 1.0).save(&older).unwrap();

        let averaged = average_checkpoints(&[newer, older]).unwrap();
        assert_eq!(averaged.model["encoder.weight"].as_slice::<f32>(), &[2.0, 4.0]);
        assert_eq!(averaged.model["post_flow.bias"].as_slice::<f32>(), &[2.0]);
    }

    #[test]
    fn test_average_nothing_is_an_error() {
        assert!(average_checkpoints(&[]).is_err());
    }

    #[test]
    fn test_model_artifact_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BEST_MODEL_FILE);
        let checkpoint = sample_checkpoint(5, 2.0);
        let artifact = ModelArtifact {
            model: checkpoint.model.clone(),
            default_emb: checkpoint.default_emb.clone(),
            config: checkpoint.config.clone(),
        };
        save_model_for_use(&artifact, &path).unwrap();

        let loaded = ModelArtifact::load(&path).unwrap();
        assert_eq!(loaded.model.len(), 2);
        assert_eq!(loaded.config, artifact.config);
        // The artifact is not a resumable checkpoint
        assert!(Checkpoint::load(&path).is_err());
    }
}
