//! Acoustic model trainer
//!
//! Drives the two-optimizer schedule: the backbone (acoustic model and
//! style embedding) trains from step 0; the normalizing flow joins after
//! `2 * warmup_steps`, first alone on a frozen backbone, then jointly.

use std::collections::BTreeMap;
use std::time::Instant;

use mlx_rs::{
    array,
    error::Exception,
    module::{FlattenedModuleParam, ModuleParameters},
    nn,
    ops::concatenate_axis,
    optimizers::{clip_grad_norm, Adam, Optimizer},
    transforms::eval,
    Array,
};
use tracing::{debug, info, warn};

use crate::audio::{CodecDecoder, FeatureExtractor};
use crate::error::{Error, Result};
use crate::models::{AcousticInput, AcousticModel, EmbeddingPolicy, StyleEmbedding, TrainGraph};

use super::checkpoint::{
    average_checkpoints, checkpoint_path, config_to_json, delete_old_checkpoints,
    load_embedding_function, load_module_weights, module_weights, most_recent_checkpoint,
    n_recent_checkpoint_paths, save_embedding_function, save_model_for_use, AdamMoments,
    Checkpoint, BEST_MODEL_FILE, EMBEDDING_FUNCTION_FILE,
};
use super::config::ToucanTrainingConfig;
use super::curriculum::{FlowCurriculum, FlowStage, StageTransition};
use super::dataset::{collate_and_pad, BatchSampler, TtsBatch, TtsCorpus};
use super::distributed::{Collective, DistributedContext, LocalCollective};
use super::losses::{composite_loss, LossAggregator, LossTerm, LossValues};
use super::lr_scheduler::{LRScheduler, ToucanWarmupScheduler};
use super::progress::{ExperimentTracker, ProgressPlotter};

/// Outcome of one optimization step
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Step counter before the update
    pub step: usize,
    pub losses: LossValues,
    pub stage: FlowStage,
    pub run_flow: bool,
    /// Whether the main optimizer applied an update
    pub main_updated: bool,
    /// Whether the flow optimizer applied an update
    pub flow_updated: bool,
    /// Pre-clipping norm of the main gradient group
    pub grad_norm: Option<f32>,
    /// Pre-clipping norm of the flow gradient group
    pub flow_grad_norm: Option<f32>,
}

/// Trainer for an acoustic model with a style embedding function and a flow.
pub struct ToucanTrainer<M: AcousticModel, S: StyleEmbedding, C: CodecDecoder> {
    config: ToucanTrainingConfig,
    graph: TrainGraph<M, S>,
    features: FeatureExtractor<C>,
    /// Backbone optimizer (acoustic model minus flow, plus trainable style)
    optimizer: Adam,
    flow_optimizer: Adam,
    scheduler: ToucanWarmupScheduler,
    flow_scheduler: ToucanWarmupScheduler,
    curriculum: FlowCurriculum,
    policy: EmbeddingPolicy,
    losses: LossAggregator,
    dist: DistributedContext,
    collective: Box<dyn Collective>,
    plotter: Option<Box<dyn ProgressPlotter<M>>>,
    tracker: Option<Box<dyn ExperimentTracker>>,
    step_counter: usize,
    epoch: usize,
    last_run_flow: bool,
}

impl<M: AcousticModel, S: StyleEmbedding, C: CodecDecoder> ToucanTrainer<M, S, C> {
    /// Create a trainer. Loads the pretrained style embedding when configured.
    pub fn new(
        config: ToucanTrainingConfig,
        model: M,
        style: S,
        features: FeatureExtractor<C>,
    ) -> Result<Self> {
        config.validate()?;

        let policy = EmbeddingPolicy::new(config.path_to_embed_model.is_some(), config.train_embed);
        let mut graph = TrainGraph::new(model, style);

        if let Some(path) = &config.path_to_embed_model {
            load_embedding_function(&mut graph.style, path)?;
            info!(path = %path.display(), trainable = policy.is_trainable(), "Loaded style embedding");
        }
        if !policy.is_trainable() {
            graph.style.freeze_parameters(true);
        }
        graph.training_mode(true, policy);

        let scheduler =
            ToucanWarmupScheduler::new(config.learning_rate, config.warmup_steps, config.steps);
        let flow_scheduler = ToucanWarmupScheduler::new(
            config.flow_learning_rate(),
            config.flow_warmup_steps(),
            config.steps,
        );

        Ok(Self {
            optimizer: Adam::new(config.learning_rate),
            flow_optimizer: Adam::new(config.flow_learning_rate()),
            scheduler,
            flow_scheduler,
            curriculum: FlowCurriculum::new(config.warmup_steps, config.fine_tune),
            policy,
            losses: LossAggregator::new(),
            dist: DistributedContext::single(),
            collective: Box::new(LocalCollective),
            plotter: None,
            tracker: None,
            step_counter: 0,
            epoch: 0,
            last_run_flow: false,
            config,
            graph,
            features,
        })
    }

    /// Run as one process of a distributed job
    pub fn with_distributed(mut self, dist: DistributedContext, collective: Box<dyn Collective>) -> Self {
        self.dist = dist;
        self.collective = collective;
        self
    }

    pub fn with_plotter(mut self, plotter: Box<dyn ProgressPlotter<M>>) -> Self {
        self.plotter = Some(plotter);
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn ExperimentTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &ToucanTrainingConfig {
        &self.config
    }

    pub fn graph(&self) -> &TrainGraph<M, S> {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TrainGraph<M, S> {
        &mut self.graph
    }

    pub fn into_graph(self) -> TrainGraph<M, S> {
        self.graph
    }

    pub fn step_counter(&self) -> usize {
        self.step_counter
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn stage(&self) -> FlowStage {
        self.curriculum.stage()
    }

    pub fn embedding_policy(&self) -> EmbeddingPolicy {
        self.policy
    }

    pub fn scheduler(&self) -> &ToucanWarmupScheduler {
        &self.scheduler
    }

    pub fn flow_scheduler(&self) -> &ToucanWarmupScheduler {
        &self.flow_scheduler
    }

    pub fn optimizer_state(&self) -> &AdamMoments {
        &self.optimizer.state
    }

    pub fn flow_optimizer_state(&self) -> &AdamMoments {
        &self.flow_optimizer.state
    }

    /// Loss values recorded since the last checkpoint
    pub fn loss_history(&self) -> &LossAggregator {
        &self.losses
    }

    /// Restore from `path_to_checkpoint`, or from the newest checkpoint in
    /// `save_directory` when resuming.
    ///
    /// Fine-tuning loads only the model weights; everything else restarts.
    /// Returns whether a checkpoint was loaded.
    pub fn restore(&mut self) -> Result<bool> {
        let path = if self.config.resume {
            most_recent_checkpoint(&self.config.save_directory)?
                .or_else(|| self.config.path_to_checkpoint.clone())
        } else {
            self.config.path_to_checkpoint.clone()
        };
        let Some(path) = path else {
            if self.config.resume {
                warn!(dir = %self.config.save_directory.display(), "No checkpoint to resume from, starting fresh");
            }
            return Ok(false);
        };

        let checkpoint = Checkpoint::load(&path)?;
        load_module_weights(&mut self.graph.net, &checkpoint.model)?;

        if self.config.fine_tune {
            info!(path = %path.display(), "Loaded weights for fine-tuning");
            return Ok(true);
        }

        self.optimizer.state = checkpoint.optimizer;
        self.flow_optimizer.state = checkpoint.flow_optimizer;
        self.scheduler = checkpoint.scheduler;
        self.flow_scheduler = checkpoint.flow_scheduler;
        self.step_counter = checkpoint.step_counter;
        self.optimizer.lr = array!(self.scheduler.get_lr());
        self.flow_optimizer.lr = array!(self.flow_scheduler.get_lr());

        info!(path = %path.display(), step = self.step_counter, "Resumed from checkpoint");
        Ok(true)
    }

    /// Train until the step counter passes `steps`.
    ///
    /// Termination is checked only at checkpoint boundaries, so the final
    /// checkpoint is always written.
    pub fn train(&mut self, corpus: &dyn TtsCorpus) -> Result<()> {
        if corpus.is_empty() {
            return Err(Error::dataset("training corpus is empty"));
        }
        if self.dist.is_coordinator() {
            std::fs::create_dir_all(&self.config.save_directory)?;
        }

        self.restore()?;

        if self.dist.is_distributed() && self.policy.is_trainable() {
            self.collective.barrier()?;
        }

        let steps_per_checkpoint = self.config.checkpoint_interval(corpus.len());
        let sampler = BatchSampler::new(corpus.len(), self.config.batch_size)
            .with_shard(self.dist.rank, self.dist.world_size)
            .with_shuffle(self.config.shuffle)
            .with_seed(self.config.seed);
        if sampler.num_batches() == 0 {
            return Err(Error::dataset(format!(
                "{} samples per process cannot fill one batch of {}",
                sampler.shard_len(),
                self.config.batch_size
            )));
        }

        info!(
            samples = corpus.len(),
            batch_size = self.config.batch_size,
            steps = self.config.steps,
            steps_per_checkpoint,
            rank = self.dist.rank,
            world_size = self.dist.world_size,
            "Starting training"
        );

        let start = Instant::now();
        loop {
            self.graph.training_mode(true, self.policy);

            self.epoch += 1;
            for indices in sampler.batches(self.epoch - 1) {
                let samples = indices
                    .iter()
                    .map(|&i| corpus.get(i))
                    .collect::<Result<Vec<_>>>()?;
                let batch = collate_and_pad(&samples)?;
                self.train_step(&batch)?;

                if self.step_counter % steps_per_checkpoint == 0 {
                    if self.dist.is_coordinator() {
                        self.checkpoint_cycle(corpus, start)?;
                    } else {
                        self.losses.drain_averages();
                    }
                    if self.dist.is_distributed() {
                        self.collective.barrier()?;
                    }
                    if self.step_counter > self.config.steps {
                        info!(step = self.step_counter, "Training complete");
                        return Ok(());
                    }
                    self.graph.training_mode(true, self.policy);
                }
            }
            debug!(epoch = self.epoch, "Epoch finished");
        }
    }

    /// Run one optimization step on a collated batch.
    pub fn train_step(&mut self, batch: &TtsBatch) -> Result<StepReport> {
        let step = self.step_counter;
        let gold_speech = self.features.gold_speech_batch(&batch.speech_codes)?;

        let run_flow = self.curriculum.should_run_flow(step);
        match self.curriculum.advance(step) {
            StageTransition::FreezeBackbone => {
                info!(step, "Flow starts, freezing the rest of the model");
                self.graph.freeze_backbone();
            }
            StageTransition::UnfreezeBackbone => {
                info!(step, "Joint training of flow and backbone");
                self.graph.unfreeze_backbone(self.policy);
            }
            StageTransition::None => {}
        }
        let include_backbone = self.curriculum.includes_backbone_losses();
        let run_regularization = self.regularization_due(step);

        let mut step_losses: Option<LossValues> = None;
        let (loss, gradients) = {
            let captured = &mut step_losses;
            let loss_fn = |graph: &mut TrainGraph<M, S>,
                           (gold_speech, batch): (&Array, &TtsBatch)|
             -> std::result::Result<Array, Exception> {
                let style = graph.style.embed(gold_speech, &batch.speech_lengths)?;
                let utterance_embedding =
                    concatenate_axis(&[&style, &batch.speaker_embeddings], -1)?;
                let input = AcousticInput {
                    text: &batch.text,
                    text_lengths: &batch.text_lengths,
                    gold_speech,
                    speech_lengths: &batch.speech_lengths,
                    gold_durations: &batch.durations,
                    gold_pitch: &batch.pitch,
                    gold_energy: &batch.energy,
                    utterance_embedding: &utterance_embedding,
                    lang_ids: &batch.lang_ids,
                    return_feats: false,
                    run_flow,
                };
                let losses = graph.net.forward_train(&input)?;
                let regularization = if run_regularization {
                    Some(graph.style.regularization_loss()?)
                } else {
                    None
                };
                let (total, values) =
                    composite_loss(&losses, regularization.as_ref(), include_backbone)?;
                *captured = Some(values);
                Ok(total)
            };

            let mut value_and_grad = nn::value_and_grad(loss_fn);
            value_and_grad(&mut self.graph, (&gold_speech, batch))
                .map_err(|e| Error::Message(format!("Gradient computation failed: {}", e)))?
        };
        eval([&loss]).map_err(|e| Error::Message(e.to_string()))?;
        let values = step_losses
            .ok_or_else(|| Error::Message("loss closure did not run".to_string()))?;

        let gradients = self.collective.average_gradients(gradients)?;
        let (flow_gradients, main_gradients): (FlattenedModuleParam, FlattenedModuleParam) =
            gradients
                .into_iter()
                .partition(|(key, _)| TrainGraph::<M, S>::is_flow_key(key));

        let max_grad_norm = self.config.max_grad_norm;

        let mut grad_norm = None;
        if !main_gradients.is_empty() {
            let (clipped, norm) = clip_gradients(&main_gradients, max_grad_norm)?;
            self.optimizer.lr = array!(self.scheduler.get_lr());
            self.optimizer
                .update(&mut self.graph, &clipped)
                .map_err(|e| Error::Message(format!("Optimizer update failed: {}", e)))?;
            grad_norm = Some(norm);
        }
        self.scheduler.step();

        // Flow gradients of a step where the flow did not run are discarded
        let mut flow_grad_norm = None;
        if run_flow {
            if !flow_gradients.is_empty() {
                let (clipped, norm) = clip_gradients(&flow_gradients, max_grad_norm)?;
                self.flow_optimizer.lr = array!(self.flow_scheduler.get_lr());
                self.flow_optimizer
                    .update(&mut self.graph, &clipped)
                    .map_err(|e| Error::Message(format!("Flow optimizer update failed: {}", e)))?;
                flow_grad_norm = Some(norm);
            }
            self.flow_scheduler.step();
        }

        let params: Vec<Array> = self
            .graph
            .trainable_parameters()
            .flatten()
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect();
        eval(params.iter()).map_err(|e| Error::Message(e.to_string()))?;
        let moments: Vec<&Array> = self
            .optimizer
            .state
            .values()
            .chain(self.flow_optimizer.state.values())
            .flat_map(|(m, v)| [m, v])
            .collect();
        eval(moments).map_err(|e| Error::Message(e.to_string()))?;

        if let Some(norm) = grad_norm.filter(|n| !n.is_finite()) {
            warn!(step, norm, "Non-finite gradient norm");
        }
        debug!(
            step,
            total = values.total,
            regression = values.regression,
            flow = values.get(LossTerm::Flow),
            run_flow,
            "Step"
        );

        self.losses.record_step(&values);
        self.step_counter += 1;
        self.last_run_flow = run_flow;

        Ok(StepReport {
            step,
            losses: values,
            stage: self.curriculum.stage(),
            run_flow,
            main_updated: grad_norm.is_some(),
            flow_updated: flow_grad_norm.is_some(),
            grad_norm,
            flow_grad_norm,
        })
    }

    /// Style regularization runs every `warmup / 4` steps before the flow
    /// phase, for a trainable GST embedding only.
    fn regularization_due(&self, step: usize) -> bool {
        let interval = (self.config.warmup_steps / 4).max(1);
        self.policy.is_trainable()
            && self.graph.style.use_gst()
            && step % interval == 0
            && step < self.curriculum.flow_start_step()
    }

    /// Utterance embedding of the first corpus item, used for progress plots
    pub fn default_embedding(&mut self, corpus: &dyn TtsCorpus) -> Result<Array> {
        let sample = corpus.get(0)?;
        let mel = self.features.codes_to_mel(&sample.speech_codes)?;
        let shape = mel.shape();
        let features = mel.reshape(&[1, shape[0], shape[1]])?;
        let lengths = Array::from_slice(&[sample.speech_length], &[1]);

        let style = self.graph.style.embed(&features, &lengths)?;
        let style = style.reshape(&[-1])?;
        Ok(concatenate_axis(&[&style, &sample.speaker_embedding], -1)?)
    }

    /// Save, report, plot and average; coordinator only.
    fn checkpoint_cycle(&mut self, corpus: &dyn TtsCorpus, start: Instant) -> Result<()> {
        self.graph.training_mode(false, self.policy);
        let save_dir = self.config.save_directory.clone();

        let default_emb = self.default_embedding(corpus)?;
        let checkpoint = Checkpoint {
            model: module_weights(&self.graph.net),
            optimizer: self.optimizer.state.clone(),
            flow_optimizer: self.flow_optimizer.state.clone(),
            step_counter: self.step_counter,
            scheduler: self.scheduler.clone(),
            flow_scheduler: self.flow_scheduler.clone(),
            default_emb: default_emb.clone(),
            config: config_to_json(self.graph.net.config())?,
        };
        let path = checkpoint_path(&save_dir, self.step_counter);
        checkpoint.save(&path)?;
        if self.policy.is_trainable() {
            save_embedding_function(&self.graph.style, save_dir.join(EMBEDDING_FUNCTION_FILE))?;
        }
        delete_old_checkpoints(&save_dir, self.config.keep_last_n_checkpoints)?;

        let averages = self.losses.drain_averages();
        info!(
            epoch = self.epoch,
            minutes = start.elapsed().as_secs_f64() / 60.0,
            reconstruction_loss = averages.get(&LossTerm::Regression).copied().unwrap_or_default(),
            steps = self.step_counter,
            "Checkpoint saved"
        );

        if let Some(tracker) = self.tracker.as_mut() {
            let mut metrics: BTreeMap<String, f32> = averages
                .iter()
                .map(|(term, value)| (term.name().to_string(), *value))
                .collect();
            metrics.insert("learning_rate".to_string(), self.scheduler.get_lr());
            tracker.log_metrics(self.step_counter, &metrics)?;
        }

        if let Some(plotter) = self.plotter.as_mut() {
            let plot = plotter.plot_progress(
                &mut self.graph.net,
                &default_emb,
                &save_dir,
                self.step_counter,
                &self.config.lang,
                self.last_run_flow,
            )?;
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.log_image(self.step_counter, "progress_plot", &plot)?;
            }
        }

        let recent = n_recent_checkpoint_paths(&save_dir, self.config.checkpoints_to_average)?;
        let averaged = average_checkpoints(&recent)?;
        save_model_for_use(&averaged, save_dir.join(BEST_MODEL_FILE))?;
        Ok(())
    }
}

/// Clip a gradient group to `max_norm`; returns owned gradients and the
/// norm before clipping.
fn clip_gradients(gradients: &FlattenedModuleParam, max_norm: f32) -> Result<(FlattenedModuleParam, f32)> {
    let (clipped, norm) = clip_grad_norm(gradients, max_norm)
        .map_err(|e| Error::Message(format!("Gradient clipping failed: {}", e)))?;
    let owned: FlattenedModuleParam = clipped
        .into_iter()
        .map(|(k, v)| (k, v.into_owned()))
        .collect();
    Ok((owned, norm))
}
