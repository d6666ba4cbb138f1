//! Staged training curriculum for the normalizing-flow sub-module.
//!
//! The flow (`post_flow`) joins training only after the backbone has had
//! `2 * warmup_steps` steps to settle. Its first `warmup_steps / 4` steps run
//! with the backbone and the style embedding frozen, because early flow updates
//! produce loss spikes that would otherwise leak into converged weights.

/// Where the run currently is with respect to the flow sub-module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    /// The flow is not run; backbone-only training.
    NotStarted,
    /// The flow is run and only its parameters are trainable.
    FrozenStage,
    /// The flow and the backbone are trained jointly.
    JointStage,
}

/// Parameter freezing action the trainer must apply before the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTransition {
    /// Nothing changes.
    None,
    /// Freeze model and style embedding, then unfreeze `post_flow` only.
    FreezeBackbone,
    /// Make the model trainable again (style embedding per its policy).
    UnfreezeBackbone,
}

/// Curriculum state machine driving [`FlowStage`] from the global step.
#[derive(Debug, Clone)]
pub struct FlowCurriculum {
    warmup_steps: usize,
    fine_tune: bool,
    stage: FlowStage,
}

impl FlowCurriculum {
    pub fn new(warmup_steps: usize, fine_tune: bool) -> Self {
        Self {
            warmup_steps,
            fine_tune,
            stage: FlowStage::NotStarted,
        }
    }

    /// Current stage
    pub fn stage(&self) -> FlowStage {
        self.stage
    }

    /// Last step at which the flow stays inactive.
    pub fn flow_start_step(&self) -> usize {
        self.warmup_steps * 2
    }

    /// Last step of the frozen-backbone stage.
    pub fn joint_start_step(&self) -> usize {
        self.flow_start_step() + self.warmup_steps / 4
    }

    /// Whether the flow runs at `step`.
    pub fn should_run_flow(&self, step: usize) -> bool {
        self.fine_tune || step > self.flow_start_step()
    }

    fn backbone_may_unfreeze(&self, step: usize) -> bool {
        step > self.joint_start_step()
    }

    /// Move the state machine to `step` and report the freezing action to apply.
    pub fn advance(&mut self, step: usize) -> StageTransition {
        if !self.should_run_flow(step) {
            return StageTransition::None;
        }
        if self.fine_tune {
            // Fine-tuning starts from a converged model, nothing to protect
            self.stage = FlowStage::JointStage;
            return StageTransition::None;
        }
        match self.stage {
            FlowStage::NotStarted if self.backbone_may_unfreeze(step) => {
                // Resumed past the protective window
                self.stage = FlowStage::JointStage;
                StageTransition::None
            }
            FlowStage::NotStarted => {
                self.stage = FlowStage::FrozenStage;
                StageTransition::FreezeBackbone
            }
            FlowStage::FrozenStage if self.backbone_may_unfreeze(step) => {
                self.stage = FlowStage::JointStage;
                StageTransition::UnfreezeBackbone
            }
            FlowStage::FrozenStage | FlowStage::JointStage => StageTransition::None,
        }
    }

    /// Whether the backbone loss terms may enter the composite loss.
    pub fn includes_backbone_losses(&self) -> bool {
        self.stage != FlowStage::FrozenStage
    }
}
