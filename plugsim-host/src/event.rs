use plugsim_types::{Operation, Record, Stage, Target};

/// One stage of one request being pushed through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginEvent {
    pub operation: Operation,
    pub stage: Stage,
    pub target: Target,
    /// Record state before the operation, when the engine has one.
    pub pre_image: Option<Record>,
    /// Record state after the operation. Only meaningful at PostOperation.
    pub post_image: Option<Record>,
}

impl PluginEvent {
    pub fn new(operation: Operation, stage: Stage, target: impl Into<Target>) -> Self {
        Self {
            operation,
            stage,
            target: target.into(),
            pre_image: None,
            post_image: None,
        }
    }

    #[must_use]
    pub fn with_pre_image(mut self, record: Record) -> Self {
        self.pre_image = Some(record);
        self
    }

    #[must_use]
    pub fn with_post_image(mut self, record: Record) -> Self {
        self.post_image = Some(record);
        self
    }
}
