use super::state::Step;

/// Failure inside a conversation turn.
///
/// `execution_trace` lists the steps executed before the failure, most recent last.
#[derive(Debug, Clone)]
pub struct ControllerError {
    pub step: Step,
    pub message: String,
    pub execution_trace: Vec<Step>,
}

impl ControllerError {
    pub fn new(step: Step, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            execution_trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: &[Step]) -> Self {
        self.execution_trace = trace.to_vec();
        self
    }
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.execution_trace.is_empty() {
            write!(f, "Turn failed in {}: {}", self.step, self.message)
        } else {
            let trace: Vec<&str> = self.execution_trace.iter().map(Step::as_str).collect();
            write!(
                f,
                "Turn failed in {} (trace: {}): {}",
                self.step,
                trace.join(" -> "),
                self.message
            )
        }
    }
}

impl std::error::Error for ControllerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_trace() {
        let err = ControllerError::new(Step::Rewrite, "timeout")
            .with_trace(&[Step::Classify, Step::Retrieve, Step::Grade]);
        assert_eq!(
            err.to_string(),
            "Turn failed in rewrite (trace: classify -> retrieve -> grade): timeout"
        );
    }
}
