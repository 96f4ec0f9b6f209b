use thiserror::Error;

use crate::cfg::InstId;

use super::Bailout;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EaError {
    #[error("the method has {nodes} instructions, over the budget of {budget}")]
    NodeBudget { nodes: usize, budget: usize },

    #[error("the analysis exhausted its budget of {0} steps")]
    StepBudget(usize),

    #[error("escape propagation did not converge within {0} iterations")]
    IterationLimit(usize),

    #[error("{0:?} was registered as a reduced merge twice")]
    DoubleRegistration(InstId),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl EaError {
    pub fn bailout(&self) -> Bailout {
        match self {
            Self::NodeBudget { .. } | Self::StepBudget(_) => Bailout::Budget,
            Self::IterationLimit(_) => Bailout::IterationLimit,
            Self::DoubleRegistration(_) | Self::Invariant(_) => Bailout::Invariant,
        }
    }
}
