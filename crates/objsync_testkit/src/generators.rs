//! Property-based test generators using proptest.
//!
//! Entities are drawn from a small pool so that random sequences keep
//! hitting the same entities in different states.

use objsync_engine::ResponseStatus;
use proptest::prelude::*;

/// Size of the entity pool used by the strategies.
pub const ENTITY_POOL: u32 = 16;

/// Size of the dependency pool used by the strategies.
pub const DEPENDENCY_POOL: u32 = 4;

/// One step applied to an engine under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    /// `synchronize_all` with the given entities.
    Synchronize(Vec<u32>),
    /// `cancel_all` with the given entities.
    Cancel(Vec<u32>),
    /// `next_request`, keeping the batch if one is produced.
    Schedule,
    /// Completes an outstanding batch. The index wraps around the number
    /// of outstanding batches.
    Complete {
        /// Which outstanding batch to complete.
        index: usize,
        /// Outcome to report.
        status: ResponseStatus,
    },
    /// Registers a dependency edge.
    AddDependency {
        /// Entity that waits.
        dependent: u32,
        /// What it waits on.
        dependency: u32,
    },
    /// Resolves a dependency, releasing every dependent.
    Release {
        /// The resolved dependency.
        dependency: u32,
    },
    /// Gives up on everything waiting on a dependency.
    Expire {
        /// The dependency that will never resolve.
        dependency: u32,
    },
    /// Toggles transcoder availability.
    SetAvailable(bool),
}

/// Strategy for entities from the shared pool.
pub fn entity_strategy() -> impl Strategy<Value = u32> {
    0..ENTITY_POOL
}

/// Strategy for dependencies from the shared pool.
pub fn dependency_strategy() -> impl Strategy<Value = u32> {
    0..DEPENDENCY_POOL
}

/// Strategy for response outcomes, weighted towards success.
pub fn status_strategy() -> impl Strategy<Value = ResponseStatus> {
    prop_oneof![
        4 => Just(ResponseStatus::Success),
        2 => Just(ResponseStatus::TransientFailure),
        1 => Just(ResponseStatus::PermanentFailure),
        1 => Just(ResponseStatus::Expired),
    ]
}

/// Strategy for a single engine step.
pub fn engine_op_strategy() -> impl Strategy<Value = EngineOp> {
    prop_oneof![
        4 => prop::collection::vec(entity_strategy(), 0..6).prop_map(EngineOp::Synchronize),
        1 => prop::collection::vec(entity_strategy(), 1..4).prop_map(EngineOp::Cancel),
        4 => Just(EngineOp::Schedule),
        4 => (any::<usize>(), status_strategy())
            .prop_map(|(index, status)| EngineOp::Complete { index, status }),
        1 => (entity_strategy(), dependency_strategy())
            .prop_map(|(dependent, dependency)| EngineOp::AddDependency { dependent, dependency }),
        1 => dependency_strategy().prop_map(|dependency| EngineOp::Release { dependency }),
        1 => dependency_strategy().prop_map(|dependency| EngineOp::Expire { dependency }),
        1 => any::<bool>().prop_map(EngineOp::SetAvailable),
    ]
}

/// Strategy for a sequence of engine steps.
pub fn engine_ops_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<EngineOp>> {
    prop::collection::vec(engine_op_strategy(), min_ops..max_ops)
}

/// Strategy for fetch limits, including the clamped value 0.
pub fn fetch_limit_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(0usize), Just(1usize), 2usize..6]
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn entities_stay_in_pool(op in engine_op_strategy()) {
            match op {
                EngineOp::Synchronize(ids) | EngineOp::Cancel(ids) => {
                    prop_assert!(ids.iter().all(|id| *id < ENTITY_POOL));
                }
                EngineOp::AddDependency { dependent, dependency } => {
                    prop_assert!(dependent < ENTITY_POOL);
                    prop_assert!(dependency < DEPENDENCY_POOL);
                }
                EngineOp::Release { dependency } | EngineOp::Expire { dependency } => {
                    prop_assert!(dependency < DEPENDENCY_POOL);
                }
                _ => {}
            }
        }

        #[test]
        fn sequences_respect_bounds(ops in engine_ops_strategy(2, 10)) {
            prop_assert!(ops.len() >= 2 && ops.len() < 10);
        }
    }
}
