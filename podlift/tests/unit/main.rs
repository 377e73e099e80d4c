//! Integration tests for podlift

mod test_dependencies;
mod test_fsm;
mod test_health;
mod test_pipeline;
mod test_rollback;
mod test_topology;
mod test_zero_downtime;
