pub mod session;
pub mod session_result;
pub mod snapshot;
pub mod student_test_override;
pub mod test_definition;
pub mod test_stats;
