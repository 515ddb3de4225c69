pub mod cleanup_service;
pub mod grading_service;
pub mod navigator_service;
pub mod realtime_service;
pub mod sandbox_service;
pub mod session_service;
pub mod snapshot_service;
pub mod timer_service;
