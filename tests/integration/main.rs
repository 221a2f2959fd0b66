//! Integration test modules.

mod harness_mock;
mod history_test;
mod session_pipeline_test;
