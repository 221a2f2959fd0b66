//! Unit test modules.

mod link_state_test;
mod parser_test;
mod reassembly_test;
