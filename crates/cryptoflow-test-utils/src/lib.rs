//! Test doubles and fixtures shared by the cryptoflow crates.

pub mod fixtures;
mod mock_llm;
mod mock_tool;

pub use mock_llm::MockLlm;
pub use mock_tool::MockTool;
