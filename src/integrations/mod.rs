pub mod fs;
pub mod llm;
pub mod test_runner;

pub use fs::LocalFs;
pub use llm::{BudgetedLlm, GenerateRequest, Generation, LlmClient, LlmStatus, MockLlm};
pub use test_runner::{CommandTestRunner, TestReport, TestRunner};
