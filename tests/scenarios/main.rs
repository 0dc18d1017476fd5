//! Scenario tests for the pipeline engine


mod barriers;
mod concurrency;
mod failure_handling;
mod retry_behavior;
mod success_chain;
