//! AWS-oriented adapters and the agent action handler for certificate sessions.
//!
//! This crate owns runtime integration details (Lambda event decoding, the
//! DynamoDB stores and the HTTP collaborator clients) and drives the workflow
//! engine from `certification_core`.

pub mod adapters {
    pub mod dynamo;
    pub mod http;
}
pub mod config;
pub mod handlers {
    pub mod agent;
}
