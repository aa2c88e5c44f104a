//! Certification session workflow domain primitives.
//!
//! This crate owns the step state machine that takes a citizen from consent to
//! issued property certificates, the session and quota persistence contracts,
//! and the validators that front the external collaborators. It intentionally
//! excludes AWS SDK and Lambda runtime concerns; those live in
//! `certification_lambda`.

pub mod certificate;
pub mod clock;
pub mod contract;
pub mod error;
pub mod identity;
pub mod otp;
pub mod policy;
pub mod property;
pub mod quota;
pub mod retry;
pub mod session;
pub mod state;
pub mod storage_keys;
pub mod store;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod workflow;
