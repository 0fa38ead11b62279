//! Fixtures for exercising client sessions without a real notary

pub mod notary;
pub mod signer;

pub use notary::{BoxReceiptGate, FakeNotary, Fault};
pub use signer::FakeSigner;
