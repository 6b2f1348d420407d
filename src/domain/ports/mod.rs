//! Port traits decoupling the core from infrastructure backends.

pub mod provider;

pub use provider::{
    BillingModel, ProtocolVariant, Provider, ProviderCapabilities, ProviderError, ProviderReply,
    TokenUsage,
};
