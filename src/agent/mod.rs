pub mod factory;
pub mod model;
pub mod providers;

pub use factory::create_provider;
pub use model::{GenerationConfig, ModelProvider, ModelResponse, ProviderKind, ProviderMetadata};
pub use providers::MockProvider;
