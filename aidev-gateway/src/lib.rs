//! AIDev AI Gateway
//!
//! Role-based routing, quota accounting and failover across interchangeable
//! AI completion providers.
//!
//! - [`ProviderRegistry`] holds every provider profile with its live quota and
//!   health state, one lock per profile.
//! - [`AiGateway`] turns a role plus a request into a completion by walking
//!   the registry's ordered candidates until one succeeds.
//! - [`OpenAiProvider`] talks to any OpenAI-compatible `/chat/completions`
//!   endpoint with streamed responses.
//!
//! # Example
//!
//! ```no_run
//! use aidev_core::domain::provider::Role;
//! use aidev_gateway::{AiGateway, InvokeRequest};
//!
//! # async fn example(gateway: AiGateway) -> aidev_gateway::Result<()> {
//! let response = gateway
//!     .invoke(Role::Planner, &InvokeRequest::new("Plan a fix for issue #42"))
//!     .await?;
//! println!("{} answered: {}", response.provider, response.text);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod failover;
mod gateway;
mod openai;
mod provider;
mod registry;
mod roles;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{GatewayError, ProviderError, RegistryError, Result};
pub use gateway::{AiGateway, Attempt, GatewayResponse};
pub use openai::OpenAiProvider;
pub use provider::{ChatMessage, Chunk, ChunkStream, CompletionProvider, CompletionRequest};
pub use registry::{HealthPolicy, ProviderRegistry, Reservation};
pub use roles::{InvokeRequest, RoleProfile};
