//! Transaction orchestration: routing, state machine, webhooks and the
//! provider callback intake.

pub mod callback;
pub mod provider_callback;
pub mod provider_router;
pub mod reference;
pub mod sku_fallback;
pub mod transaction_engine;
pub mod transaction_id;

pub use callback::{CallbackDispatcher, CallbackService};
pub use provider_callback::ProviderCallbackService;
pub use provider_router::{ProviderRouter, RouterConfig};
pub use transaction_engine::{EngineConfig, EngineError, TransactionEngine};
