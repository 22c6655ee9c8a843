//! Background reconciliation loops. Each one ticks on its own interval and
//! stops when the shared shutdown channel flips to `true`.

pub mod provider_callback_sweep;
pub mod retry_sweep;
pub mod status_check;
pub mod webhook_retry;

pub use provider_callback_sweep::{ProviderCallbackSweepConfig, ProviderCallbackSweepWorker};
pub use retry_sweep::{RetrySweepConfig, RetrySweepWorker};
pub use status_check::{StatusCheckConfig, StatusCheckWorker};
pub use webhook_retry::{WebhookRetryConfig, WebhookRetryWorker};
