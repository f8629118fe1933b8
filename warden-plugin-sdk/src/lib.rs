//! Guest SDK for building sandboxed Warden plugins.
//!
//! Plugin authors implement [`Plugin`] and hand it to [`serve_stdio`] (for
//! plugins launched as child processes) or [`serve`] (for any other byte
//! stream). The SDK signals readiness, dispatches lifecycle calls, and
//! gives the plugin a [`HostHandle`] for calling host capabilities and
//! emitting events.
//!
//! # Example
//!
//! ```no_run
//! use warden_plugin_sdk::prelude::*;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Plugin for Greeter {
//!     async fn handle_call(
//!         &self,
//!         host: &HostHandle,
//!         method: &str,
//!         args: Vec<Value>,
//!     ) -> Result<Value, String> {
//!         match method {
//!             "greet" => {
//!                 host.call("storage.set", vec![json!("greeted"), json!(true)])
//!                     .await
//!                     .map_err(|e| e.to_string())?;
//!                 Ok(json!(format!("hello, {}", args[0])))
//!             }
//!             _ => Err(format!("unknown method: {method}")),
//!         }
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), SdkError> {
//!     serve_stdio(Greeter).await
//! }
//! ```

mod error;
mod handle;
mod plugin;
mod serve;

pub use error::SdkError;
pub use handle::HostHandle;
pub use plugin::Plugin;
pub use serve::{serve, serve_stdio};

pub mod prelude {
    pub use crate::{HostHandle, Plugin, SdkError, serve, serve_stdio};
    pub use async_trait::async_trait;
    pub use serde_json::{Value, json};
}
