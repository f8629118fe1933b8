//! Wire protocol spoken between the Warden host and sandboxed plugins.
//!
//! Every message crossing the isolation boundary is an [`Envelope`], framed
//! with a 4-byte big-endian length prefix followed by a UTF-8 JSON body.
//!
//! ```text
//! host                                 plugin
//!  |  ------ call {id, method, args} ----> |
//!  |  <----- response {id, result|error} - |
//!  |  <----- call {id, method, args} ----- |   (capability request)
//!  |  ------ response {id, ...} ---------> |
//!  |  <----- event {event, data} --------- |
//!  |  <----- ready ----------------------- |   (once, after bootstrap)
//! ```

pub mod codec;
pub mod envelope;
pub mod ids;

pub use codec::{MAX_FRAME_SIZE, read_envelope, write_envelope};
pub use envelope::{Envelope, response_outcome};
pub use ids::CallId;

/// Protocol version advertised to launched plugins.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lifecycle methods the host invokes on every plugin.
pub mod lifecycle {
    /// `initialize(config, permissions)`
    pub const INITIALIZE: &str = "initialize";
    pub const ACTIVATE: &str = "activate";
    pub const DEACTIVATE: &str = "deactivate";
    /// `updateConfig(config)`
    pub const UPDATE_CONFIG: &str = "updateConfig";
    pub const CLEANUP: &str = "cleanup";
}

/// Environment variables set for plugins launched in a child process.
pub mod env {
    pub const PLUGIN_ID: &str = "WARDEN_PLUGIN_ID";
    /// `ui` or `background`.
    pub const SANDBOX_KIND: &str = "WARDEN_SANDBOX_KIND";
    pub const PROTOCOL_VERSION: &str = "WARDEN_PROTOCOL_VERSION";
    /// JSON-encoded content policy, only set for UI-capable sandboxes.
    pub const CONTENT_POLICY: &str = "WARDEN_CONTENT_POLICY";
}
