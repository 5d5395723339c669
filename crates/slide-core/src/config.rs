//! Centralized configuration for the Slide IPC substrate.
//!
//! Channel names are a stable contract with the renderer layer; changing any
//! of them breaks every attached window.

use std::path::PathBuf;
use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Slide";
    pub const APP_DIR_NAME: &'static str = "slide-code";
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
}

/// IPC channel names shared by the main process and every renderer.
pub struct ChannelConfig;

impl ChannelConfig {
    // RPC handshake and out-of-band interrupt
    pub const RPC_CONNECT: &'static str = "rpc:connect";
    pub const RPC_PORT: &'static str = "rpc:port";
    pub const RPC_INTERRUPT: &'static str = "rpc:interrupt";

    // Ref replication
    pub const REF_REGISTER: &'static str = "ipcref:register";
    pub const REF_UNREGISTER: &'static str = "ipcref:unregister";
    pub const REF_UPDATE: &'static str = "ipcref:update";
    pub const REF_GET: &'static str = "ipcref:get";
    pub const REF_SYNC: &'static str = "ipcref:sync";

    // Pub/sub bridge
    pub const PUBSUB_PUBLISH: &'static str = "PUBSUB_PUBLISH";
    pub const PUBSUB_RENDERER_SUBSCRIBE: &'static str = "PUBSUB_RENDERER_SUBSCRIBE";

    /// Per-ref push channel, `ipcref:sync:{refId}`.
    pub fn ref_sync_channel(ref_id: &str) -> String {
        format!("{}:{}", Self::REF_SYNC, ref_id)
    }
}

/// Persistence store configuration.
pub struct StoreConfig;

impl StoreConfig {
    /// Prefix of the default persist key, `<prefix>-<refId>`.
    pub const DEFAULT_KEY_PREFIX: &'static str = "ipcref";
    pub const STORE_FILE_NAME: &'static str = "slide-store.json";
    pub const LOCK_FILE_EXTENSION: &'static str = "lock";

    /// Default on-disk store location under the platform data directory.
    pub fn default_store_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| {
            dir.join(AppConfig::APP_DIR_NAME)
                .join(Self::STORE_FILE_NAME)
        })
    }
}

/// RPC transport configuration.
///
/// No request timeout and no pending-request bound: a handler holds
/// its request open until it exits, the client interrupts, or
/// the connection is torn down.
pub struct RpcConfig;

impl RpcConfig {
    /// At most one unacknowledged chunk is in flight per streaming request.
    pub const SUPPORTS_ACK: bool = true;
    /// Maximum size of one socket bridge frame.
    pub const MAX_IPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    /// Maximum simultaneously bridged renderer connections.
    pub const MAX_IPC_CONNECTIONS: usize = 32;
    /// Only bounds establishing the socket, never a request.
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Project watcher configuration.
pub struct WatchConfig;

impl WatchConfig {
    /// Directory names skipped when listing or watching a project.
    pub const IGNORED_DIRS: &'static [&'static str] =
        &[".git", "node_modules", "target", ".next", "dist", ".turbo"];

    pub fn is_ignored(name: &str) -> bool {
        Self::IGNORED_DIRS.contains(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_sync_channel() {
        assert_eq!(ChannelConfig::ref_sync_channel("counter"), "ipcref:sync:counter");
    }

    #[test]
    fn test_channel_names_are_unique() {
        let names = [
            ChannelConfig::RPC_CONNECT,
            ChannelConfig::RPC_PORT,
            ChannelConfig::RPC_INTERRUPT,
            ChannelConfig::REF_REGISTER,
            ChannelConfig::REF_UNREGISTER,
            ChannelConfig::REF_UPDATE,
            ChannelConfig::REF_GET,
            ChannelConfig::REF_SYNC,
            ChannelConfig::PUBSUB_PUBLISH,
            ChannelConfig::PUBSUB_RENDERER_SUBSCRIBE,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_ignored_dirs() {
        assert!(WatchConfig::is_ignored("node_modules"));
        assert!(!WatchConfig::is_ignored("src"));
    }
}
