use async_trait::async_trait;

/// What the channel needs from a video player.  Positions are whole seconds
/// from the start of the file.
///
/// Natural completion is not part of the trait: implementations post
/// `ChannelEvent::PlayerEnded` into the core loop when a file plays out,
/// tagged with the entry id `load` returned for that file.
#[async_trait]
pub trait Player: Send + Sync {
    /// Replace whatever is loaded with `source_ref`, starting at `start_secs`.
    /// Returns the player's id for the new entry, if it assigns one.
    async fn load(&self, source_ref: &str, start_secs: u64) -> anyhow::Result<Option<u64>>;
    async fn seek(&self, secs: u64) -> anyhow::Result<()>;
    async fn play(&self) -> anyhow::Result<()>;
    async fn pause(&self) -> anyhow::Result<()>;
    async fn set_fullscreen(&self, fullscreen: bool) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}
