//! Target execution lifecycle
//!
//! Defines the operations a debug session must offer to flash an image,
//! park it on an entry breakpoint and later let it run.

use crate::Result;
use std::path::Path;

/// Debug session controlling one target
///
/// Implementations own the session exclusively. A session is ended with
/// [`TargetLifecycle::terminate_session`], which must be called on every
/// path once the session has been opened, so the probe is released before
/// the next one is opened.
#[allow(async_fn_in_trait)]
pub trait TargetLifecycle {
    /// Attach to the debug server
    async fn select_target(&mut self) -> Result<()>;

    /// Load symbols from `image`, download it and reset-halt the core
    async fn load_and_flash(&mut self, image: &Path) -> Result<()>;

    /// Insert a breakpoint at `symbol`
    async fn set_breakpoint(&mut self, symbol: &str) -> Result<()>;

    /// Remove all breakpoints
    async fn delete_breakpoints(&mut self) -> Result<()>;

    /// Let the core run
    async fn resume(&mut self) -> Result<()>;

    /// Close the session and release the probe
    async fn terminate_session(self) -> Result<()>;
}

/// Opens debug sessions
#[allow(async_fn_in_trait)]
pub trait TargetConnector {
    /// Session type handed out by this connector
    type Target: TargetLifecycle;

    /// Start a new session
    async fn connect(&self) -> Result<Self::Target>;
}

/// Flash `image` and run it up to `entry`.
///
/// The target is left running towards the breakpoint; it stops there until
/// [`release_from_entry`] is called.
pub async fn flash_to_entry<T: TargetLifecycle>(
    target: &mut T,
    image: &Path,
    entry: &str,
) -> Result<()> {
    tracing::info!("Flashing {}", image.display());
    target.select_target().await?;
    target.load_and_flash(image).await?;
    target.delete_breakpoints().await?;
    target.set_breakpoint(entry).await?;
    target.resume().await
}

/// Drop the entry breakpoint and let the benchmark run to completion
pub async fn release_from_entry<T: TargetLifecycle>(target: &mut T) -> Result<()> {
    target.delete_breakpoints().await?;
    target.resume().await
}
