//! Repository event listeners
//!
//! Listeners observe successful lifecycle operations. They are notified
//! post-commit only: a listener error is logged and swallowed so one bad
//! listener can neither undo a persisted operation nor block the others.

use crate::item::{ItemMetadata, LibraryStatus};
use anyhow::Result;

/// Observer for committed lifecycle operations.
///
/// All callbacks default to no-ops; implementors override the events they
/// care about. Callbacks run on the operation's task after the change set
/// has been committed.
pub trait RepositoryListener: Send + Sync {
    fn on_publish(&self, _item: &ItemMetadata) -> Result<()> {
        Ok(())
    }

    fn on_lock(&self, _item: &ItemMetadata) -> Result<()> {
        Ok(())
    }

    fn on_unlock(&self, _item: &ItemMetadata, _committed_wip: bool) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _item: &ItemMetadata, _remarks: &str) -> Result<()> {
        Ok(())
    }

    fn on_promote(&self, _item: &ItemMetadata, _original_status: LibraryStatus) -> Result<()> {
        Ok(())
    }

    fn on_demote(&self, _item: &ItemMetadata, _original_status: LibraryStatus) -> Result<()> {
        Ok(())
    }

    fn on_update_status(&self, _item: &ItemMetadata, _original_status: LibraryStatus) -> Result<()> {
        Ok(())
    }

    fn on_recalculate_crc(&self, _item: &ItemMetadata) -> Result<()> {
        Ok(())
    }

    fn on_delete(&self, _item: &ItemMetadata) -> Result<()> {
        Ok(())
    }
}
