use std::sync::{Arc, Weak};

use super::{Outbox, TRIGGER_PATH_PREFIX};
use crate::queue::{DeliveryError, Task, TaskTarget};

/// Routes `/outbox/{uid}` tasks straight to [`Outbox::handle_trigger`].
///
/// Holds a weak reference, so a queue owning this target does not keep the
/// outbox alive.
pub struct OutboxCallback {
    outbox: Weak<Outbox>,
}

impl OutboxCallback {
    pub fn new(outbox: &Arc<Outbox>) -> Self {
        Self {
            outbox: Arc::downgrade(outbox),
        }
    }
}

/// UID addressed by a trigger path, if it is one.
pub(crate) fn trigger_uid(target_path: &str) -> Option<&str> {
    target_path
        .strip_prefix(TRIGGER_PATH_PREFIX)
        .filter(|uid| !uid.is_empty() && !uid.contains('/'))
}

impl TaskTarget for OutboxCallback {
    fn deliver(&self, task: &Task) -> Result<(), DeliveryError> {
        let uid = trigger_uid(&task.target_path)
            .ok_or_else(|| DeliveryError::rejected(&task.target_path, "not an outbox trigger"))?;
        let outbox = self
            .outbox
            .upgrade()
            .ok_or_else(|| DeliveryError::rejected(&task.target_path, "outbox shut down"))?;

        outbox
            .handle_trigger(uid)
            .map(|_| ())
            .map_err(|err| DeliveryError::rejected(&task.target_path, err))
    }
}
