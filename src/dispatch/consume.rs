use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HandlerError;
use crate::envelope::Envelope;
use crate::store::{Record, Store, StoreExt, Tx};

/// Marker recording that a consumer applied an envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessedEnvelope {
    #[serde(rename = "UID")]
    pub uid: String,
    pub event_type_name: String,
    pub processed_at: DateTime<Utc>,
}

impl Record for ProcessedEnvelope {
    const KIND: &'static str = "ProcessedEnvelope";
}

/// Apply `f` for `envelope` at most once per store.
///
/// `f` runs in a transaction that also writes the [`ProcessedEnvelope`]
/// marker, so the mutation and the marker commit together. Returns
/// `Ok(false)` without calling `f` when the marker already exists.
pub fn consume_once<S, F>(store: &S, envelope: &Envelope, mut f: F) -> Result<bool, HandlerError>
where
    S: Store + ?Sized,
    F: FnMut(&mut Tx<'_>) -> Result<(), HandlerError>,
{
    let applied = store.transaction(|tx| -> Result<bool, HandlerError> {
        if tx.get::<ProcessedEnvelope>(&envelope.uid)?.is_some() {
            return Ok(false);
        }
        f(tx)?;
        tx.put(
            &envelope.uid,
            &ProcessedEnvelope {
                uid: envelope.uid.clone(),
                event_type_name: envelope.event_type_name.clone(),
                processed_at: Utc::now(),
            },
        )?;
        Ok(true)
    })?;

    if !applied {
        tracing::debug!(uid = %envelope.uid, "envelope already processed, skipping");
    }
    Ok(applied)
}
