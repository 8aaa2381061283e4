use std::collections::BTreeMap;

/// Writes buffered by a transaction until commit, grouped by kind then UID.
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    writes: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &str, uid: &str) -> Option<&Vec<u8>> {
        self.writes.get(kind).and_then(|records| records.get(uid))
    }

    pub fn put(&mut self, kind: &str, uid: &str, bytes: Vec<u8>) {
        self.writes
            .entry(kind.to_string())
            .or_default()
            .insert(uid.to_string(), bytes);
    }

    /// Overlay this transaction's writes on top of committed rows of `kind`.
    pub fn merge_scan<'a, I>(&self, kind: &str, committed: I) -> Vec<(String, Vec<u8>)>
    where
        I: IntoIterator<Item = (&'a String, &'a Vec<u8>)>,
    {
        let mut merged: BTreeMap<String, Vec<u8>> = committed
            .into_iter()
            .map(|(uid, bytes)| (uid.clone(), bytes.clone()))
            .collect();
        if let Some(pending) = self.writes.get(kind) {
            for (uid, bytes) in pending {
                merged.insert(uid.clone(), bytes.clone());
            }
        }
        merged.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, BTreeMap<String, Vec<u8>>> {
        self.writes
    }
}
