use crate::models::{CompositeKey, ExtensionRecord};
use std::collections::HashMap;

/// Keep the last record seen for each composite key
///
/// The survivor takes the slot of the key's first appearance, so batch order
/// stays stable while later values win.
pub fn dedupe(records: Vec<ExtensionRecord>) -> Vec<ExtensionRecord> {
    let mut slots: HashMap<CompositeKey, usize> = HashMap::with_capacity(records.len());
    let mut kept: Vec<ExtensionRecord> = Vec::with_capacity(records.len());

    for record in records {
        match slots.get(&record.key()) {
            Some(&slot) => kept[slot] = record,
            None => {
                slots.insert(record.key(), kept.len());
                kept.push(record);
            },
        }
    }

    kept
}
