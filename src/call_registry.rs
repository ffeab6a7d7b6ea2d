//! CallRegistry: the ordered list of in-flight methods (spec §3).
//!
//! Invariants enforced by the Call Dispatcher that owns this registry:
//! (a) at most one non-overridden call per `devicePath`; (b) an entry is
//! removed exactly when its response message is emitted (spec §8
//! invariant 2).

#[derive(Debug, Clone)]
pub struct CallEntry {
    pub call_id: u32,
    pub device_path: Option<String>,
    pub method_name: String,
    pub overridden: bool,
}

#[derive(Default)]
pub struct CallRegistry {
    entries: Vec<CallEntry>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(&mut self, call_id: u32, device_path: Option<String>, method_name: impl Into<String>) {
        self.entries.push(CallEntry {
            call_id,
            device_path,
            method_name: method_name.into(),
            overridden: false,
        });
    }

    pub fn remove(&mut self, call_id: u32) {
        self.entries.retain(|e| e.call_id != call_id);
    }

    pub fn get(&self, call_id: u32) -> Option<&CallEntry> {
        self.entries.iter().find(|e| e.call_id == call_id)
    }

    pub fn is_overridden(&self, call_id: u32) -> bool {
        self.get(call_id).map(|e| e.overridden).unwrap_or(false)
    }

    /// Marks every other, not-yet-overridden entry on `device_path` as
    /// overridden (spec §4.5 "Preemption"). Returns the marked call ids so
    /// the caller can drive `device.override(...)` for each.
    pub fn mark_overridden_on_device(&mut self, device_path: &str, except_call_id: u32) -> Vec<u32> {
        let mut marked = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.call_id != except_call_id
                && !entry.overridden
                && entry.device_path.as_deref() == Some(device_path)
            {
                entry.overridden = true;
                marked.push(entry.call_id);
            }
        }
        marked
    }

    pub fn snapshot(&self) -> Vec<CallEntry> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_marks_other_entries_on_same_device_only() {
        let mut reg = CallRegistry::new();
        reg.register(10, Some("p1".into()), "getAddress");
        reg.register(11, Some("p1".into()), "signTransaction");
        reg.register(12, Some("p2".into()), "getFeatures");
        let marked = reg.mark_overridden_on_device("p1", 11);
        assert_eq!(marked, vec![10]);
        assert!(reg.is_overridden(10));
        assert!(!reg.is_overridden(11));
        assert!(!reg.is_overridden(12));
    }

    #[test]
    fn remove_drains_entry_for_id() {
        let mut reg = CallRegistry::new();
        reg.register(1, None, "getFeatures");
        reg.remove(1);
        assert!(reg.is_empty());
        assert!(reg.get(1).is_none());
    }
}
