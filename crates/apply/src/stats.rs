//! Per-cycle event counters.

use std::collections::BTreeMap;
use std::fmt;

use crate::event::{OpStatus, Operation, WaitStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub apply: BTreeMap<OpStatus, u64>,
    pub prune: BTreeMap<OpStatus, u64>,
    pub delete: BTreeMap<OpStatus, u64>,
    pub wait: BTreeMap<WaitStatus, u64>,
    pub errors: u64,
}

impl SyncStats {
    pub fn new() -> Self { Self::default() }

    pub fn add_actuation(&mut self, op: Operation, status: OpStatus) {
        let map = match op {
            Operation::Apply => &mut self.apply,
            Operation::Prune => &mut self.prune,
            Operation::Delete => &mut self.delete,
        };
        *map.entry(status).or_insert(0) += 1;
    }

    pub fn add_wait(&mut self, status: WaitStatus) { *self.wait.entry(status).or_insert(0) += 1; }

    pub fn add_error(&mut self) { self.errors += 1; }

    pub fn actuation(&self, op: Operation, status: OpStatus) -> u64 {
        let map = match op {
            Operation::Apply => &self.apply,
            Operation::Prune => &self.prune,
            Operation::Delete => &self.delete,
        };
        map.get(&status).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.prune.is_empty() && self.delete.is_empty() && self.wait.is_empty() && self.errors == 0
    }
}

fn section<K: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, map: &BTreeMap<K, u64>, first: &mut bool) -> fmt::Result {
    if map.is_empty() { return Ok(()); }
    let total: u64 = map.values().sum();
    if !*first { f.write_str("; ")?; }
    *first = false;
    write!(f, "{name}: {total} (")?;
    for (i, (k, v)) in map.iter().enumerate() {
        if i > 0 { f.write_str(", ")?; }
        write!(f, "{v} {k}")?;
    }
    f.write_str(")")
}

/// `apply: 3 (2 successful, 1 failed); wait: 2 (2 successful)`
impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() { return f.write_str("no events"); }
        let mut first = true;
        section(f, "apply", &self.apply, &mut first)?;
        section(f, "prune", &self.prune, &mut first)?;
        section(f, "delete", &self.delete, &mut first)?;
        section(f, "wait", &self.wait, &mut first)?;
        if self.errors > 0 {
            if !first { f.write_str("; ")?; }
            write!(f, "errors: {}", self.errors)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_non_empty_sections() {
        let mut s = SyncStats::new();
        assert_eq!(s.to_string(), "no events");
        s.add_actuation(Operation::Apply, OpStatus::Successful);
        s.add_actuation(Operation::Apply, OpStatus::Successful);
        s.add_actuation(Operation::Apply, OpStatus::Failed);
        s.add_wait(WaitStatus::Timeout);
        assert_eq!(s.to_string(), "apply: 3 (2 successful, 1 failed); wait: 1 (1 timeout)");
        assert_eq!(s.actuation(Operation::Apply, OpStatus::Successful), 2);
        assert_eq!(s.actuation(Operation::Prune, OpStatus::Successful), 0);
    }
}
