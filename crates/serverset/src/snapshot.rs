//! Immutable views of a host set.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// The members of a host set at one point in time, ordered by when they
/// joined. Cheap to clone.
///
/// Two snapshots are equal when they hold the same members the same number
/// of times, regardless of order.
pub struct HostSnapshot<T> {
    hosts: Arc<[T]>,
}

impl<T> HostSnapshot<T> {
    pub fn new(hosts: Vec<T>) -> Self {
        Self {
            hosts: hosts.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn hosts(&self) -> &[T] {
        &self.hosts
    }
}

impl<T> Clone for HostSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            hosts: self.hosts.clone(),
        }
    }
}

impl<T> Default for HostSnapshot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for HostSnapshot<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.hosts
    }
}

impl<T> From<Vec<T>> for HostSnapshot<T> {
    fn from(hosts: Vec<T>) -> Self {
        Self::new(hosts)
    }
}

impl<T: fmt::Debug> fmt::Debug for HostSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hosts.iter()).finish()
    }
}

impl<T: Ord> PartialEq for HostSnapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.hosts, &other.hosts) {
            return true;
        }
        if self.hosts.len() != other.hosts.len() {
            return false;
        }
        let mut mine: Vec<&T> = self.hosts.iter().collect();
        let mut theirs: Vec<&T> = other.hosts.iter().collect();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}

impl<T: Ord> Eq for HostSnapshot<T> {}
