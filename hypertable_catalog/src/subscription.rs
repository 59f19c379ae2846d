use std::sync::{Arc, Weak};

use hashbrown::hash_map::Entry;

use crate::{Error, InvalidationListener, Result};

#[derive(Debug, Default)]
pub(crate) struct InvalidationSubscriptions {
    subscriptions: hashbrown::HashMap<Arc<str>, Weak<dyn InvalidationListener>>,
}

impl InvalidationSubscriptions {
    /// Subscribe `listener` to invalidation notifications under `name`.
    ///
    /// A name that is already taken is rejected and the existing subscription kept.
    pub(crate) fn subscribe(
        &mut self,
        name: &str,
        listener: Weak<dyn InvalidationListener>,
    ) -> Result<()> {
        match self.subscriptions.entry(Arc::from(name)) {
            Entry::Occupied(_) => Err(Error::DuplicateSubscription { name: name.into() }),
            Entry::Vacant(v) => {
                v.insert(listener);
                Ok(())
            }
        }
    }

    pub(crate) fn unsubscribe(&mut self, name: &str) -> bool {
        self.subscriptions.remove(name).is_some()
    }

    /// Upgrade all live listeners, pruning those that have been dropped
    pub(crate) fn live_listeners(&mut self) -> Vec<Arc<dyn InvalidationListener>> {
        self.subscriptions.retain(|_, l| l.strong_count() > 0);
        self.subscriptions
            .values()
            .filter_map(|l| l.upgrade())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}
