use std::collections::BTreeSet;

use smol_str::SmolStr;

use crate::api::{NameFilter, ResourceFilter, WILDCARD};
use crate::xds::XdsError;

/// Tracks the names a Delta client has explicitly subscribed to.
#[derive(Debug, Default)]
pub(crate) struct ListSubscriptions {
    names: BTreeSet<SmolStr>,
}

impl ListSubscriptions {
    /// Apply a subscribe/unsubscribe pair. Returns a filter matching every
    /// name in `subscribe`, or `None` if nothing changed.
    ///
    /// Clients may re-subscribe to names they're already subscribed to as a
    /// way of asking for the current state, so every name in `subscribe`
    /// is matched, new or not.
    pub(crate) fn update(
        &mut self,
        subscribe: &BTreeSet<SmolStr>,
        unsubscribe: &BTreeSet<SmolStr>,
    ) -> Result<Option<NameFilter>, XdsError> {
        if let Some(name) = subscribe.intersection(unsubscribe).next() {
            return Err(XdsError::protocol(format!(
                "subscribed and unsubscribed from {name:?} in the same request"
            )));
        }

        self.names.extend(subscribe.iter().cloned());
        let mut unsubscribed = false;
        for name in unsubscribe {
            unsubscribed |= self.names.remove(name);
        }

        if !unsubscribed && subscribe.is_empty() {
            return Ok(None);
        }

        Ok(Some(NameFilter::Only(subscribe.clone())))
    }

    fn names(&self) -> impl Iterator<Item = &SmolStr> {
        self.names.iter()
    }
}

impl ResourceFilter for ListSubscriptions {
    fn matches(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Tracks subscriptions for a resource type that supports `"*"`.
///
/// Explicit names are tracked the whole time a client is subscribed to the
/// wildcard, so that dropping the wildcard leaves the client subscribed to
/// what it asked for by name.
#[derive(Debug)]
pub(crate) struct WildcardSubscriptions {
    legacy_reconnect: bool,
    first_request: bool,
    wildcard: bool,
    explicit: ListSubscriptions,
}

impl WildcardSubscriptions {
    /// Create a new set of subscriptions. With `legacy_reconnect`, a
    /// client's first request is always treated as a wildcard subscription
    /// when it doesn't unsubscribe from anything.
    pub(crate) fn new(legacy_reconnect: bool) -> Self {
        Self {
            legacy_reconnect,
            first_request: true,
            wildcard: false,
            explicit: ListSubscriptions::default(),
        }
    }

    pub(crate) fn update(
        &mut self,
        subscribe: &BTreeSet<SmolStr>,
        unsubscribe: &BTreeSet<SmolStr>,
    ) -> Result<Option<NameFilter>, XdsError> {
        let first_request = std::mem::replace(&mut self.first_request, false);

        // an empty first request is a wildcard subscription. older clients
        // send their previous list of names instead when reconnecting.
        if first_request
            && unsubscribe.is_empty()
            && (subscribe.is_empty() || self.legacy_reconnect)
        {
            self.wildcard = true;
            return Ok(Some(NameFilter::All));
        }

        let mut subscribe = subscribe.clone();
        let mut unsubscribe = unsubscribe.clone();

        let mut wildcard_added = false;
        if subscribe.remove(WILDCARD) && !self.wildcard {
            self.wildcard = true;
            wildcard_added = true;
        }
        if unsubscribe.remove(WILDCARD) {
            self.wildcard = false;
        }

        let explicit_change = self.explicit.update(&subscribe, &unsubscribe)?;

        if !self.wildcard {
            return Ok(explicit_change);
        }
        if !wildcard_added {
            return Ok(None);
        }

        // everything is new except what was already explicitly subscribed
        // to. names in this request count as new.
        let already_subscribed = self
            .explicit
            .names()
            .filter(|name| !subscribe.contains(*name))
            .cloned()
            .collect();
        Ok(Some(NameFilter::Except(already_subscribed)))
    }
}

impl ResourceFilter for WildcardSubscriptions {
    fn matches(&self, name: &str) -> bool {
        match self.wildcard {
            true => name != WILDCARD,
            false => self.explicit.matches(name),
        }
    }
}

/// The subscription manager for a single Delta resource type.
#[derive(Debug)]
pub(crate) enum DeltaSubscriptions {
    List(ListSubscriptions),
    Wildcard(WildcardSubscriptions),
}

impl DeltaSubscriptions {
    pub(crate) fn new(wildcard: bool, legacy_reconnect: bool) -> Self {
        match wildcard {
            true => Self::Wildcard(WildcardSubscriptions::new(legacy_reconnect)),
            false => Self::List(ListSubscriptions::default()),
        }
    }

    pub(crate) fn update(
        &mut self,
        subscribe: &BTreeSet<SmolStr>,
        unsubscribe: &BTreeSet<SmolStr>,
    ) -> Result<Option<NameFilter>, XdsError> {
        match self {
            DeltaSubscriptions::List(list) => list.update(subscribe, unsubscribe),
            DeltaSubscriptions::Wildcard(wildcard) => wildcard.update(subscribe, unsubscribe),
        }
    }
}

impl ResourceFilter for DeltaSubscriptions {
    fn matches(&self, name: &str) -> bool {
        match self {
            DeltaSubscriptions::List(list) => list.matches(name),
            DeltaSubscriptions::Wildcard(wildcard) => wildcard.matches(name),
        }
    }
}
