use std::collections::BTreeSet;

use smol_str::SmolStr;

use crate::api::{NameFilter, ResourceFilter};

/// Tracks the names a SOTW client is subscribed to. SOTW clients send their
/// full list of names on every request.
#[derive(Debug, Default)]
pub(crate) struct ListSubscriptions {
    names: BTreeSet<SmolStr>,
}

impl ListSubscriptions {
    /// Replace the subscribed names, returning a filter that matches only the
    /// newly subscribed names, or `None` if nothing changed.
    ///
    /// A list that repeats names is counted as a change, even if the set of
    /// names is the same.
    pub(crate) fn update(&mut self, names: &[String]) -> Option<NameFilter> {
        let new_names: BTreeSet<SmolStr> = names
            .iter()
            .filter(|n| !self.names.contains(n.as_str()))
            .map(SmolStr::from)
            .collect();

        if new_names.is_empty() && self.names.len() == names.len() {
            return None;
        }

        self.names = names.iter().map(SmolStr::from).collect();
        Some(NameFilter::Only(new_names))
    }
}

impl ResourceFilter for ListSubscriptions {
    fn matches(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[derive(Debug)]
enum Mode {
    Unsubscribed,
    Wildcard,
    List(ListSubscriptions),
}

/// Tracks subscriptions for a resource type that a SOTW client may ask for
/// in bulk by sending an empty list of names.
///
/// Once a client names specific resources, it stays in list mode for the
/// rest of the stream.
#[derive(Debug)]
pub(crate) struct WildcardSubscriptions {
    mode: Mode,
}

impl Default for WildcardSubscriptions {
    fn default() -> Self {
        Self {
            mode: Mode::Unsubscribed,
        }
    }
}

impl WildcardSubscriptions {
    pub(crate) fn update(&mut self, names: &[String]) -> Option<NameFilter> {
        if let Mode::List(list) = &mut self.mode {
            return list.update(names);
        }

        if !names.is_empty() {
            let mut list = ListSubscriptions::default();
            let changed = list.update(names);
            self.mode = Mode::List(list);
            return changed;
        }

        match self.mode {
            Mode::Wildcard => None,
            _ => {
                self.mode = Mode::Wildcard;
                Some(NameFilter::All)
            }
        }
    }
}

impl ResourceFilter for WildcardSubscriptions {
    fn matches(&self, name: &str) -> bool {
        match &self.mode {
            Mode::Unsubscribed => false,
            Mode::Wildcard => true,
            Mode::List(list) => list.matches(name),
        }
    }
}

/// The subscription manager for a single SOTW resource type.
#[derive(Debug)]
pub(crate) enum SotwSubscriptions {
    List(ListSubscriptions),
    Wildcard(WildcardSubscriptions),
}

impl SotwSubscriptions {
    pub(crate) fn new(wildcard: bool) -> Self {
        match wildcard {
            true => Self::Wildcard(Default::default()),
            false => Self::List(Default::default()),
        }
    }

    pub(crate) fn update(&mut self, names: &[String]) -> Option<NameFilter> {
        match self {
            SotwSubscriptions::List(list) => list.update(names),
            SotwSubscriptions::Wildcard(wildcard) => wildcard.update(names),
        }
    }
}

impl ResourceFilter for SotwSubscriptions {
    fn matches(&self, name: &str) -> bool {
        match self {
            SotwSubscriptions::List(list) => list.matches(name),
            SotwSubscriptions::Wildcard(wildcard) => wildcard.matches(name),
        }
    }
}
