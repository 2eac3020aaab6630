//! Cache key definitions
//!
//! A view key is a scope, an optional owner, and the query's filter pairs in
//! sorted order. Two queries with the same filters produce the same key no
//! matter what order the filters were supplied in.
//!
//! Storage format: `scope|k=v|k=v` or `scope:owner|k=v|k=v`.

use std::collections::BTreeMap;
use std::fmt;

use crate::store::{DonationFilter, Page};

/// Single donation view
pub const SCOPE_DONATION: &str = "donation";
/// Filtered donation lists
pub const SCOPE_DONATIONS: &str = "donations";
/// Open (unbound) volunteer tasks
pub const SCOPE_OPEN_TASKS: &str = "tasks.open";
/// One volunteer's task list
pub const SCOPE_VOLUNTEER_TASKS: &str = "tasks.volunteer";
/// Per-claim tracking view shared by donor, recipient and volunteer
pub const SCOPE_TRACKING: &str = "tracking";
/// A user's notification feed
pub const SCOPE_NOTIFICATIONS: &str = "notifications";
/// A user's unread count
pub const SCOPE_UNREAD: &str = "unread";

/// Cache key for a read view
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub scope: &'static str,
    pub owner: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl ViewKey {
    pub fn new(scope: &'static str) -> Self {
        Self {
            scope,
            owner: None,
            params: BTreeMap::new(),
        }
    }

    /// Scope the view to one entity (a user, a claim, a donation)
    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    /// Add a filter pair
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a filter pair only if a value is present
    pub fn with_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn with_page(self, page: Page) -> Self {
        self.with("limit", page.limit).with("offset", page.offset)
    }

    /// Convert to storage key string
    pub fn to_storage_key(&self) -> String {
        let mut key = Self::prefix(self.scope, self.owner.as_deref());
        let pairs: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        key.push_str(&pairs.join("|"));
        key
    }

    /// Prefix matching every key of a scope (and owner, if given)
    pub fn prefix(scope: &str, owner: Option<&str>) -> String {
        match owner {
            Some(owner) => format!("{}:{}|", scope, owner),
            None => format!("{}|", scope),
        }
    }

    // -- constructors for the views the service caches ---------------------

    pub fn donation(donation_id: &str) -> Self {
        Self::new(SCOPE_DONATION).owned_by(donation_id)
    }

    pub fn donation_list(filter: &DonationFilter, page: Page) -> Self {
        Self::new(SCOPE_DONATIONS)
            .with_opt("status", filter.status.map(|s| s.as_str()))
            .with_opt("category", filter.category.as_deref())
            .with_opt("delivery_mode", filter.delivery_mode.map(|m| m.as_str()))
            .with_opt("destination", filter.destination.map(|d| d.as_str()))
            .with_opt("donor_id", filter.donor_id.as_deref())
            .with_page(page)
    }

    pub fn open_tasks(page: Page) -> Self {
        Self::new(SCOPE_OPEN_TASKS).with_page(page)
    }

    pub fn volunteer_tasks(volunteer_id: &str) -> Self {
        Self::new(SCOPE_VOLUNTEER_TASKS).owned_by(volunteer_id)
    }

    pub fn tracking(claim_id: &str) -> Self {
        Self::new(SCOPE_TRACKING).owned_by(claim_id)
    }

    pub fn notifications(user_id: &str, page: Page) -> Self {
        Self::new(SCOPE_NOTIFICATIONS)
            .owned_by(user_id)
            .with_page(page)
    }

    pub fn unread(user_id: &str) -> Self {
        Self::new(SCOPE_UNREAD).owned_by(user_id)
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_key())
    }
}
