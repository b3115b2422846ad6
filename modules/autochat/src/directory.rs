use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Identity, RouteHandle};

/// Snapshot of `address -> route` as last fetched from the gateway.
/// Replaced wholesale on refresh; iteration is always in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityDirectory {
    routes: BTreeMap<String, RouteHandle>,
}

impl IdentityDirectory {
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            routes: identities
                .into_iter()
                .map(|identity| (identity.address, identity.route))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.routes.contains_key(address)
    }

    pub fn route(&self, address: &str) -> Option<RouteHandle> {
        self.routes.get(address).copied()
    }

    pub fn identity(&self, address: &str) -> Option<Identity> {
        self.route(address).map(|route| Identity {
            address: address.to_string(),
            route,
        })
    }

    /// Addresses in lexicographic order. This is the scheduler's fairness order.
    pub fn addresses(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.routes
            .iter()
            .map(|(address, route)| Identity {
                address: address.clone(),
                route: *route,
            })
            .collect()
    }

    /// Every address except `address`, in order.
    pub fn peers(&self, address: &str) -> Vec<String> {
        self.routes
            .keys()
            .filter(|a| a.as_str() != address)
            .cloned()
            .collect()
    }

    /// Reverse lookup by exact route handle.
    pub fn address_for_route(&self, route: &RouteHandle) -> Option<&str> {
        self.routes
            .iter()
            .find(|(_, r)| *r == route)
            .map(|(address, _)| address.as_str())
    }
}
