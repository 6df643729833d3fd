//! Profile group resolution.


use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{HubError, Result};
use crate::types::{ProfileGroup, UserId};

/// The OS user service the resolver reads from.
pub trait ProfileTopology: Send + Sync {
    fn user_exists(&self, user: UserId) -> bool;

    /// Primary user owning `user`, if `user` is a secondary profile.
    fn parent_of(&self, user: UserId) -> Option<UserId>;

    /// Secondary profiles attached to `primary`.
    fn profiles_of(&self, primary: UserId) -> Vec<UserId>;
}

/// Computes the profile group for a user on every call.
#[derive(Clone)]
pub struct UserProfileResolver {
    topology: Arc<dyn ProfileTopology>,
}

impl UserProfileResolver {
    pub fn new(topology: Arc<dyn ProfileTopology>) -> Self {
        UserProfileResolver { topology }
    }

    pub fn resolve(&self, user: UserId) -> Result<ProfileGroup> {
        if !self.topology.user_exists(user) {
            log::warn!("user id {} does not correspond to an existing user", user);
            return Err(HubError::UnknownUser(user));
        }
        let primary = match self.topology.parent_of(user) {
            Some(parent) if self.topology.user_exists(parent) => parent,
            _ => user,
        };
        let secondaries: Vec<UserId> = self
            .topology
            .profiles_of(primary)
            .into_iter()
            .filter(|profile| self.topology.user_exists(*profile))
            .collect();
        Ok(ProfileGroup::new(primary, secondaries))
    }
}

/// Topology held in memory; stands in for the OS service in embedders and
/// tests.
#[derive(Debug, Default)]
pub struct InMemoryTopology {
    parents: DashMap<UserId, Option<UserId>>,
}

impl InMemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserId) {
        self.parents.insert(user, None);
    }

    pub fn add_profile(&self, primary: UserId, profile: UserId) {
        self.parents.entry(primary).or_insert(None);
        self.parents.insert(profile, Some(primary));
    }

    /// Removes a user; profiles attached to it stay but resolve on their own.
    pub fn remove_user(&self, user: UserId) {
        self.parents.remove(&user);
    }
}

impl ProfileTopology for InMemoryTopology {
    fn user_exists(&self, user: UserId) -> bool {
        self.parents.contains_key(&user)
    }

    fn parent_of(&self, user: UserId) -> Option<UserId> {
        self.parents.get(&user).and_then(|entry| *entry.value())
    }

    fn profiles_of(&self, primary: UserId) -> Vec<UserId> {
        let mut profiles: Vec<UserId> = self
            .parents
            .iter()
            .filter(|entry| *entry.value() == Some(primary))
            .map(|entry| *entry.key())
            .collect();
        profiles.sort();
        profiles
    }
}
