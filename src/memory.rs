//! In-memory [`UsersConnector`] for tests and embedding without a database.
//!
//! Enforces the same uniqueness rules as the SQLite tables. Every operation
//! runs under one mutex, so there are no races to recover from; the observable
//! outcomes match the SQLite connector's.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::storage::{Uid, UserRow};
use crate::users::{ConnectorError, UserUpdate, UserView, UsersConnector};

#[derive(Debug, Default)]
struct State {
    last_uid: Uid,
    users: BTreeMap<Uid, Option<String>>,
    /// `(uid, attr_type) -> attr_data`
    attributes: BTreeMap<(Uid, String), String>,
}

impl State {
    fn owner_of(&self, attr_type: &str, attr_data: &str) -> Option<Uid> {
        self.attributes
            .iter()
            .find(|((_, t), d)| t == attr_type && d.as_str() == attr_data)
            .map(|((uid, _), _)| *uid)
    }

    fn holder_of(&self, identifier: &str) -> Option<Uid> {
        self.users
            .iter()
            .find(|(_, ident)| ident.as_deref() == Some(identifier))
            .map(|(uid, _)| *uid)
    }
}

#[derive(Debug, Default)]
pub struct MemoryUsersConnector {
    state: Mutex<State>,
}

impl MemoryUsersConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsersConnector for MemoryUsersConnector {
    fn add_user(
        &self,
        identifier: Option<&str>,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<Uid, ConnectorError> {
        let mut state = self.state();
        if let Some(uid) = state.owner_of(attr_type, attr_data) {
            return Ok(uid);
        }
        if let Some(identifier) = identifier {
            if state.holder_of(identifier).is_some() {
                return Err(ConnectorError::Conflict(format!(
                    "identifier {identifier} belongs to another user"
                )));
            }
        }

        state.last_uid += 1;
        let uid = state.last_uid;
        state.users.insert(uid, identifier.map(str::to_string));
        state
            .attributes
            .insert((uid, attr_type.to_string()), attr_data.to_string());
        Ok(uid)
    }

    fn get_user(&self, uid: Uid) -> Result<Option<UserView>, ConnectorError> {
        let state = self.state();
        let Some(identifier) = state.users.get(&uid) else {
            return Ok(None);
        };
        let attributes = state
            .attributes
            .range((uid, String::new())..)
            .take_while(|((owner, _), _)| *owner == uid)
            .map(|((_, t), d)| (t.clone(), d.clone()))
            .collect();
        Ok(Some(UserView {
            uid,
            identifier: identifier.clone(),
            attributes,
        }))
    }

    fn update_user(&self, uid: Uid, update: &UserUpdate) -> Result<(), ConnectorError> {
        let mut state = self.state();
        if !state.users.contains_key(&uid) {
            return Ok(());
        }

        // Check both halves before touching anything, so a conflict leaves
        // the user as it was.
        if let Some(identifier) = update.new_identifier() {
            if state.holder_of(identifier).is_some_and(|holder| holder != uid) {
                return Err(ConnectorError::Conflict(format!(
                    "identifier {identifier} belongs to another user"
                )));
            }
        }
        if let Some((attr_type, attr_data)) = update.new_attribute() {
            if state
                .owner_of(attr_type, attr_data)
                .is_some_and(|owner| owner != uid)
            {
                return Err(ConnectorError::Conflict(format!(
                    "{attr_type} observation is owned by another user"
                )));
            }
        }

        if let Some(identifier) = update.new_identifier() {
            state.users.insert(uid, Some(identifier.to_string()));
        }
        if let Some((attr_type, attr_data)) = update.new_attribute() {
            state
                .attributes
                .insert((uid, attr_type.to_string()), attr_data.to_string());
        }
        Ok(())
    }

    fn remove_user(&self, uid: Uid) -> Result<(), ConnectorError> {
        let mut state = self.state();
        if state.users.remove(&uid).is_some() {
            state.attributes.retain(|(owner, _), _| *owner != uid);
        }
        Ok(())
    }

    fn find_uid_by_attr(
        &self,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<Option<Uid>, ConnectorError> {
        Ok(self.state().owner_of(attr_type, attr_data))
    }

    fn identifier_to_uid(&self, identifier: &str) -> Result<Option<Uid>, ConnectorError> {
        Ok(self.state().holder_of(identifier))
    }

    fn list_users(&self) -> Result<Vec<UserRow>, ConnectorError> {
        Ok(self
            .state()
            .users
            .iter()
            .map(|(uid, identifier)| UserRow {
                uid: *uid,
                identifier: identifier.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uids_are_not_reused() {
        let c = MemoryUsersConnector::new();
        let first = c.add_user(None, "irc", "durden").unwrap();
        c.remove_user(first).unwrap();
        let second = c.add_user(None, "irc", "durden").unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_remove_drops_only_own_attributes() {
        let c = MemoryUsersConnector::new();
        let a = c.add_user(Some("a"), "irc", "a").unwrap();
        let b = c.add_user(Some("b"), "irc", "b").unwrap();
        c.update_user(a, &UserUpdate::new().attribute("git", "a <a@x>"))
            .unwrap();

        c.remove_user(a).unwrap();
        assert!(c.find_uid_by_attr("git", "a <a@x>").unwrap().is_none());
        assert_eq!(c.get_user(b).unwrap().unwrap().attr("irc"), Some("b"));
    }

    #[test]
    fn test_rewriting_own_identifier_is_allowed() {
        let c = MemoryUsersConnector::new();
        let uid = c.add_user(Some("soap"), "IPv9", "0578cc6.8db024").unwrap();
        c.update_user(uid, &UserUpdate::new().identifier("soap"))
            .unwrap();
        assert_eq!(c.identifier_to_uid("soap").unwrap(), Some(uid));
    }
}
