//! Users connector: maps attribute observations onto stable user ids.
//!
//! An observation is an `(attr_type, attr_data)` pair such as
//! `("git", "Tyler Durden <tyler@mayhem.net>")`. Each observation belongs to
//! at most one user, and a user holds at most one value per attribute type.
//!
//! Concurrent writers are coordinated only by the store's transactions and
//! uniqueness constraints. [`UsersConnector::add_user`] recovers from losing
//! a creation race with one corrective lookup; [`UsersConnector::update_user`]
//! lets a concurrently committed attribute value stand.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{self, ConfigError};
use crate::logging;
use crate::storage::{self, Storage, StorageError, Uid, UserAttributeRow, UserRow};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// A uniqueness violation that is not the result of a recoverable race.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConnectorError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConnectorError::Conflict(_))
    }
}

impl From<rusqlite::Error> for ConnectorError {
    fn from(e: rusqlite::Error) -> Self {
        ConnectorError::Store(e.into())
    }
}

/// Map a unique violation to [`ConnectorError::Conflict`]; pass anything else through.
fn conflict_or_store(err: StorageError, describe: impl FnOnce() -> String) -> ConnectorError {
    if err.is_unique_violation() {
        ConnectorError::Conflict(describe())
    } else {
        ConnectorError::Store(err)
    }
}

// ---------------------------------------------------------------------------
// Views and requests
// ---------------------------------------------------------------------------

/// A user merged with all of its attributes.
///
/// Serializes to the flat mapping `{uid, identifier, <attr_type>: <attr_data>, ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserView {
    pub uid: Uid,
    pub identifier: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl UserView {
    pub fn from_rows(user: UserRow, attributes: Vec<UserAttributeRow>) -> Self {
        Self {
            uid: user.uid,
            identifier: user.identifier,
            attributes: attributes
                .into_iter()
                .map(|row| (row.attr_type, row.attr_data))
                .collect(),
        }
    }

    pub fn attr(&self, attr_type: &str) -> Option<&str> {
        self.attributes.get(attr_type).map(String::as_str)
    }

    /// Flatten into a single mapping. `uid` and `identifier` take precedence
    /// over attribute types of the same name.
    pub fn to_mapping(&self) -> Map<String, Value> {
        let mut map: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        map.insert("uid".to_string(), Value::from(self.uid));
        map.insert(
            "identifier".to_string(),
            self.identifier.clone().map_or(Value::Null, Value::String),
        );
        map
    }
}

impl Serialize for UserView {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_mapping().serialize(serializer)
    }
}

/// Changes to apply to an existing user. Either part may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    identifier: Option<String>,
    attribute: Option<(String, String)>,
}

impl UserUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn attribute(mut self, attr_type: impl Into<String>, attr_data: impl Into<String>) -> Self {
        self.attribute = Some((attr_type.into(), attr_data.into()));
        self
    }

    pub fn new_identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn new_attribute(&self) -> Option<(&str, &str)> {
        self.attribute
            .as_ref()
            .map(|(t, d)| (t.as_str(), d.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.identifier.is_none() && self.attribute.is_none()
    }
}

// ---------------------------------------------------------------------------
// Connector trait
// ---------------------------------------------------------------------------

/// Identity reconciliation operations.
pub trait UsersConnector {
    /// Find-or-create the user owning `(attr_type, attr_data)`.
    ///
    /// A new user gets `identifier`. If the observation is already owned, the
    /// owner's uid is returned and its identifier is left alone. Fails with
    /// [`ConnectorError::Conflict`] when `identifier` belongs to a user that
    /// does not own the observation.
    fn add_user(
        &self,
        identifier: Option<&str>,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<Uid, ConnectorError>;

    /// Read a user and all of its attributes, `None` if the uid is unknown.
    fn get_user(&self, uid: Uid) -> Result<Option<UserView>, ConnectorError>;

    /// Set the identifier and/or upsert one attribute. Unknown uids are a no-op.
    ///
    /// If another writer commits the same attribute type for this user first,
    /// that value stands and this call still succeeds.
    fn update_user(&self, uid: Uid, update: &UserUpdate) -> Result<(), ConnectorError>;

    /// Delete a user and its attributes. Unknown uids are a no-op.
    fn remove_user(&self, uid: Uid) -> Result<(), ConnectorError>;

    fn find_uid_by_attr(&self, attr_type: &str, attr_data: &str)
        -> Result<Option<Uid>, ConnectorError>;

    fn identifier_to_uid(&self, identifier: &str) -> Result<Option<Uid>, ConnectorError>;

    /// Every user ordered by uid, without attributes.
    fn list_users(&self) -> Result<Vec<UserRow>, ConnectorError>;
}

// ---------------------------------------------------------------------------
// SQLite connector
// ---------------------------------------------------------------------------

/// Runs statements that stand in for a concurrent committer.
#[cfg(test)]
type RaceHook = Box<dyn Fn(&Connection) -> Result<(), StorageError>>;

/// [`UsersConnector`] bound to a SQLite [`Storage`] handle.
pub struct SqliteUsersConnector {
    storage: Storage,
    #[cfg(test)]
    race_hook: Option<RaceHook>,
}

impl SqliteUsersConnector {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            #[cfg(test)]
            race_hook: None,
        }
    }

    /// Open the database named by `{IDLINK_HOME}/config.toml` and the
    /// `IDLINK_*` environment overrides.
    ///
    /// Also installs a log subscriber filtered by the configured
    /// `log_filter`, unless the application already set one.
    pub fn from_env() -> Result<Self, ConnectorError> {
        let data_dir = config::resolve_data_dir();
        let config = config::load_config(&data_dir)?.apply_env_overrides();
        if logging::init(&config.log_filter) {
            debug!(filter = %config.log_filter, "installed log subscriber");
        }
        Ok(Self::new(Storage::from_config(&config, &data_dir)?))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[cfg(test)]
    fn with_race_hook(
        mut self,
        hook: impl Fn(&Connection) -> Result<(), StorageError> + 'static,
    ) -> Self {
        self.race_hook = Some(Box::new(hook));
        self
    }

    /// Called right before an insert that can lose a race.
    #[cfg_attr(not(test), allow(unused_variables))]
    fn before_contended_insert(&self, conn: &Connection) -> Result<(), StorageError> {
        #[cfg(test)]
        if let Some(hook) = &self.race_hook {
            hook(conn)?;
        }
        Ok(())
    }

    /// Insert the user and its first observation in one transaction.
    fn insert_user_with_attribute(
        &self,
        identifier: Option<&str>,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<Uid, StorageError> {
        self.before_contended_insert(self.storage.conn())?;
        let tx = self.storage.begin_write()?;
        let uid = storage::insert_user(&tx, identifier)?;
        storage::insert_attribute(&tx, uid, attr_type, attr_data)?;
        tx.commit()?;
        Ok(uid)
    }

    fn upsert_attribute(
        &self,
        conn: &Connection,
        uid: Uid,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<(), ConnectorError> {
        let owned_elsewhere = || format!("{attr_type} observation is owned by another user");

        let updated = storage::update_attribute(conn, uid, attr_type, attr_data)
            .map_err(|e| conflict_or_store(e, owned_elsewhere))?;
        if updated > 0 {
            return Ok(());
        }

        self.before_contended_insert(conn)?;
        match storage::insert_attribute(conn, uid, attr_type, attr_data) {
            Ok(()) => Ok(()),
            Err(err) if err.is_unique_violation() => {
                if storage::attribute_exists(conn, uid, attr_type)? {
                    info!(
                        uid,
                        attr_type,
                        attr_data = %logging::attr_data(attr_data),
                        "attribute written concurrently, keeping committed value"
                    );
                    Ok(())
                } else {
                    Err(ConnectorError::Conflict(owned_elsewhere()))
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl UsersConnector for SqliteUsersConnector {
    fn add_user(
        &self,
        identifier: Option<&str>,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<Uid, ConnectorError> {
        let err = match self.insert_user_with_attribute(identifier, attr_type, attr_data) {
            Ok(uid) => {
                debug!(uid, attr_type, "created user");
                return Ok(uid);
            }
            Err(err) if err.is_unique_violation() => err,
            Err(err) => return Err(err.into()),
        };

        // The insert was rolled back. If someone else committed this
        // observation, they own it; otherwise the identifier is taken.
        match storage::find_uid_by_attr(self.storage.conn(), attr_type, attr_data)? {
            Some(uid) => {
                info!(
                    uid,
                    attr_type,
                    attr_data = %logging::attr_data(attr_data),
                    "observation already owned, returning existing user"
                );
                Ok(uid)
            }
            None => {
                warn!(?identifier, attr_type, error = %err, "add user conflict");
                Err(ConnectorError::Conflict(format!(
                    "identifier {} belongs to another user",
                    identifier.unwrap_or("<none>")
                )))
            }
        }
    }

    fn get_user(&self, uid: Uid) -> Result<Option<UserView>, ConnectorError> {
        let tx = self.storage.begin_read()?;
        let Some(user) = storage::get_user(&tx, uid)? else {
            debug!(uid, "user not found");
            return Ok(None);
        };
        let attributes = storage::list_attributes(&tx, uid)?;
        tx.commit()?;
        Ok(Some(UserView::from_rows(user, attributes)))
    }

    fn update_user(&self, uid: Uid, update: &UserUpdate) -> Result<(), ConnectorError> {
        if update.is_empty() {
            return Ok(());
        }

        let tx = self.storage.begin_write()?;
        if !storage::user_exists(&tx, uid)? {
            debug!(uid, "update of missing user ignored");
            return Ok(());
        }

        if let Some(identifier) = update.new_identifier() {
            storage::update_identifier(&tx, uid, identifier).map_err(|e| {
                conflict_or_store(e, || format!("identifier {identifier} belongs to another user"))
            })?;
        }

        if let Some((attr_type, attr_data)) = update.new_attribute() {
            self.upsert_attribute(&tx, uid, attr_type, attr_data)?;
        }

        tx.commit()?;
        debug!(uid, "updated user");
        Ok(())
    }

    fn remove_user(&self, uid: Uid) -> Result<(), ConnectorError> {
        let removed = storage::delete_user(self.storage.conn(), uid)?;
        debug!(uid, removed, "remove user");
        Ok(())
    }

    fn find_uid_by_attr(
        &self,
        attr_type: &str,
        attr_data: &str,
    ) -> Result<Option<Uid>, ConnectorError> {
        Ok(storage::find_uid_by_attr(
            self.storage.conn(),
            attr_type,
            attr_data,
        )?)
    }

    fn identifier_to_uid(&self, identifier: &str) -> Result<Option<Uid>, ConnectorError> {
        Ok(storage::find_uid_by_identifier(
            self.storage.conn(),
            identifier,
        )?)
    }

    fn list_users(&self) -> Result<Vec<UserRow>, ConnectorError> {
        Ok(storage::list_users(self.storage.conn())?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
