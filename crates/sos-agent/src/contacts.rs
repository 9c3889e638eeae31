//! Ordered emergency contact list.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ConfigError;

/// E.164: leading `+`, no leading zero, 8-15 digits total.
static E164_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{7,14}$").expect("E164_PATTERN regex should compile"));

/// A phone-number-shaped contact address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Contact(String);

impl Contact {
    /// Parse an address, tolerating spaces, dashes, dots and parentheses
    /// between digits.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();
        if E164_PATTERN.is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(ConfigError::invalid(
                "contact",
                format!("{raw:?} is not an E.164 phone number"),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Contact {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Contact> for String {
    fn from(contact: Contact) -> Self {
        contact.0
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contacts in notification order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactList {
    contacts: Vec<Contact>,
}

impl ContactList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and de-duplicate a list of raw addresses, keeping first-seen order.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, ConfigError> {
        let mut list = Self::new();
        for addr in raw {
            list.add(Contact::parse(addr.as_ref())?);
        }
        Ok(list)
    }

    /// Append a contact. Returns `false` if it was already present.
    pub fn add(&mut self, contact: Contact) -> bool {
        if self.contacts.contains(&contact) {
            return false;
        }
        info!(contact = %contact, "Added emergency contact");
        self.contacts.push(contact);
        true
    }

    /// Remove a contact. Returns `false` if it was not present.
    pub fn remove(&mut self, contact: &Contact) -> bool {
        match self.contacts.iter().position(|c| c == contact) {
            Some(idx) => {
                self.contacts.remove(idx);
                info!(contact = %contact, "Removed emergency contact");
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn as_slice(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
