use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use log::{info, warn};

/// A webmail account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    /// Sender address, `Name <user@host>` or bare `user@host`
    pub address: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
}

impl Account {
    pub fn new(name: impl Into<String>, address: impl Into<String>, password: &str) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            password_hash: hash_password(password),
        }
    }

    pub fn check_password(&self, password: &str) -> bool {
        let candidate = hash_password(password);
        // Compare every byte so timing does not depend on the first mismatch
        candidate.len() == self.password_hash.len()
            && candidate
                .bytes()
                .zip(self.password_hash.to_lowercase().bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

/// Hex encoded SHA-256 of a password, as stored in the preload file
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Registry of the accounts allowed to log in
#[derive(Debug, Clone, Default)]
pub struct AccountManager {
    accounts: HashMap<String, Account>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let mut manager = Self::new();
        for account in accounts {
            manager.add(account);
        }
        manager
    }

    pub fn add(&mut self, account: Account) {
        if self.accounts.contains_key(&account.name) {
            warn!("[ACCOUNT] Replacing existing account '{}'", account.name);
        }
        self.accounts.insert(account.name.clone(), account);
    }

    pub fn get(&self, name: &str) -> Option<Account> {
        self.accounts.get(name).cloned()
    }

    /// Return the account matching the credentials, if any
    pub fn authenticate(&self, credentials: &Credentials) -> Option<Account> {
        match self.accounts.get(&credentials.name) {
            Some(account) if account.check_password(&credentials.password) => {
                info!("[ACCOUNT] '{}' authenticated", account.name);
                Some(account.clone())
            }
            Some(_) => {
                warn!("[ACCOUNT] Bad password for '{}'", credentials.name);
                None
            }
            None => {
                warn!("[ACCOUNT] Unknown account '{}'", credentials.name);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(name: &str, password: &str) -> Credentials {
        Credentials {
            name: name.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_hash_password() {
        assert_eq!(
            hash_password("test_pass"),
            hex::encode(Sha256::digest(b"test_pass"))
        );
        assert_eq!(hash_password("a").len(), 64);
    }

    #[test]
    fn test_authenticate() {
        let manager = AccountManager::from_accounts(vec![Account::new(
            "test",
            "Test <test@example.com>",
            "test_pass",
        )]);

        assert!(manager.authenticate(&credentials("test", "test_pass")).is_some());
        assert!(manager.authenticate(&credentials("test", "bad_password")).is_none());
        assert!(manager.authenticate(&credentials("nobody", "test_pass")).is_none());
    }

    #[test]
    fn test_uppercase_hash_is_accepted() {
        let mut account = Account::new("test", "test@example.com", "x");
        account.password_hash = account.password_hash.to_uppercase();
        assert!(account.check_password("x"));
    }

    #[test]
    fn test_password_hash_not_serialized() {
        let account = Account::new("test", "test@example.com", "test_pass");
        let value = serde_json::to_value(&account).unwrap();
        assert_eq!(value, serde_json::json!({"name": "test", "address": "test@example.com"}));
    }
}
