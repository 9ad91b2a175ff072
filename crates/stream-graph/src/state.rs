//! In-memory state keeper: a prefix-scoped key-value store with a small
//! transactional API. Policies and the time-saving element persist their
//! state through it; durable backends are a deployment concern behind the
//! same surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

enum TxOp {
    Set(String, String),
    Delete(String),
}

#[derive(Default)]
struct KeeperState {
    values: BTreeMap<String, String>,
    transaction: Option<Vec<TxOp>>,
}

/// The shared store. Transactions are atomic within one keeper.
#[derive(Default)]
pub struct StateKeeper {
    state: Mutex<KeeperState>,
}

impl StateKeeper {
    pub fn new() -> Arc<StateKeeper> {
        Arc::new(StateKeeper::default())
    }

    pub fn begin_transaction(&self) {
        let mut state = self.state.lock();
        if state.transaction.is_none() {
            state.transaction = Some(Vec::new());
        }
    }

    pub fn commit_transaction(&self) {
        let mut state = self.state.lock();
        if let Some(ops) = state.transaction.take() {
            for op in ops {
                match op {
                    TxOp::Set(key, value) => {
                        state.values.insert(key, value);
                    }
                    TxOp::Delete(key) => {
                        state.values.remove(&key);
                    }
                }
            }
        }
    }

    pub fn set_value(&self, key: &str, value: &str) {
        let mut state = self.state.lock();
        match &mut state.transaction {
            Some(ops) => ops.push(TxOp::Set(key.to_string(), value.to_string())),
            None => {
                state.values.insert(key.to_string(), value.to_string());
            }
        }
    }

    pub fn delete_value(&self, key: &str) {
        let mut state = self.state.lock();
        match &mut state.transaction {
            Some(ops) => ops.push(TxOp::Delete(key.to_string())),
            None => {
                state.values.remove(key);
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.state.lock().values.get(key).cloned()
    }

    /// All committed (key, value) pairs under a prefix.
    pub fn get_key_values(&self, prefix: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Delete every key under a prefix.
    pub fn delete_prefix(&self, prefix: &str) {
        let keys: Vec<String> = self
            .get_key_values(prefix)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let mut state = self.state.lock();
        for key in keys {
            state.values.remove(&key);
        }
    }
}

/// A keeper view scoped under one namespace prefix.
#[derive(Clone)]
pub struct StateKeepUser {
    keeper: Arc<StateKeeper>,
    prefix: String,
}

impl StateKeepUser {
    pub fn new(keeper: Arc<StateKeeper>, prefix: impl Into<String>) -> Self {
        StateKeepUser {
            keeper,
            prefix: prefix.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{key}", self.prefix)
    }

    pub fn begin_transaction(&self) {
        self.keeper.begin_transaction();
    }

    pub fn commit_transaction(&self) {
        self.keeper.commit_transaction();
    }

    pub fn set_value(&self, key: &str, value: &str) {
        self.keeper.set_value(&self.full_key(key), value);
    }

    pub fn delete_value(&self, key: &str) {
        self.keeper.delete_value(&self.full_key(key));
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.keeper.get_value(&self.full_key(key))
    }

    /// (key, value) pairs under this scope, keys relative to the scope.
    pub fn get_key_values(&self) -> Vec<(String, String)> {
        let prefix = format!("{}/", self.prefix);
        self.keeper
            .get_key_values(&prefix)
            .into_iter()
            .map(|(k, v)| (k[prefix.len()..].to_string(), v))
            .collect()
    }

    /// Drop everything under this scope.
    pub fn clear(&self) {
        self.keeper.delete_prefix(&format!("{}/", self.prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_applies_atomically_on_commit() {
        let keeper = StateKeeper::new();
        keeper.begin_transaction();
        keeper.set_value("a", "1");
        keeper.set_value("b", "2");
        assert_eq!(keeper.get_value("a"), None);
        keeper.commit_transaction();
        assert_eq!(keeper.get_value("a"), Some("1".to_string()));
        assert_eq!(keeper.get_value("b"), Some("2".to_string()));
    }

    #[test]
    fn scoped_user_prefixes_and_clears() {
        let keeper = StateKeeper::new();
        let user = StateKeepUser::new(keeper.clone(), "policy/p1");
        user.set_value("playlist", "[\"a\"]");
        user.set_value("current", "0");
        keeper.set_value("policy/p2/current", "5");

        assert_eq!(user.get_value("current"), Some("0".to_string()));
        let mut keys: Vec<String> = user.get_key_values().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["current", "playlist"]);

        user.clear();
        assert!(user.get_key_values().is_empty());
        assert_eq!(keeper.get_value("policy/p2/current"), Some("5".to_string()));
    }
}
