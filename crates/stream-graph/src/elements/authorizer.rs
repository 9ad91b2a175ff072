//! Simple authorizer: a synchronous user/password check against a state
//! keeper backed map, administered over RPC.

use std::sync::Arc;

use media_tag::RequestInfo;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::rpc::{RpcError, RpcService};
use crate::state::StateKeepUser;

pub const AUTHORIZER_CLASS_NAME: &str = "simple_authorizer";

pub struct SimpleAuthorizer {
    name: String,
    keeper: StateKeepUser,
}

impl SimpleAuthorizer {
    pub fn new(name: impl Into<String>, keeper: StateKeepUser) -> Arc<SimpleAuthorizer> {
        Arc::new(SimpleAuthorizer {
            name: name.into(),
            keeper,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_user_password(&self, user: &str, password: &str) {
        self.keeper.set_value(&format!("user/{user}"), password);
    }

    pub fn delete_user(&self, user: &str) {
        self.keeper.delete_value(&format!("user/{user}"));
    }

    pub fn users(&self) -> Vec<String> {
        self.keeper
            .get_key_values()
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix("user/").map(str::to_string))
            .collect()
    }

    pub fn authorize_user(&self, user: &str, password: &str) -> bool {
        self.keeper
            .get_value(&format!("user/{user}"))
            .is_some_and(|stored| stored == password)
    }

    /// Authorize a request by the credentials it carries.
    pub fn authorize(&self, info: &RequestInfo) -> bool {
        match (&info.auth_user, &info.auth_pass) {
            (Some(user), Some(pass)) => self.authorize_user(user, pass),
            _ => false,
        }
    }
}

#[derive(Deserialize)]
struct SetUserPasswordParams {
    user: String,
    password: String,
}

#[derive(Deserialize)]
struct DeleteUserParams {
    user: String,
}

impl RpcService for SimpleAuthorizer {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "SetUserPassword" => {
                let params: SetUserPasswordParams = serde_json::from_value(params)?;
                info!(authorizer = %self.name, user = %params.user, "setting password");
                self.set_user_password(&params.user, &params.password);
                Ok(json!({}))
            }
            "DeleteUser" => {
                let params: DeleteUserParams = serde_json::from_value(params)?;
                info!(authorizer = %self.name, user = %params.user, "deleting user");
                self.delete_user(&params.user);
                Ok(json!({}))
            }
            "GetUsers" => Ok(json!(self.users())),
            other => Err(RpcError::NoSuchMethod {
                service: AUTHORIZER_CLASS_NAME.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateKeeper;

    #[test]
    fn password_lifecycle() {
        let keeper = StateKeeper::new();
        let auth = SimpleAuthorizer::new("auth", StateKeepUser::new(keeper, "auth"));
        auth.set_user_password("alice", "secret");

        assert!(auth.authorize_user("alice", "secret"));
        assert!(!auth.authorize_user("alice", "wrong"));
        assert!(!auth.authorize_user("bob", "secret"));
        assert_eq!(auth.users(), vec!["alice".to_string()]);

        auth.delete_user("alice");
        assert!(!auth.authorize_user("alice", "secret"));
    }

    #[test]
    fn rpc_surface() {
        let keeper = StateKeeper::new();
        let auth = SimpleAuthorizer::new("auth", StateKeepUser::new(keeper, "auth"));
        auth.invoke(
            "SetUserPassword",
            json!({"user": "bob", "password": "pw"}),
        )
        .unwrap();
        assert_eq!(auth.invoke("GetUsers", json!({})).unwrap(), json!(["bob"]));
        auth.invoke("DeleteUser", json!({"user": "bob"})).unwrap();
        assert_eq!(
            auth.invoke("GetUsers", json!({})).unwrap(),
            json!(Vec::<String>::new())
        );
    }
}
