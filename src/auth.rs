use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::engine::Engine;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Login name of sessions that have no user yet. They may only register users.
pub const ANONYMOUS: &str = "anonymous";

/// Server-wide password; the login name must be `anonymous` or resolve to a registered user.
pub struct RoomBookAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl fmt::Debug for RoomBookAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomBookAuthSource").finish_non_exhaustive()
    }
}

impl RoomBookAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }

    fn login_known(&self, login: &str) -> bool {
        login == ANONYMOUS || self.engine.resolve_login(login).is_some()
    }
}

#[async_trait]
impl AuthSource for RoomBookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if !self.login_known(user) {
            warn!("login rejected: unknown user {user:?}");
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("unknown user {user:?}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewUser;
    use ulid::Ulid;

    #[tokio::test]
    async fn logins_resolve_by_id_email_or_anonymous() {
        let dir = std::env::temp_dir().join("roombook_test_auth");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("logins.wal");
        let _ = std::fs::remove_file(&path);
        let engine = Arc::new(Engine::new(path).unwrap());

        let id = Ulid::new();
        engine
            .register_user(
                None,
                NewUser {
                    id,
                    name: "Dana".into(),
                    email: "Dana@Example.com".into(),
                    credential_hash: "h".into(),
                    system_admin: false,
                },
            )
            .await
            .unwrap();

        let auth = RoomBookAuthSource::new(engine, "pw".into());
        assert!(auth.login_known(ANONYMOUS));
        assert!(auth.login_known(&id.to_string()));
        assert!(auth.login_known("dana@example.com"));
        assert!(!auth.login_known("eve@example.com"));
        assert!(!auth.login_known(&Ulid::new().to_string()));
        assert_eq!(format!("{auth:?}"), "RoomBookAuthSource { .. }");
    }
}
