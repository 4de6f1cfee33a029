use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_CALLER_ID_LEN;

/// Shared cleartext password. The login user name becomes the caller id
/// recorded on every reservation the session writes.
#[derive(Debug)]
pub struct SlotgridAuthSource {
    password: String,
}

impl SlotgridAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotgridAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match login.user() {
            Some(user) if !user.is_empty() && user.len() <= MAX_CALLER_ID_LEN => {
                Ok(Password::new(None, self.password.as_bytes().to_vec()))
            }
            _ => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28000".into(),
                    format!("user name must be 1..={MAX_CALLER_ID_LEN} bytes"),
                ))))
            }
        }
    }
}
