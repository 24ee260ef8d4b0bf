//! Minimal startup handshake: trust, cleartext and MD5 authentication.
//!
//! Anything stronger (SCRAM, TLS) is left to the caller, who can hand an
//! already-authenticated socket to
//! [`PgConnection::from_socket`](super::connection::PgConnection::from_socket).

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::config::PgConfig;
use super::error::{PgError, PgResult, ServerError};
use super::protocol::{
    BackendMessage, FrontendMessage, PasswordMessage, StartupMessage, TransactionStatus,
};
use super::transport::BackendKey;

/// What the server told us while the session was being set up.
#[derive(Debug, Clone, Default)]
pub struct StartupInfo {
    pub backend_key: Option<BackendKey>,
    pub parameters: HashMap<String, String>,
    pub transaction_status: TransactionStatus,
}

/// Run the startup exchange up to the first ReadyForQuery.
pub async fn handshake<S>(stream: &mut S, config: &PgConfig) -> PgResult<StartupInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let startup = StartupMessage {
        user: config.user.clone(),
        database: Some(config.database.clone()),
        options: config
            .application_name
            .as_ref()
            .map(|name| vec![("application_name".to_string(), name.clone())])
            .unwrap_or_default(),
    };
    send(stream, &startup).await?;

    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut info = StartupInfo::default();

    loop {
        let msg = loop {
            if let Some(msg) = BackendMessage::parse(&mut read_buffer)? {
                break msg;
            }
            if stream.read_buf(&mut read_buffer).await? == 0 {
                return Err(PgError::ConnectionClosed);
            }
        };

        match msg {
            BackendMessage::AuthenticationOk => {
                debug!(user = %config.user, "authenticated");
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = required_password(config)?;
                send(stream, &PasswordMessage { password }).await?;
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let password = required_password(config)?;
                let hash = md5_password(&config.user, &password, &salt);
                send(stream, &PasswordMessage { password: hash }).await?;
            }
            BackendMessage::AuthenticationOther { code } => {
                return Err(PgError::Auth(format!(
                    "unsupported authentication method (code {}); connect with an authenticated socket instead",
                    code
                )));
            }
            BackendMessage::ParameterStatus { name, value } => {
                info.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                info.backend_key = Some(BackendKey {
                    process_id,
                    secret_key,
                });
            }
            BackendMessage::ReadyForQuery { status } => {
                info.transaction_status = status;
                return Ok(info);
            }
            BackendMessage::ErrorResponse { fields } => {
                let err = ServerError::from_fields(&fields);
                // 28P01 invalid_password, 28000 invalid_authorization_specification
                if err.code.starts_with("28") {
                    return Err(PgError::Auth(err.message));
                }
                return Err(err.into());
            }
            _ => {
                // Ignore other messages during startup
            }
        }
    }
}

async fn send<S, M>(stream: &mut S, msg: &M) -> PgResult<()>
where
    S: AsyncWrite + Unpin,
    M: FrontendMessage,
{
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn required_password(config: &PgConfig) -> PgResult<String> {
    config
        .password
        .clone()
        .ok_or_else(|| PgError::Auth("Password required".to_string()))
}

/// Compute MD5 password hash.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}
