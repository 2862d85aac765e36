use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::relaytun::config::AuthConfig;
use crate::relaytun::tunnel::error::TunnelError;

/// Supplies bearer tokens for relay handshakes. Token acquisition itself (sign-in,
/// refresh flows) lives outside this crate.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn bearer_token(&self) -> Result<String, TunnelError>;

    /// Called when the relay rejects a token. Returns true when a different token is now
    /// available and the handshake is worth one more attempt.
    async fn on_authorization_denied(&self) -> bool {
        false
    }
}

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialSource for StaticToken {
    async fn bearer_token(&self) -> Result<String, TunnelError> {
        Ok(self.0.clone())
    }
}

/// Reads the token from an environment variable on every handshake.
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialSource for EnvToken {
    async fn bearer_token(&self) -> Result<String, TunnelError> {
        match std::env::var(&self.var) {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(TunnelError::Credential(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// Runs a token-printing command (e.g. `gcloud auth print-access-token`) and caches its output
/// until the relay rejects it.
pub struct CommandToken {
    program: String,
    args: Vec<String>,
    cached: Mutex<Option<String>>,
}

impl CommandToken {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialSource for CommandToken {
    async fn bearer_token(&self) -> Result<String, TunnelError> {
        let mut cached = self.cached.lock().await;
        if let Some(t) = cached.as_ref() {
            return Ok(t.clone());
        }

        let out = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| TunnelError::Credential(format!("run {}: {err}", self.program)))?;
        if !out.status.success() {
            return Err(TunnelError::Credential(format!(
                "{} exited with {}",
                self.program, out.status
            )));
        }
        let token = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if token.is_empty() {
            return Err(TunnelError::Credential(format!(
                "{} printed an empty token",
                self.program
            )));
        }
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn on_authorization_denied(&self) -> bool {
        self.cached.lock().await.take();
        tracing::info!(program=%self.program, "auth: token rejected; will re-run token command");
        true
    }
}

pub fn from_config(auth: &AuthConfig) -> anyhow::Result<Arc<dyn CredentialSource>> {
    if let Some((program, args)) = auth.token_command.split_first() {
        return Ok(Arc::new(CommandToken::new(program.clone(), args.to_vec())));
    }
    if !auth.token_env.is_empty() {
        return Ok(Arc::new(EnvToken::new(auth.token_env.clone())));
    }
    anyhow::bail!("auth: configure token_command or token_env")
}
