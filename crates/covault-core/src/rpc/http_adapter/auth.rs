//! Node credentials.
//!
//! Regtest nodes hand out credentials in two ways: a fixed
//! rpcuser/rpcpassword pair, or a `.cookie` file that bitcoind rewrites on
//! every start. The cookie is read per request, not once at construction,
//! so restarting the node mid-session does not strand a vault process
//! with stale credentials.

use std::path::{Path, PathBuf};

use crate::error::{RpcError, VaultError};

/// How the HTTP client authenticates against the node.
#[derive(Debug, Clone)]
pub enum RpcAuth {
    /// No authentication; only sensible behind a trusted local proxy.
    None,
    /// Fixed rpcuser/rpcpassword from the node configuration.
    UserPass { user: String, password: String },
    /// Path to the node's `.cookie` file (a single `user:password` line).
    CookieFile(PathBuf),
}

impl RpcAuth {
    /// Pick the auth scheme from CLI-style options: an explicit
    /// user/password pair wins, then a cookie file, then nothing. Giving
    /// only half of the pair is a configuration error, not a fallback.
    pub fn from_options(
        user: Option<&str>,
        password: Option<&str>,
        cookie_file: Option<&Path>,
    ) -> Result<Self, VaultError> {
        match (user, password) {
            (Some(user), Some(password)) => Ok(Self::UserPass {
                user: user.to_owned(),
                password: password.to_owned(),
            }),
            (Some(_), None) | (None, Some(_)) => Err(VaultError::Rpc(RpcError::Config(
                "rpc user and rpc password must be given together".to_owned(),
            ))),
            (None, None) => Ok(match cookie_file {
                Some(path) => Self::CookieFile(path.to_path_buf()),
                None => Self::None,
            }),
        }
    }

    /// Resolve the credentials to attach to one request.
    pub(super) fn credentials(&self) -> Result<Option<(String, String)>, VaultError> {
        match self {
            Self::None => Ok(None),
            Self::UserPass { user, password } => Ok(Some((user.clone(), password.clone()))),
            Self::CookieFile(path) => read_cookie(path).map(Some),
        }
    }
}

fn read_cookie(path: &Path) -> Result<(String, String), VaultError> {
    let cookie_error = |detail: String| {
        VaultError::Rpc(RpcError::Config(format!(
            "node cookie file {}: {detail}",
            path.display()
        )))
    };

    let content = std::fs::read_to_string(path).map_err(|e| cookie_error(e.to_string()))?;
    let line = content
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| cookie_error("file is empty".to_owned()))?;

    match line.split_once(':') {
        Some((user, password)) if !user.is_empty() && !password.is_empty() => {
            Ok((user.to_owned(), password.to_owned()))
        }
        _ => Err(cookie_error(
            "expected a single `user:password` line".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn temp_cookie(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("covault-cookie-{name}-{}", std::process::id()));
        fs::write(&path, content).expect("cookie file must be writable");
        path
    }

    #[test]
    fn explicit_pair_wins_over_cookie() {
        let cookie = temp_cookie("unused", "ignored:ignored");
        let auth = RpcAuth::from_options(Some("alice"), Some("secret"), Some(cookie.as_path()))
            .expect("pair must resolve");
        assert!(matches!(auth, RpcAuth::UserPass { .. }));
        assert_eq!(
            auth.credentials().expect("credentials resolve"),
            Some(("alice".to_owned(), "secret".to_owned()))
        );
        let _ = fs::remove_file(cookie);
    }

    #[test]
    fn half_a_pair_is_a_config_error() {
        let err = RpcAuth::from_options(Some("alice"), None, None)
            .expect_err("user without password must be rejected");
        assert!(err.to_string().contains("given together"));
    }

    #[test]
    fn no_options_means_no_auth() {
        let auth = RpcAuth::from_options(None, None, None).expect("no options resolve");
        assert!(matches!(auth, RpcAuth::None));
        assert_eq!(auth.credentials().expect("credentials resolve"), None);
    }

    #[test]
    fn cookie_is_reread_per_request() {
        let cookie = temp_cookie("reread", "__cookie__:first\n");
        let auth =
            RpcAuth::from_options(None, None, Some(cookie.as_path())).expect("cookie resolves");
        assert_eq!(
            auth.credentials().expect("first read"),
            Some(("__cookie__".to_owned(), "first".to_owned()))
        );

        // The node restarted and rewrote its cookie.
        fs::write(&cookie, "__cookie__:second\n").expect("cookie file must be writable");
        assert_eq!(
            auth.credentials().expect("second read"),
            Some(("__cookie__".to_owned(), "second".to_owned()))
        );
        let _ = fs::remove_file(cookie);
    }

    #[test]
    fn empty_cookie_file_is_rejected() {
        let cookie = temp_cookie("empty", "\n");
        let auth = RpcAuth::CookieFile(cookie.clone());
        let err = auth.credentials().expect_err("empty cookie must be rejected");
        assert!(err.to_string().contains("file is empty"));
        let _ = fs::remove_file(cookie);
    }

    #[test]
    fn cookie_without_separator_is_rejected() {
        let cookie = temp_cookie("malformed", "justonefield\n");
        let auth = RpcAuth::CookieFile(cookie.clone());
        let err = auth
            .credentials()
            .expect_err("cookie without a colon must be rejected");
        assert!(err.to_string().contains("user:password"));
        let _ = fs::remove_file(cookie);
    }
}
