//! Token persistence: `token.json` in the data directory.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::model::Token;

const TOKEN_FILE: &str = "token.json";

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(TOKEN_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored token, expired or not. A missing or corrupt file is `None`.
    pub fn load(&self) -> Option<Token> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("token: cannot read {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(tok) => Some(tok),
            Err(e) => {
                warn!("token: ignoring corrupt {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Stored token only if it is still valid at `now`.
    pub fn load_valid(&self, now: u64) -> Option<Token> {
        self.load().filter(|t| !t.is_expired(now))
    }

    /// Write atomically (temp file + rename), readable by the owner only.
    pub fn save(&self, token: &Token) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(token).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("token: saved to {}", self.path.display());
        Ok(())
    }
}
