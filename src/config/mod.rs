//! Configuration: a TOML file plus a couple of env overrides. No
//! config file is required to exist for `--help`-style invocations,
//! but syncing needs at least one account.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default, rename = "account")]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Where status folders, uid maps and uidvalidity caches live.
    pub status_dir: Option<PathBuf>,
    /// fsync status files on commit. Disable only for throwaway runs.
    #[serde(default = "default_true")]
    pub fsync: bool,
    /// Upper bound on folder workers running at once per account.
    #[serde(default = "default_one")]
    pub max_folder_workers: usize,
    /// Per-account cap on concurrent message copies inside a folder.
    #[serde(default = "default_copy_workers")]
    pub copy_workers: usize,
}

impl Default for General {
    fn default() -> Self {
        Self {
            status_dir: None,
            fsync: true,
            max_folder_workers: 1,
            copy_workers: default_copy_workers(),
        }
    }
}

impl General {
    pub fn resolved_status_dir(&self) -> Result<PathBuf> {
        if let Ok(dir) = env::var("TERN_STATUS_DIR") {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.status_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("tern"))
            .context("no status_dir configured and no platform data dir")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// The remote side; always IMAP.
    pub remote: ImapEndpoint,
    /// The near side: an on-disk maildir or a second IMAP account.
    pub local: LocalEndpoint,
    #[serde(default)]
    pub options: SyncOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapEndpoint {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    /// Plaintext password; prefer `password_env`.
    pub password: Option<String>,
    /// Name of an env var holding the password.
    pub password_env: Option<String>,
    /// Name of an env var holding an OAuth2 access token (XOAUTH2).
    pub access_token_env: Option<String>,
    /// Issue STARTTLS on a plain connection instead of implicit TLS.
    #[serde(default)]
    pub starttls: bool,
    #[serde(default = "default_one")]
    pub maxconnections: usize,
    /// NOOP an idle connection every this many seconds; 0 disables.
    #[serde(default)]
    pub keepalive: u64,
}

impl ImapEndpoint {
    /// Resolve the credential at use time so secrets stay out of the
    /// parsed config for as long as possible.
    pub fn credential(&self) -> Result<Credential> {
        if let Some(var) = &self.access_token_env {
            let token =
                env::var(var).with_context(|| format!("access token env var {var} not set"))?;
            return Ok(Credential::OAuth2 { token });
        }
        if let Some(var) = &self.password_env {
            let password =
                env::var(var).with_context(|| format!("password env var {var} not set"))?;
            return Ok(Credential::Password { password });
        }
        if let Some(password) = &self.password {
            return Ok(Credential::Password {
                password: password.clone(),
            });
        }
        bail!("account endpoint {} has no credential configured", self.host)
    }
}

#[derive(Clone)]
pub enum Credential {
    Password { password: String },
    OAuth2 { token: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LocalEndpoint {
    Maildir { path: PathBuf },
    Imap(ImapEndpoint),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncOptions {
    /// How far back to sync: a number of days or a YYYY-MM-DD date.
    pub maxage: Option<MaxAge>,
    /// Alternative spelling of an absolute cutoff date.
    pub startdate: Option<NaiveDate>,
    /// Skip messages larger than this many bytes.
    pub maxsize: Option<u32>,
    #[serde(default = "default_true")]
    pub sync_deletes: bool,
    /// Headers stripped from a message before APPEND.
    #[serde(default)]
    pub filterheaders: Vec<String>,
    #[serde(default = "default_true")]
    pub expunge: bool,
    #[serde(default)]
    pub utf8foldernames: bool,
    #[serde(default = "default_retrycount")]
    pub retrycount: u32,
    /// Folders to hold in IDLE between sync rounds.
    #[serde(default)]
    pub idle_folders: Vec<String>,
    /// Regexes over visible folder names; empty means sync everything.
    #[serde(default)]
    pub folderfilter: Vec<String>,
    /// Ordered rewrite rules applied to incoming folder names.
    #[serde(default)]
    pub nametrans: Vec<NameRule>,
    /// Per-folder UID sequences excluded from the copy pass.
    #[serde(default)]
    pub copy_ignore: BTreeMap<String, String>,
    /// Shell command run once per folder pass that copied new mail.
    pub newmail_hook: Option<String>,
    /// Keyword -> flag-letter mapping for the destination.
    #[serde(default)]
    pub keyword_map: BTreeMap<String, char>,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            maxage: None,
            startdate: None,
            maxsize: None,
            sync_deletes: true,
            filterheaders: Vec::new(),
            expunge: true,
            utf8foldernames: false,
            retrycount: default_retrycount(),
            idle_folders: Vec::new(),
            folderfilter: Vec::new(),
            nametrans: Vec::new(),
            copy_ignore: BTreeMap::new(),
            newmail_hook: None,
            keyword_map: BTreeMap::new(),
            dry_run: false,
        }
    }
}

impl SyncOptions {
    /// The effective cutoff date, if any. `startdate` wins over
    /// `maxage` when both are given.
    pub fn min_date(&self) -> Option<NaiveDate> {
        if let Some(date) = self.startdate {
            return Some(date);
        }
        match &self.maxage {
            Some(MaxAge::Days(days)) => {
                Some(Utc::now().date_naive() - Duration::days(i64::from(*days)))
            }
            Some(MaxAge::Date(date)) => Some(*date),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MaxAge {
    Days(u32),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameRule {
    pub pattern: String,
    pub replace: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        for account in &config.accounts {
            if account.name.is_empty() {
                bail!("account with empty name in {}", path.display());
            }
        }
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        env::var("TERN_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::config_dir().map(|d| d.join("tern").join("tern.toml")))
            .unwrap_or_else(|| PathBuf::from("tern.toml"))
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_copy_workers() -> usize {
    4
}

fn default_imap_port() -> u16 {
    993
}

fn default_retrycount() -> u32 {
    2
}
