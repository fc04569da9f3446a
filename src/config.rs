use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration, built once at startup and passed by reference
/// everywhere. Values come from an optional TOML file; credentials and the
/// search-term list can be overridden from the environment (`EMAIL_USER`,
/// `EMAIL_PASS`, `TELEGRAM_TOKEN`, `TELEGRAM_CHAT_ID`, `SEARCH_TERMS`,
/// `IMAP_SERVER`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub imap: ImapConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub seen: SeenConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImapConfig {
    #[serde(default = "default_imap_server")]
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Restrict the UNSEEN search to messages from this sender.
    #[serde(default)]
    pub from_filter: Option<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Destination chat. Negative ids are groups; 0 means unset.
    #[serde(default)]
    pub chat_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default)]
    pub search_terms: Vec<String>,
    /// When a message has no direct match, fetch links from its body and
    /// scan the fetched pages for the same terms.
    #[serde(default = "default_true")]
    pub follow_links: bool,
    /// Flag unmatched messages \Deleted and expunge instead of marking
    /// them \Seen.
    #[serde(default)]
    pub delete_unmatched: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SeenConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    /// Seen-state rows older than this are pruned at the end of a run.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Cron expression for --watch mode (seconds field included).
    #[serde(default = "default_cron")]
    pub cron: String,
}

fn default_imap_server() -> String {
    "imap.gmail.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("mailwatch.db")
}

fn default_retention_days() -> u32 {
    30
}

fn default_cron() -> String {
    // Every five minutes, matching the original cron trigger.
    "0 */5 * * * *".to_string()
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: default_imap_server(),
            port: default_imap_port(),
            mailbox: default_mailbox(),
            from_filter: None,
            user: String::new(),
            password: String::new(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            search_terms: Vec::new(),
            follow_links: true,
            delete_unmatched: false,
        }
    }
}

impl Default for SeenConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
        }
    }
}

/// Split a comma-separated term list, trimming whitespace and dropping
/// empty segments. Terms may be non-Latin (e.g. "מומה,Moma").
pub fn parse_search_terms(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load configuration from `path` if it exists (defaults otherwise),
    /// then apply environment overrides and validate required values.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// File-supplied term lists get the same trim/drop-empty treatment as
    /// `SEARCH_TERMS`; an empty-string term would otherwise match every
    /// message.
    fn normalize(&mut self) {
        self.matching.search_terms = self
            .matching
            .search_terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("IMAP_SERVER") {
            self.imap.server = v;
        }
        if let Ok(v) = std::env::var("EMAIL_USER") {
            self.imap.user = v;
        }
        if let Ok(v) = std::env::var("EMAIL_PASS") {
            self.imap.password = v;
        }
        if let Ok(v) = std::env::var("TELEGRAM_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v
                .trim()
                .parse()
                .with_context(|| format!("TELEGRAM_CHAT_ID is not a valid chat id: {v}"))?;
        }
        if let Ok(v) = std::env::var("SEARCH_TERMS") {
            self.matching.search_terms = parse_search_terms(&v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.imap.user.is_empty() {
            bail!("mailbox user is not set ([imap] user or EMAIL_USER)");
        }
        if self.imap.password.is_empty() {
            bail!("mailbox password is not set ([imap] password or EMAIL_PASS)");
        }
        if self.telegram.bot_token.is_empty() {
            bail!("bot token is not set ([telegram] bot_token or TELEGRAM_TOKEN)");
        }
        if self.telegram.chat_id == 0 {
            bail!("chat id is not set ([telegram] chat_id or TELEGRAM_CHAT_ID)");
        }
        if self.matching.search_terms.is_empty() {
            bail!("no search terms configured ([matching] search_terms or SEARCH_TERMS)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_terms_counts_non_empty_segments() {
        assert_eq!(parse_search_terms("a,b,c").len(), 3);
        assert_eq!(parse_search_terms("a,,c").len(), 2);
        assert_eq!(parse_search_terms("  a  , b ").len(), 2);
        assert_eq!(parse_search_terms("").len(), 0);
        assert_eq!(parse_search_terms(",,,").len(), 0);
    }

    #[test]
    fn parse_terms_trims_and_keeps_non_latin() {
        let terms = parse_search_terms("מומה, Moma ");
        assert_eq!(terms, vec!["מומה".to_string(), "Moma".to_string()]);
    }

    #[test]
    fn toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [imap]
            user = "me@example.com"
            password = "hunter2"

            [telegram]
            bot_token = "123:abc"
            chat_id = 42

            [matching]
            search_terms = ["Moma"]
            "#,
        )
        .unwrap();

        assert_eq!(config.imap.server, "imap.gmail.com");
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.imap.mailbox, "INBOX");
        assert!(config.matching.follow_links);
        assert!(!config.matching.delete_unmatched);
        assert_eq!(config.watch.cron, "0 */5 * * * *");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn normalize_trims_and_drops_empty_file_terms() {
        let mut config: Config = toml::from_str(
            r#"
            [matching]
            search_terms = [" Moma ", "", "   ", "מומה"]
            "#,
        )
        .unwrap();

        config.normalize();
        assert_eq!(
            config.matching.search_terms,
            vec!["Moma".to_string(), "מומה".to_string()]
        );
    }

    #[test]
    fn whitespace_only_terms_fail_validation() {
        let mut config: Config = toml::from_str(
            r#"
            [imap]
            user = "me@example.com"
            password = "hunter2"

            [telegram]
            bot_token = "123:abc"
            chat_id = 42

            [matching]
            search_terms = ["", "   "]
            "#,
        )
        .unwrap();

        config.normalize();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn default_cron_is_a_valid_schedule() {
        let job = tokio_cron_scheduler::Job::new_async(default_cron().as_str(), |_uuid, _lock| {
            Box::pin(async {})
        });
        assert!(job.is_ok());
    }

    #[test]
    fn validate_rejects_missing_credentials() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str(
            r#"
            [imap]
            user = "me@example.com"
            password = "hunter2"

            [telegram]
            bot_token = "123:abc"
            chat_id = 42
            "#,
        )
        .unwrap();
        // Credentials present but no search terms.
        assert!(config.validate().is_err());
    }
}
