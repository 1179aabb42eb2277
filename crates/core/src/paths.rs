use std::path::PathBuf;

/// Environment variable that overrides the base directory.
pub const HOME_ENV: &str = "REPLYDESK_HOME";

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        if let Ok(custom) = std::env::var(HOME_ENV) {
            if !custom.trim().is_empty() {
                return Self { base: PathBuf::from(custom) };
            }
        }
        let base = dirs::home_dir()
            .map(|h| h.join(".replydesk"))
            .unwrap_or_else(|| PathBuf::from(".replydesk"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn rules_file(&self) -> PathBuf {
        self.base.join("rules.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_file(&self, identity: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.session", safe_file_stem(identity)))
    }

    /// Browser profile directory handed to the automation driver.
    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn profile_dir(&self, name: &str) -> PathBuf {
        self.profiles_dir().join(safe_file_stem(name))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.profiles_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an arbitrary identity to a single path component.
///
/// Reversible: bytes outside `[A-Za-z0-9@.-]` (including `_` and `%`) become
/// `%XX`, and so does a leading `.`, so distinct identities never share a file.
fn safe_file_stem(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for (i, byte) in raw.bytes().enumerate() {
        match byte {
            b'.' if i == 0 => out.push_str("%2E"),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'@' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
