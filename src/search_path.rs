// src/search_path.rs

//! Keeping the install root on the user's executable search path
//!
//! [`SearchPath`] is an ordered list of directories with platform-aware
//! comparison. The persisted user-level value sits behind [`UserPathScope`]:
//! on Windows `RegistryScope` edits the user `Path` in the registry, elsewhere
//! [`ProfileScope`] keeps it in a managed block of the user's shell profile.
//! Only the user scope is ever modified.

use crate::error::{Error, Result};
use crate::fsutil;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

const BLOCK_START: &str = "# >>> cmam PATH >>>";
const BLOCK_END: &str = "# <<< cmam PATH <<<";

/// Ordered, de-duplicable list of search directories
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    entries: Vec<PathBuf>,
}

impl SearchPath {
    /// Split a PATH-style value; empty components are dropped
    pub fn parse(value: &OsStr) -> Self {
        Self {
            entries: std::env::split_paths(value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
        }
    }

    /// The current process's `PATH`
    pub fn from_env() -> Self {
        std::env::var_os("PATH")
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn contains(&self, dir: &Path) -> bool {
        let wanted = normalize(dir);
        self.entries.iter().any(|e| normalize(e) == wanted)
    }

    /// Append `dir` unless an equivalent entry exists
    pub fn push_unique(&mut self, dir: PathBuf) -> bool {
        if self.contains(&dir) {
            return false;
        }
        self.entries.push(dir);
        true
    }

    /// Drop later duplicates, keeping first occurrences in order
    pub fn dedup(&mut self) -> bool {
        let before = self.entries.len();
        let mut seen = Vec::with_capacity(before);
        self.entries.retain(|entry| {
            let key = normalize(entry);
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
        self.entries.len() != before
    }

    pub fn join(&self) -> Result<OsString> {
        std::env::join_paths(&self.entries)
            .map_err(|e| Error::Config(format!("Cannot build PATH value: {}", e)))
    }
}

/// Comparison key: trailing separators ignored, case-folded on Windows
fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches(['/', '\\']);
    let trimmed = if trimmed.is_empty() { &text[..1.min(text.len())] } else { trimmed };
    if cfg!(windows) {
        trimmed.replace('/', "\\").to_lowercase()
    } else {
        trimmed.to_string()
    }
}

/// Persisted user-level search path
pub trait UserPathScope {
    fn read(&self) -> Result<SearchPath>;
    fn write(&self, path: &SearchPath) -> Result<()>;
    /// Human-readable location, for messages
    fn describe(&self) -> String;
}

/// Managed block in a shell profile
///
/// ```text
/// # >>> cmam PATH >>>
/// export PATH="/home/me/.cmam/scripts:$PATH"
/// # <<< cmam PATH <<<
/// ```
///
/// Lines outside the block are never touched.
#[derive(Debug, Clone)]
pub struct ProfileScope {
    profile: PathBuf,
}

impl ProfileScope {
    pub fn new(profile: impl Into<PathBuf>) -> Self {
        Self {
            profile: profile.into(),
        }
    }

    fn contents(&self) -> Result<String> {
        match fs::read_to_string(&self.profile) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::io(format!("Failed to read {}", self.profile.display()), e)),
        }
    }

    fn render_block(path: &SearchPath) -> Result<String> {
        for entry in path.entries() {
            let text = entry.to_string_lossy();
            if text.contains(['"', '$', '`', '\n']) {
                return Err(Error::Config(format!(
                    "Refusing to write PATH entry with shell metacharacters: {}",
                    text
                )));
            }
        }
        let joined = path.join()?;
        let sep = if cfg!(windows) { ';' } else { ':' };
        Ok(format!(
            "{}\nexport PATH=\"{}{}$PATH\"\n{}\n",
            BLOCK_START,
            joined.to_string_lossy(),
            sep,
            BLOCK_END
        ))
    }
}

/// Split profile text into (before, block body, after)
fn split_block(contents: &str) -> Option<(&str, &str, &str)> {
    let start = contents.find(BLOCK_START)?;
    let body_start = start + BLOCK_START.len();
    let end = body_start + contents[body_start..].find(BLOCK_END)?;
    let after_start = end + BLOCK_END.len();
    let after = contents[after_start..]
        .strip_prefix('\n')
        .unwrap_or(&contents[after_start..]);
    Some((&contents[..start], &contents[body_start..end], after))
}

impl UserPathScope for ProfileScope {
    fn read(&self) -> Result<SearchPath> {
        let contents = self.contents()?;
        let Some((_, body, _)) = split_block(&contents) else {
            return Ok(SearchPath::default());
        };

        for line in body.lines() {
            let Some(value) = line
                .trim()
                .strip_prefix("export PATH=\"")
                .and_then(|rest| rest.strip_suffix('"'))
            else {
                continue;
            };
            let value = value
                .strip_suffix("$PATH")
                .map(|v| v.trim_end_matches([':', ';']))
                .unwrap_or(value);
            return Ok(SearchPath::parse(OsStr::new(value)));
        }
        Ok(SearchPath::default())
    }

    fn write(&self, path: &SearchPath) -> Result<()> {
        let contents = self.contents()?;
        let block = if path.entries().is_empty() {
            String::new()
        } else {
            Self::render_block(path)?
        };

        let updated = match split_block(&contents) {
            Some((before, _, after)) => format!("{}{}{}", before, block, after),
            None if block.is_empty() => contents,
            None if contents.is_empty() || contents.ends_with('\n') => {
                format!("{}{}", contents, block)
            }
            None => format!("{}\n{}", contents, block),
        };

        debug!("Writing PATH block to {}", self.profile.display());
        fsutil::write_atomic(&self.profile, updated.as_bytes())
    }

    fn describe(&self) -> String {
        format!("shell profile {}", self.profile.display())
    }
}

/// In-memory scope for embedders and tests
#[derive(Debug, Default)]
pub struct MemoryScope {
    value: Mutex<SearchPath>,
}

impl MemoryScope {
    pub fn new(initial: SearchPath) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl UserPathScope for MemoryScope {
    fn read(&self) -> Result<SearchPath> {
        Ok(self
            .value
            .lock()
            .map_err(|_| Error::Config("PATH scope poisoned".to_string()))?
            .clone())
    }

    fn write(&self, path: &SearchPath) -> Result<()> {
        *self
            .value
            .lock()
            .map_err(|_| Error::Config("PATH scope poisoned".to_string()))? = path.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory PATH".to_string()
    }
}

/// `Path` under `HKEY_CURRENT_USER\Environment`, the user scope on Windows
///
/// The value keeps its registry type (`REG_EXPAND_SZ` entries such as
/// `%USERPROFILE%\bin` stay unexpanded). Every write is followed by a
/// `WM_SETTINGCHANGE` broadcast so new shells pick it up.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryScope;

#[cfg(windows)]
impl RegistryScope {
    const KEY: &'static str = "Environment";
    const VALUE: &'static str = "Path";

    pub fn new() -> Self {
        Self
    }

    fn open(flags: u32) -> Result<winreg::RegKey> {
        winreg::RegKey::predef(winreg::enums::HKEY_CURRENT_USER)
            .open_subkey_with_flags(Self::KEY, flags)
            .map_err(|e| Error::io("Failed to open HKEY_CURRENT_USER\\Environment", e))
    }

    fn raw(key: &winreg::RegKey) -> Result<Option<winreg::RegValue>> {
        match key.get_raw_value(Self::VALUE) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io("Failed to read the user Path", e)),
        }
    }
}

#[cfg(windows)]
impl UserPathScope for RegistryScope {
    fn read(&self) -> Result<SearchPath> {
        use winreg::types::FromRegValue;

        let key = Self::open(winreg::enums::KEY_READ)?;
        let Some(raw) = Self::raw(&key)? else {
            return Ok(SearchPath::default());
        };
        let value = String::from_reg_value(&raw)
            .map_err(|e| Error::io("Failed to decode the user Path", e))?;
        Ok(SearchPath::parse(OsStr::new(&value)))
    }

    fn write(&self, path: &SearchPath) -> Result<()> {
        use winreg::enums::{KEY_READ, KEY_WRITE, RegType};

        let key = Self::open(KEY_READ | KEY_WRITE)?;
        let vtype = Self::raw(&key)?
            .map(|raw| raw.vtype)
            .unwrap_or(RegType::REG_EXPAND_SZ);
        let value = winreg::RegValue {
            bytes: encode_reg_string(&path.join()?),
            vtype,
        };
        key.set_raw_value(Self::VALUE, &value)
            .map_err(|e| Error::io("Failed to write the user Path", e))?;

        broadcast_environment_change();
        Ok(())
    }

    fn describe(&self) -> String {
        "user PATH (HKEY_CURRENT_USER\\Environment)".to_string()
    }
}

/// UTF-16LE with a terminating NUL, as `REG_SZ`/`REG_EXPAND_SZ` expect
#[cfg(windows)]
fn encode_reg_string(value: &OsStr) -> Vec<u8> {
    use std::os::windows::ffi::OsStrExt;

    value
        .encode_wide()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Tell running programs (Explorer, new terminals) that the environment changed
#[cfg(windows)]
fn broadcast_environment_change() {
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        HWND_BROADCAST, SMTO_ABORTIFHUNG, SendMessageTimeoutW, WM_SETTINGCHANGE,
    };

    let area: Vec<u16> = "Environment".encode_utf16().chain(std::iter::once(0)).collect();
    let mut result = 0usize;
    // SAFETY: `area` is a NUL-terminated UTF-16 string that outlives the call
    let sent = unsafe {
        SendMessageTimeoutW(
            HWND_BROADCAST,
            WM_SETTINGCHANGE,
            0,
            area.as_ptr() as isize,
            SMTO_ABORTIFHUNG,
            5000,
            &mut result,
        )
    };
    if sent == 0 {
        debug!("WM_SETTINGCHANGE broadcast timed out; new logins still see the change");
    }
}

/// Idempotent registration of a directory in a user scope
pub struct PathRegistrar<S> {
    scope: S,
}

impl<S: UserPathScope> PathRegistrar<S> {
    pub fn new(scope: S) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &S {
        &self.scope
    }

    /// Make sure `dir` is on the user search path exactly once
    ///
    /// Existing duplicates are collapsed, order is preserved, and nothing is
    /// written when the value is already correct. Returns whether the
    /// persisted value changed.
    pub fn ensure_registered(&self, dir: &Path) -> Result<bool> {
        let dir = std::path::absolute(dir)
            .map_err(|e| Error::io(format!("Failed to resolve {}", dir.display()), e))?;

        let mut path = self.scope.read()?;
        let mut changed = path.dedup();
        changed |= path.push_unique(dir.clone());

        if !changed {
            debug!("{} already registered in {}", dir.display(), self.scope.describe());
            return Ok(false);
        }

        self.scope.write(&path)?;
        info!("Added {} to {}", dir.display(), self.scope.describe());
        Ok(true)
    }

    /// Whether `dir` is registered in the user scope
    pub fn verify(&self, dir: &Path) -> Result<bool> {
        let dir = std::path::absolute(dir)
            .map_err(|e| Error::io(format!("Failed to resolve {}", dir.display()), e))?;
        Ok(self.scope.read()?.contains(&dir))
    }

    /// Whether the running process can already see `dir` on its PATH
    pub fn visible_in_process(&self, dir: &Path) -> bool {
        SearchPath::from_env().contains(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_path(entries: &[&str]) -> SearchPath {
        let joined = std::env::join_paths(entries).unwrap();
        SearchPath::parse(&joined)
    }

    #[cfg(windows)]
    #[test]
    fn test_registry_string_encoding_round_trips() {
        use winreg::types::FromRegValue;

        let value = OsStr::new(r"C:\Users\me\.cmam\scripts;%USERPROFILE%\bin");
        let raw = winreg::RegValue {
            bytes: encode_reg_string(value),
            vtype: winreg::enums::RegType::REG_EXPAND_SZ,
        };
        assert_eq!(raw.bytes.len(), (value.len() + 1) * 2);
        assert_eq!(String::from_reg_value(&raw).unwrap(), value.to_string_lossy());
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_paths_compare_case_insensitively() {
        let path = search_path(&[r"C:\Users\Me\.cmam\Scripts\"]);
        assert!(path.contains(Path::new(r"c:\users\me\.cmam\scripts")));
        assert!(path.contains(Path::new("C:/Users/me/.cmam/scripts")));
    }

    #[test]
    fn test_contains_ignores_trailing_separator() {
        let path = search_path(&["/usr/bin", "/opt/tools/"]);
        assert!(path.contains(Path::new("/opt/tools")));
        assert!(path.contains(Path::new("/usr/bin/")));
        assert!(!path.contains(Path::new("/opt")));
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let mut path = search_path(&["/a", "/b", "/a/", "/c", "/b"]);
        assert!(path.dedup());
        assert_eq!(
            path.entries(),
            &[PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
        assert!(!path.dedup());
    }

    #[test]
    fn test_ensure_registered_is_idempotent() {
        let registrar = PathRegistrar::new(MemoryScope::new(search_path(&["/usr/bin"])));
        let dir = Path::new("/home/me/.cmam/scripts");

        assert!(registrar.ensure_registered(dir).unwrap());
        assert!(!registrar.ensure_registered(dir).unwrap());
        assert!(registrar.verify(dir).unwrap());

        let value = registrar.scope().read().unwrap();
        assert_eq!(value.entries().len(), 2);
        assert_eq!(value.entries()[0], PathBuf::from("/usr/bin"));
    }

    #[test]
    fn test_ensure_registered_collapses_duplicates() {
        let dir = "/home/me/.cmam/scripts";
        let registrar = PathRegistrar::new(MemoryScope::new(search_path(&[dir, "/x", dir])));

        assert!(registrar.ensure_registered(Path::new(dir)).unwrap());
        let value = registrar.scope().read().unwrap();
        assert_eq!(value, search_path(&[dir, "/x"]));
    }

    #[test]
    fn test_profile_scope_preserves_surrounding_lines() {
        let temp = tempfile::tempdir().unwrap();
        let profile = temp.path().join(".profile");
        fs::write(&profile, "alias ll='ls -l'\nexport EDITOR=vi").unwrap();

        let registrar = PathRegistrar::new(ProfileScope::new(&profile));
        let dir = temp.path().join("scripts");
        assert!(registrar.ensure_registered(&dir).unwrap());
        assert!(!registrar.ensure_registered(&dir).unwrap());

        let contents = fs::read_to_string(&profile).unwrap();
        assert!(contents.starts_with("alias ll='ls -l'\nexport EDITOR=vi\n"));
        assert_eq!(contents.matches(BLOCK_START).count(), 1);
        assert!(contents.contains(&format!("export PATH=\"{}", dir.display())));
        assert!(registrar.verify(&dir).unwrap());

        // A second directory lands in the same block, after the first
        let other = temp.path().join("more");
        registrar.ensure_registered(&other).unwrap();
        let value = registrar.scope().read().unwrap();
        assert_eq!(value.entries(), &[dir, other]);
        let contents = fs::read_to_string(&profile).unwrap();
        assert_eq!(contents.matches(BLOCK_END).count(), 1);
    }

    #[test]
    fn test_profile_scope_rejects_shell_metacharacters() {
        let temp = tempfile::tempdir().unwrap();
        let scope = ProfileScope::new(temp.path().join(".profile"));
        let bad = search_path(&["/tmp/$(evil)"]);
        assert!(matches!(scope.write(&bad), Err(Error::Config(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_profile_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        // Root ignores directory permissions
        let probe = locked.join("probe");
        if fs::write(&probe, b"x").is_ok() {
            return;
        }

        let registrar = PathRegistrar::new(ProfileScope::new(locked.join(".profile")));
        let err = registrar
            .ensure_registered(&temp.path().join("scripts"))
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }
}
