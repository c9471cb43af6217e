// src/doctor.rs

//! Health checks for a cmam root
//!
//! `diagnose` never modifies anything; it collects findings about the
//! manifest, installed files, markers, PATH registration and leftovers of
//! interrupted work. `cmam doctor --fix` runs [`ManifestStore::repair`] and
//! diagnoses again.

use crate::error::Error;
use crate::hash;
use crate::layout::Layout;
use crate::manifest::{Manifest, ManifestLock, ManifestStore, reconcile};
use crate::search_path::{PathRegistrar, UserPathScope};
use crate::transaction::Journal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Ok => write!(f, "ok"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Short name of the check that produced it
    pub check: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn new(check: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            check,
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    fn push(&mut self, check: &'static str, severity: Severity, message: impl Into<String>) {
        self.findings.push(Finding::new(check, severity, message));
    }

    /// The most severe finding, `Ok` for an empty report
    pub fn worst(&self) -> Severity {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Ok)
    }

    pub fn has_errors(&self) -> bool {
        self.worst() == Severity::Error
    }

    pub fn problems(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity != Severity::Ok)
    }

    /// Plain-text rendering, one finding per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for finding in &self.findings {
            out.push_str(&format!(
                "[{:>7}] {}: {}\n",
                finding.severity, finding.check, finding.message
            ));
        }
        let problems = self.problems().count();
        if problems == 0 {
            out.push_str("No problems found.\n");
        } else {
            out.push_str(&format!("{} problem(s) found.\n", problems));
        }
        out
    }
}

/// Run every check against `layout`
pub fn diagnose<S: UserPathScope>(
    layout: &Layout,
    store: &ManifestStore,
    registrar: &PathRegistrar<S>,
) -> DoctorReport {
    let mut report = DoctorReport::default();

    if let Some(manifest) = check_manifest(store, &mut report) {
        check_installed_files(&manifest, &mut report);
    }
    check_markers(layout, &mut report);
    check_search_path(layout, registrar, &mut report);
    check_leftovers(layout, store, &mut report);

    report
}

fn check_manifest(store: &ManifestStore, report: &mut DoctorReport) -> Option<Manifest> {
    const CHECK: &str = "manifest";
    match store.load() {
        Ok(manifest) => {
            report.push(
                CHECK,
                Severity::Ok,
                format!("{} records {} package(s)", store.path().display(), manifest.len()),
            );
            Some(manifest)
        }
        Err(Error::ManifestCorruption { path, unresolved }) => {
            report.push(
                CHECK,
                Severity::Error,
                format!(
                    "{} is corrupt and cannot be rebuilt automatically (run `cmam doctor --fix`)",
                    path.display()
                ),
            );
            for item in unresolved {
                report.push(CHECK, Severity::Error, item);
            }
            None
        }
        Err(e) => {
            report.push(CHECK, Severity::Error, e.to_string());
            None
        }
    }
}

fn check_installed_files(manifest: &Manifest, report: &mut DoctorReport) {
    const CHECK: &str = "files";
    let mut verified = 0;
    for entry in manifest.iter() {
        match hash::digest_file_if_exists(&entry.install_path) {
            Ok(Some(actual)) if actual == entry.digest => verified += 1,
            Ok(Some(actual)) => report.push(
                CHECK,
                Severity::Error,
                format!(
                    "{} {}: {} has digest {}, expected {}",
                    entry.name,
                    entry.version,
                    entry.install_path.display(),
                    actual.short(),
                    entry.digest.short()
                ),
            ),
            Ok(None) => report.push(
                CHECK,
                Severity::Error,
                format!(
                    "{} {}: {} is missing",
                    entry.name,
                    entry.version,
                    entry.install_path.display()
                ),
            ),
            Err(e) => report.push(CHECK, Severity::Error, format!("{}: {}", entry.name, e)),
        }

        if let Some(backup) = &entry.backup {
            if !backup.path.exists() {
                report.push(
                    "backups",
                    Severity::Warning,
                    format!(
                        "{}: referenced backup #{} at {} is gone",
                        entry.name,
                        backup.sequence,
                        backup.path.display()
                    ),
                );
            }
        }
    }
    if verified > 0 {
        report.push(CHECK, Severity::Ok, format!("{} installed file(s) verified", verified));
    }
}

fn check_markers(layout: &Layout, report: &mut DoctorReport) {
    const CHECK: &str = "markers";
    let scan = match reconcile::reconcile(layout) {
        Ok(scan) => scan,
        Err(e) => {
            report.push(CHECK, Severity::Warning, format!("reconciliation scan failed: {}", e));
            return;
        }
    };
    // Markers only decide anything when the manifest is unreadable
    for discrepancy in &scan.discrepancies {
        report.push(CHECK, Severity::Warning, discrepancy.to_string());
    }
}

fn check_search_path<S: UserPathScope>(
    layout: &Layout,
    registrar: &PathRegistrar<S>,
    report: &mut DoctorReport,
) {
    const CHECK: &str = "path";
    let scripts = layout.scripts_dir();
    match registrar.verify(&scripts) {
        Ok(true) => report.push(
            CHECK,
            Severity::Ok,
            format!("{} is registered in {}", scripts.display(), registrar.scope().describe()),
        ),
        Ok(false) => report.push(
            CHECK,
            Severity::Warning,
            format!(
                "{} is not registered in {}; installed programs are not on PATH",
                scripts.display(),
                registrar.scope().describe()
            ),
        ),
        Err(e) => report.push(CHECK, Severity::Warning, e.to_string()),
    }
    if !registrar.visible_in_process(&scripts) {
        report.push(
            CHECK,
            Severity::Warning,
            "the current shell does not see the install directory yet; start a new shell",
        );
    }
}

fn check_leftovers(layout: &Layout, store: &ManifestStore, report: &mut DoctorReport) {
    const CHECK: &str = "recovery";
    match Journal::scan(layout) {
        Ok(journals) if !journals.is_empty() => report.push(
            CHECK,
            Severity::Warning,
            format!(
                "{} interrupted transaction(s) in {}; the next cmam command recovers them",
                journals.len(),
                layout.staging_root().display()
            ),
        ),
        Ok(_) => {}
        Err(e) => report.push(CHECK, Severity::Warning, e.to_string()),
    }

    if layout.pending_swap_path().exists() {
        report.push(
            CHECK,
            Severity::Warning,
            "a self-update is staged and completes on the next launch",
        );
    }

    match store.try_lock() {
        Ok(Some(_guard)) => {}
        Ok(None) => report.push(
            "lock",
            Severity::Warning,
            format!(
                "manifest lock is held by {}",
                ManifestLock::holder(&layout.manifest_lock_path())
                    .unwrap_or_else(|| "another process".to_string())
            ),
        ),
        Err(e) => report.push("lock", Severity::Warning, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::InstalledPackage;
    use crate::search_path::{MemoryScope, SearchPath};
    use std::fs;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Layout, ManifestStore) {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        layout.ensure().unwrap();
        let store = ManifestStore::new(&layout, Duration::from_millis(100));
        (temp, layout, store)
    }

    fn registrar(layout: &Layout) -> PathRegistrar<MemoryScope> {
        let registrar = PathRegistrar::new(MemoryScope::new(SearchPath::default()));
        registrar.ensure_registered(&layout.scripts_dir()).unwrap();
        registrar
    }

    #[test]
    fn test_clean_root_has_no_errors() {
        let (_temp, layout, store) = setup();
        let report = diagnose(&layout, &store, &registrar(&layout));
        assert!(!report.has_errors());
        assert!(report.render().contains("manifest"));
    }

    #[test]
    fn test_tampered_file_is_an_error() {
        let (_temp, layout, store) = setup();
        let path = layout.install_path("tool");
        fs::write(&path, b"v1").unwrap();
        let entry = InstalledPackage::new("tool", "1.0.0", hash::digest(b"v1"), path.clone());
        store
            .with_transaction(|m| {
                m.insert(entry.clone());
                Ok(())
            })
            .unwrap();
        reconcile::write_marker(&layout, &entry).unwrap();

        fs::write(&path, b"tampered").unwrap();
        let report = diagnose(&layout, &store, &registrar(&layout));
        assert!(report.has_errors());
        assert!(report.problems().any(|f| f.check == "files"));
    }

    #[test]
    fn test_unregistered_path_is_a_warning() {
        let (_temp, layout, store) = setup();
        let registrar = PathRegistrar::new(MemoryScope::new(SearchPath::default()));
        let report = diagnose(&layout, &store, &registrar);
        assert_eq!(report.worst(), Severity::Warning);
        assert!(report.problems().any(|f| f.check == "path"));
    }

    #[test]
    fn test_leftover_staging_is_reported() {
        let (_temp, layout, store) = setup();
        fs::create_dir_all(layout.staging_dir("tx-1")).unwrap();
        let report = diagnose(&layout, &store, &registrar(&layout));
        assert!(report.problems().any(|f| f.check == "recovery"));
    }
}
