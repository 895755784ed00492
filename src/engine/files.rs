//! Filesystem steps of the apply pipeline: pending files, backups and
//! the scratch directory handed to the configuration check.
//!
//! Every file that lands on a live path gets there through `rename` from
//! a sibling in the same directory, so readers never see a partial file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use log::{debug, warn};

/// A file written next to its destination, removed on drop unless it was
/// renamed into place with `commit_to`.
pub(crate) struct PendingFile {
    path: PathBuf,
    armed: bool,
}

impl PendingFile {
    /// Write `contents` to `path`.  With `mode`, the file is created with
    /// exactly those permissions; otherwise it copies them from `like`.
    pub(crate) fn write(
        path: PathBuf,
        contents: &[u8],
        mode: Option<u32>,
        like: Option<&Path>,
    ) -> io::Result<Self> {
        // Stale leftovers from an interrupted run must not keep their mode.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if let Some(mode) = mode {
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        let pending = Self { path, armed: true };
        let mut file = options.open(&pending.path)?;
        file.write_all(contents)?;
        file.sync_all()?;

        if mode.is_none() {
            if let Some(live) = like.filter(|p| p.exists()) {
                fs::set_permissions(&pending.path, fs::metadata(live)?.permissions())?;
            }
        }
        Ok(pending)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the file onto `target`.
    pub(crate) fn commit_to(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove {}: {e}", self.path.display());
                }
            }
        }
    }
}

/// `<dir>/<name>.pending`
pub(crate) fn pending_path(live: &Path) -> PathBuf {
    sibling(live, "pending")
}

fn sibling(live: &Path, suffix: &str) -> PathBuf {
    let name = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    live.with_file_name(format!("{name}.{suffix}"))
}

/// One live file and where its pre-apply content was saved.
#[derive(Debug)]
struct Backup {
    live: PathBuf,
    /// `None` when the live file did not exist before the apply.
    saved: Option<PathBuf>,
}

/// Copies of every file an apply may touch, taken before the first rename.
#[derive(Debug, Default)]
pub(crate) struct BackupSet {
    items: Vec<Backup>,
}

impl BackupSet {
    /// Copy each of `files` into `dir` as `<name>.<UTC timestamp>`.
    pub(crate) fn take(dir: &Path, files: &[&Path]) -> io::Result<Self> {
        create_private_dir(dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();

        let mut items = Vec::with_capacity(files.len());
        for live in files {
            let saved = if live.exists() {
                let name = live
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let target = dir.join(format!("{name}.{stamp}"));
                fs::copy(live, &target)?;
                debug!("Backed up {} to {}", live.display(), target.display());
                Some(target)
            } else {
                None
            };
            items.push(Backup {
                live: live.to_path_buf(),
                saved,
            });
        }
        Ok(Self { items })
    }

    /// Put every live file back the way it was.  Files that did not exist
    /// before are removed.
    pub(crate) fn restore(&self) -> io::Result<Restored> {
        let mut done = Restored::default();
        for item in &self.items {
            match &item.saved {
                Some(saved) => {
                    let tmp = sibling(&item.live, "restore");
                    fs::copy(saved, &tmp)?;
                    fs::rename(&tmp, &item.live)?;
                    done.restored.push(item.live.clone());
                }
                None => {
                    match fs::remove_file(&item.live) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                    done.removed.push(item.live.clone());
                }
            }
            debug!("Restored {}", item.live.display());
        }
        Ok(done)
    }
}

/// What `BackupSet::restore` did to each live file.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Restored {
    /// Files put back from a saved copy.
    pub(crate) restored: Vec<PathBuf>,
    /// Files that did not exist before and were deleted.
    pub(crate) removed: Vec<PathBuf>,
}

impl Restored {
    pub(crate) fn was_removed(&self, path: &Path) -> bool {
        self.removed.iter().any(|p| p == path)
    }
}

/// Keep the newest `keep` backups of `file_name` in `dir` (0 keeps all).
/// Returns how many were deleted.
pub(crate) fn prune_backups(dir: &Path, file_name: &str, keep: usize) -> io::Result<usize> {
    if keep == 0 || !dir.exists() {
        return Ok(0);
    }
    let prefix = format!("{file_name}.");
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            // Another managed file may share the prefix (`main.cf` / `main.cf.d`).
            name.strip_prefix(&prefix)
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .collect();
    names.sort();

    let excess = names.len().saturating_sub(keep);
    for name in &names[..excess] {
        fs::remove_file(dir.join(name))?;
    }
    Ok(excess)
}

/// Create `dir` (and parents) readable only by the owner.
pub(crate) fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// A throwaway configuration directory for the check command.
pub(crate) struct ScratchDir {
    path: PathBuf,
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ScratchDir {
    /// Create a fresh directory under `base`, seeded with `companions`
    /// copied from `config_dir` (missing ones are skipped) and the
    /// candidate written as `main_name`.
    pub(crate) fn prepare(
        base: &Path,
        config_dir: &Path,
        companions: &[String],
        main_name: &str,
        candidate: &str,
    ) -> io::Result<Self> {
        create_private_dir(base)?;
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{}-{n}", std::process::id()));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        create_private_dir(&path)?;
        let scratch = Self { path };

        for name in companions {
            let source = config_dir.join(name);
            if source.is_file() {
                fs::copy(&source, scratch.path.join(name))?;
            }
        }
        fs::write(scratch.main_file(main_name), candidate)?;
        Ok(scratch)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn main_file(&self, main_name: &str) -> PathBuf {
        self.path.join(main_name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pending_file_is_removed_unless_committed() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("main.cf");
        let path = pending_path(&live);
        assert_eq!(path, dir.path().join("main.cf.pending"));

        {
            let pending = PendingFile::write(path.clone(), b"a = 1\n", None, None).unwrap();
            assert!(pending.path().exists());
        }
        assert!(!path.exists());

        let pending = PendingFile::write(path.clone(), b"a = 2\n", None, None).unwrap();
        pending.commit_to(&live).unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(&live).unwrap(), "a = 2\n");
    }

    #[cfg(unix)]
    #[test]
    fn pending_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let live = dir.path().join("main.cf");
        fs::write(&live, "a = 1\n").unwrap();
        fs::set_permissions(&live, fs::Permissions::from_mode(0o640)).unwrap();

        let p = PendingFile::write(pending_path(&live), b"a = 2\n", None, Some(&live)).unwrap();
        assert_eq!(fs::metadata(p.path()).unwrap().permissions().mode() & 0o777, 0o640);

        let cred = dir.path().join("sasl_passwd");
        let c = PendingFile::write(pending_path(&cred), b"x y\n", Some(0o600), None).unwrap();
        assert_eq!(fs::metadata(c.path()).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn backups_restore_previous_state() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        let main = dir.path().join("main.cf");
        let cred = dir.path().join("sasl_passwd");
        fs::write(&main, "a = 1\n").unwrap();

        let set = BackupSet::take(&backups, &[&main, &cred]).unwrap();
        fs::write(&main, "a = 2\n").unwrap();
        fs::write(&cred, "relay user:pw\n").unwrap();

        let done = set.restore().unwrap();
        assert_eq!(fs::read_to_string(&main).unwrap(), "a = 1\n");
        assert!(!cred.exists());
        assert_eq!(done.restored, vec![main.clone()]);
        assert!(done.was_removed(&cred));
        assert!(!done.was_removed(&main));
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 1);
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        for stamp in ["20260101T000000", "20260102T000000", "20260103T000000"] {
            fs::write(dir.path().join(format!("main.cf.{stamp}")), "").unwrap();
        }
        fs::write(dir.path().join("sasl_passwd.20260101T000000"), "").unwrap();

        assert_eq!(prune_backups(dir.path(), "main.cf", 2).unwrap(), 1);
        assert!(!dir.path().join("main.cf.20260101T000000").exists());
        assert!(dir.path().join("main.cf.20260103T000000").exists());
        assert!(dir.path().join("sasl_passwd.20260101T000000").exists());
        assert_eq!(prune_backups(dir.path(), "main.cf", 0).unwrap(), 0);
    }

    #[test]
    fn scratch_dir_holds_candidate_and_companions() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("etc");
        fs::create_dir(&config).unwrap();
        fs::write(config.join("master.cf"), "smtp inet n - n - - smtpd\n").unwrap();

        let path = {
            let scratch = ScratchDir::prepare(
                &dir.path().join("check"),
                &config,
                &["master.cf".to_string(), "missing.cf".to_string()],
                "main.cf",
                "myhostname = a.example\n",
            )
            .unwrap();
            assert!(scratch.path().join("master.cf").exists());
            assert!(!scratch.path().join("missing.cf").exists());
            assert_eq!(
                fs::read_to_string(scratch.main_file("main.cf")).unwrap(),
                "myhostname = a.example\n"
            );
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
