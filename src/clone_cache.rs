//! # Clone Cache
//!
//! Prepares local clones of remote repositories under the VMR's tmp
//! directory and hands them out as [`LocalGitRepo`] handles.
//!
//! ## Layout
//!
//! - a mapping is cloned to `tmp/{mapping}`,
//! - a bare remote URI to `tmp/{stable hash of the URI}`,
//! - the VMR itself to `tmp/vmr`, unless the configured VMR path already
//!   exists, in which case that working copy is used.
//!
//! ## Memoization
//!
//! Within one process, cloning and remote configuration happen at most once
//! per clone path, as long as the clone directory exists. A directory that
//! disappeared is cloned again. Every `prepare_*` call still checks out the
//! requested ref, exactly once, so callers always get the working tree they
//! asked for.
//!
//! Concurrent calls for the same path serialize on a per-path lock, which
//! also covers the checkout since a working tree can only be on one ref at a
//! time. Calls for different paths proceed in parallel; the map of entries is
//! locked only long enough to fetch or insert an entry.
//!
//! ## Leases
//!
//! Work that spans several git operations on a working tree (branch
//! switches, merges, commits) takes a [`CloneLease`] over the clone paths it
//! touches. A lease is exclusive per path and is released on drop.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::cancellation::CancellationToken;
use crate::config::{SourceMapping, VmrInfo};
use crate::error::{Error, Result};
use crate::filesystem::FileSystem;
use crate::git::{stable_hash, GitObjectType, LocalGitRepo, LocalGitRepoFactory, RepoCloner};

/// What has already been done to one clone path in this process
#[derive(Debug, Default)]
struct CloneEntry {
    cloned: bool,
    remotes: HashSet<String>,
}

/// Per-path state: the memoized setup, and whether a lease is held
#[derive(Default)]
struct CloneSlot {
    entry: Mutex<CloneEntry>,
    leased: Mutex<bool>,
    released: Condvar,
}

/// Exclusive use of one or more clone paths, released on drop
pub struct CloneLease {
    slots: Vec<Arc<CloneSlot>>,
}

impl Drop for CloneLease {
    fn drop(&mut self) {
        for slot in &self.slots {
            *slot.leased.lock().unwrap_or_else(PoisonError::into_inner) = false;
            slot.released.notify_all();
        }
    }
}

pub struct CloneManager {
    vmr_info: VmrInfo,
    cloner: Arc<dyn RepoCloner>,
    repo_factory: Arc<dyn LocalGitRepoFactory>,
    fs: Arc<dyn FileSystem>,
    slots: Mutex<HashMap<PathBuf, Arc<CloneSlot>>>,
}

impl CloneManager {
    pub fn new(
        vmr_info: VmrInfo,
        cloner: Arc<dyn RepoCloner>,
        repo_factory: Arc<dyn LocalGitRepoFactory>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            vmr_info,
            cloner,
            repo_factory,
            fs,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Clones a repository by URI and checks out `ref`.
    ///
    /// When `remote_uri` is the local VMR path, the VMR working copy is
    /// returned as is.
    pub fn prepare_clone(
        &self,
        remote_uri: &str,
        r#ref: &str,
        cancellation: &CancellationToken,
    ) -> Result<Arc<dyn LocalGitRepo>> {
        if Path::new(remote_uri) == self.vmr_info.vmr_path {
            debug!("{} is the local VMR, skipping clone", remote_uri);
            return Ok(self.repo_factory.create(&self.vmr_info.vmr_path));
        }

        let path = self.vmr_info.tmp_path.join(stable_hash(remote_uri));
        self.prepare_clone_internal(&path, &[remote_uri.to_string()], &[], r#ref, cancellation)
    }

    /// Clones a mapping's repository into `tmp/{mapping}`, trying `remotes` in
    /// order (the mapping's default remote when none are given).
    pub fn prepare_clone_for_mapping(
        &self,
        mapping: &SourceMapping,
        remotes: &[String],
        r#ref: &str,
        cancellation: &CancellationToken,
    ) -> Result<Arc<dyn LocalGitRepo>> {
        let remotes = if remotes.is_empty() {
            vec![mapping.default_remote.clone()]
        } else {
            remotes.to_vec()
        };

        let path = self.mapping_clone_path(mapping);
        self.prepare_clone_internal(&path, &remotes, &[], r#ref, cancellation)
    }

    /// Where [`prepare_clone_for_mapping`](Self::prepare_clone_for_mapping)
    /// keeps the mapping's clone.
    pub fn mapping_clone_path(&self, mapping: &SourceMapping) -> PathBuf {
        self.vmr_info.tmp_path.join(&mapping.name)
    }

    /// The local VMR when it exists, `tmp/vmr` otherwise.
    pub fn vmr_clone_path(&self) -> PathBuf {
        if self.fs.directory_exists(&self.vmr_info.vmr_path) {
            self.vmr_info.vmr_path.clone()
        } else {
            self.vmr_info.tmp_path.join("vmr")
        }
    }

    /// Takes exclusive use of `paths`, waiting for other leases on them.
    ///
    /// Paths are acquired in sorted order so two leases over overlapping
    /// paths cannot deadlock.
    pub fn lease(&self, paths: &[PathBuf]) -> Result<CloneLease> {
        let mut paths = paths.to_vec();
        paths.sort();
        paths.dedup();

        let mut lease = CloneLease { slots: Vec::new() };
        for path in &paths {
            let slot = self.slot(path)?;
            {
                let poisoned = |_| Error::LockPoisoned {
                    context: format!("clone lease {}", path.display()),
                };
                let mut leased = slot.leased.lock().map_err(poisoned)?;
                while *leased {
                    debug!("Waiting for the lease on {}", path.display());
                    leased = slot.released.wait(leased).map_err(poisoned)?;
                }
                *leased = true;
            }
            lease.slots.push(slot);
        }
        Ok(lease)
    }

    /// Prepares the VMR, making sure every ref in `requested_refs` is
    /// available before checking out `checkout_ref`.
    pub fn prepare_vmr_clone(
        &self,
        remotes: &[String],
        requested_refs: &[&str],
        checkout_ref: &str,
        cancellation: &CancellationToken,
    ) -> Result<Arc<dyn LocalGitRepo>> {
        let path = self.vmr_clone_path();
        self.prepare_clone_internal(&path, remotes, requested_refs, checkout_ref, cancellation)
    }

    fn prepare_clone_internal(
        &self,
        path: &Path,
        remotes: &[String],
        requested_refs: &[&str],
        checkout_ref: &str,
        cancellation: &CancellationToken,
    ) -> Result<Arc<dyn LocalGitRepo>> {
        let first_remote = remotes.first().ok_or_else(|| Error::InvalidSynchronization {
            message: format!("No remote given for {}", path.display()),
        })?;

        let slot = self.slot(path)?;
        let mut entry = lock_entry(&slot, path)?;
        cancellation.check()?;

        let repo = self.repo_factory.create(path);

        if !self.fs.directory_exists(path) {
            if entry.cloned {
                info!("Clone at {} is gone, cloning again", path.display());
            }
            info!("Cloning {} to {}", first_remote, path.display());
            self.cloner.clone_no_checkout(first_remote, path)?;
            entry.remotes.clear();
            entry.remotes.insert(first_remote.clone());
            entry.cloned = true;
        } else if !entry.cloned {
            debug!("Reusing existing clone at {}", path.display());
            entry.cloned = true;
        }

        for remote in remotes {
            if entry.remotes.contains(remote) {
                continue;
            }
            cancellation.check()?;
            let name = repo.add_remote_if_missing(remote)?;
            repo.update_remote(&name)?;
            entry.remotes.insert(remote.clone());
        }

        if !requested_refs.is_empty() {
            self.ensure_refs(repo.as_ref(), path, remotes, requested_refs, cancellation)?;
        }

        cancellation.check()?;
        repo.checkout(checkout_ref)?;
        Ok(repo)
    }

    /// Fetches all remotes once if some refs are missing, then fails with
    /// `MissingRefs` for whatever is still missing.
    fn ensure_refs(
        &self,
        repo: &dyn LocalGitRepo,
        path: &Path,
        remotes: &[String],
        requested_refs: &[&str],
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let missing = missing_refs(repo, requested_refs)?;
        if missing.is_empty() {
            return Ok(());
        }

        debug!("Refs {:?} not found in {}, fetching", missing, path.display());
        for remote in remotes {
            cancellation.check()?;
            let name = repo.add_remote_if_missing(remote)?;
            repo.update_remote(&name)?;
        }

        let missing = missing_refs(repo, &missing.iter().map(String::as_str).collect::<Vec<_>>())?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingRefs {
                refs: missing,
                path: path.display().to_string(),
            })
        }
    }

    fn slot(&self, path: &Path) -> Result<Arc<CloneSlot>> {
        let mut slots = self.slots.lock().map_err(|_| Error::LockPoisoned {
            context: "clone cache".to_string(),
        })?;
        Ok(slots.entry(path.to_path_buf()).or_default().clone())
    }
}

fn lock_entry<'a>(slot: &'a CloneSlot, path: &Path) -> Result<MutexGuard<'a, CloneEntry>> {
    slot.entry.lock().map_err(|_| Error::LockPoisoned {
        context: format!("clone cache entry {}", path.display()),
    })
}

fn missing_refs(repo: &dyn LocalGitRepo, refs: &[&str]) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for r#ref in refs {
        if repo.get_object_type(r#ref)? != GitObjectType::Commit {
            missing.push(r#ref.to_string());
        }
    }
    Ok(missing)
}
