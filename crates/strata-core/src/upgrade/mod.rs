//! Index format upgrade driven by the upgrade lock.
//!
//! `Unlocked -> LockIntentSet -> Draining -> FullyEstablished -> Upgrading
//! -> Validating -> Committed`. `Waiting` parks the sequence while an
//! advance notice runs; a later run resumes from `Unlocked` because
//! setting the same intent again is a no-op. `RolledBack` is reached only
//! through [`UpgradeStateMachine::force_rollback`].

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::epoch::{EpochManager, EpochParameters};
use crate::error::{Result, ResultExt, StrataError};
use crate::format::{
    features_for, FormatManager, MutableParameters, SetParametersOptions, UpgradeLockIntent,
    FORMAT_CACHE_DURATION,
};
use crate::index::legacy::LEGACY_INDEX_PREFIX;
use crate::index::{
    check_index_info, IndexBlobIo, IndexBlobManager, IndexVersion, LegacyIndexManager,
};
use crate::util::{check_interrupted, sleep_interruptible};

/// Drain timeouts below this need `allow_unsafe_drain_timeout`. A client
/// trusts its cached format blob this long, so a shorter drain can finish
/// while a writer has not seen the lock yet.
pub const MIN_SAFE_DRAIN_TIMEOUT: Duration = FORMAT_CACHE_DURATION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpgradeState {
    Unlocked,
    LockIntentSet,
    /// Advance notice still running; resume later.
    Waiting,
    Draining,
    FullyEstablished,
    Upgrading,
    Validating,
    Committed,
    RolledBack,
}

impl UpgradeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Committed | UpgradeState::RolledBack)
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub owner_id: String,
    pub advance_notice: Duration,
    pub io_drain_timeout: Duration,
    pub status_poll_interval: Duration,
    pub max_permitted_clock_drift: Duration,
    pub message: String,
    pub allow_unsafe_drain_timeout: bool,
    /// Epoch parameters enabled by the migration.
    pub epoch_parameters: EpochParameters,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            advance_notice: Duration::ZERO,
            io_drain_timeout: FORMAT_CACHE_DURATION,
            status_poll_interval: Duration::from_secs(60),
            max_permitted_clock_drift: Duration::from_secs(5),
            message: String::new(),
            allow_unsafe_drain_timeout: false,
            epoch_parameters: EpochParameters::default(),
        }
    }
}

pub struct UpgradeStateMachine {
    format: Arc<FormatManager>,
    io: IndexBlobIo,
    clock: Arc<dyn Clock>,
    opts: UpgradeOptions,
    shutdown: Option<Arc<AtomicBool>>,
    state: UpgradeState,
}

impl UpgradeStateMachine {
    pub fn new(
        format: Arc<FormatManager>,
        io: IndexBlobIo,
        clock: Arc<dyn Clock>,
        opts: UpgradeOptions,
    ) -> Self {
        Self {
            format,
            io,
            clock,
            opts,
            shutdown: None,
            state: UpgradeState::Unlocked,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Perform the work of the current state and move to the next one.
    pub fn advance(&mut self) -> Result<UpgradeState> {
        check_interrupted(self.shutdown.as_deref())?;
        let next = match self.state {
            UpgradeState::Unlocked => self.set_lock_intent()?,
            UpgradeState::LockIntentSet | UpgradeState::Waiting => self.check_schedule()?,
            UpgradeState::Draining => self.drain()?,
            UpgradeState::FullyEstablished => UpgradeState::Upgrading,
            UpgradeState::Upgrading => self.migrate()?,
            UpgradeState::Validating => self.validate_and_commit()?,
            UpgradeState::Committed | UpgradeState::RolledBack => {
                return Err(StrataError::Other(format!(
                    "upgrade already finished ({:?})",
                    self.state
                )));
            }
        };
        debug!(from = ?self.state, to = ?next, "upgrade state transition");
        self.state = next;
        Ok(next)
    }

    /// Advance until the upgrade finishes or has to wait for its notice.
    pub fn run(&mut self) -> Result<UpgradeState> {
        loop {
            let state = self.advance()?;
            if state.is_terminal() || state == UpgradeState::Waiting {
                return Ok(state);
            }
        }
    }

    fn intent(&self) -> UpgradeLockIntent {
        UpgradeLockIntent {
            owner_id: self.opts.owner_id.clone(),
            creation_time: self.clock.now(),
            advance_notice: self.opts.advance_notice,
            io_drain_timeout: self.opts.io_drain_timeout,
            status_poll_interval: self.opts.status_poll_interval,
            max_permitted_clock_drift: self.opts.max_permitted_clock_drift,
            message: self.opts.message.clone(),
        }
    }

    fn set_lock_intent(&mut self) -> Result<UpgradeState> {
        let safe_minimum = MIN_SAFE_DRAIN_TIMEOUT.max(self.format.cache_duration());
        let unsafe_drain = self.opts.io_drain_timeout < safe_minimum;
        if unsafe_drain && !self.opts.allow_unsafe_drain_timeout {
            return Err(StrataError::DangerousOperation(format!(
                "io drain timeout of {}s is below the safe minimum of {}s",
                self.opts.io_drain_timeout.as_secs(),
                safe_minimum.as_secs()
            )));
        }
        if unsafe_drain {
            warn!(
                drain_secs = self.opts.io_drain_timeout.as_secs(),
                "drain timeout is shorter than the format cache; stale writers may be lost"
            );
        }
        let lock = self.format.set_upgrade_lock_intent(self.intent())?;
        info!(
            owner = %lock.owner_id,
            upgrade_time = %lock.upgrade_time(),
            "upgrade lock in place"
        );
        Ok(UpgradeState::LockIntentSet)
    }

    fn held_lock(&self) -> Result<UpgradeLockIntent> {
        self.format
            .upgrade_lock_intent()?
            .ok_or(StrataError::UpgradeLockNotHeld)
    }

    fn check_schedule(&mut self) -> Result<UpgradeState> {
        let lock = self.held_lock()?;
        let now = self.clock.now();
        if !lock.advance_notice.is_zero() && now < lock.upgrade_time() {
            info!(
                upgrade_time = %lock.upgrade_time(),
                "advance notice still running, resume after the upgrade time"
            );
            return Ok(UpgradeState::Waiting);
        }
        let params = self.format.load_fresh()?.parameters;
        if params.index_version == IndexVersion::V1 {
            info!("repository already uses the epoch index, skipping drain");
            return Ok(UpgradeState::FullyEstablished);
        }
        Ok(UpgradeState::Draining)
    }

    /// Poll the stored lock until every writer must have seen it.
    fn drain(&mut self) -> Result<UpgradeState> {
        loop {
            let lock = self.held_lock()?;
            let (locked, drained) = lock.is_locked(self.clock.now());
            if locked && drained {
                info!("all writers drained");
                return Ok(UpgradeState::FullyEstablished);
            }
            debug!(
                locked,
                upgrade_time = %lock.upgrade_time(),
                "waiting for writers to drain"
            );
            sleep_interruptible(
                self.clock.as_ref(),
                lock.status_poll_interval,
                self.shutdown.as_deref(),
            )?;
        }
    }

    /// Copy the legacy index into epoch 0 and switch the repository to V1.
    /// Does nothing if that already happened.
    fn migrate(&mut self) -> Result<UpgradeState> {
        let current = self.format.load_fresh()?;
        if current.parameters.index_version == IndexVersion::V1
            && current.parameters.epoch_parameters.enabled
        {
            info!("epoch index already enabled");
            return Ok(UpgradeState::Validating);
        }

        let legacy = LegacyIndexManager::new(self.io.clone())
            .load_merged()
            .context("reading legacy index")?;
        let corrupt = self.io.corrupt_blobs();
        if !corrupt.is_empty() {
            return Err(StrataError::Other(format!(
                "{} legacy index blob(s) do not decode, recover the index before upgrading",
                corrupt.len()
            )));
        }
        let epoch = EpochManager::new(
            self.io.clone(),
            self.opts.epoch_parameters.clone(),
            self.clock.clone(),
        )?;
        let count = legacy.len();
        if count > 0 {
            epoch
                .write_index(&legacy.into_entries())
                .context("writing migrated index")?;
        }

        let params = MutableParameters {
            index_version: IndexVersion::V1,
            epoch_parameters: self.opts.epoch_parameters.clone(),
            ..current.parameters
        };
        let features = features_for(&params);
        self.format.set_parameters(
            params,
            self.format.blob_cfg()?,
            features,
            SetParametersOptions::default(),
        )?;
        info!(entries = count, "migrated legacy index to epoch index");
        Ok(UpgradeState::Validating)
    }

    /// Compare both index forms entry by entry. Any difference keeps the
    /// repository locked; otherwise the upgrade is committed and the legacy
    /// blobs removed.
    fn validate_and_commit(&mut self) -> Result<UpgradeState> {
        let params = self.format.load_fresh()?.parameters;
        if params.index_version != IndexVersion::V1 {
            return Err(StrataError::Other(
                "cannot validate before the index has been migrated".into(),
            ));
        }
        let legacy_manager = LegacyIndexManager::new(self.io.clone());
        let has_legacy = !self.io.list(LEGACY_INDEX_PREFIX)?.is_empty();
        if has_legacy {
            let old = legacy_manager.load_merged()?;
            let new = EpochManager::new(
                self.io.clone(),
                params.epoch_parameters.clone(),
                self.clock.clone(),
            )?
            .load_merged()?;

            let mut mismatches = 0;
            for before in old.iter() {
                match new.get(&before.content_id) {
                    None => {
                        warn!(content = %before.content_id, "missing from the epoch index");
                        mismatches += 1;
                    }
                    Some(after) => {
                        for line in check_index_info(before, after) {
                            warn!("{line}");
                            mismatches += 1;
                        }
                    }
                }
            }
            for after in new.iter().filter(|e| !old.contains(&e.content_id)) {
                warn!(content = %after.content_id, "only present in the epoch index");
                mismatches += 1;
            }
            if mismatches > 0 {
                return Err(StrataError::IndexValidationFailed(mismatches));
            }
            info!(entries = old.len(), "epoch index matches legacy index");
        }

        self.format.commit_upgrade()?;
        let removed = legacy_manager.delete_all()?;
        info!(removed, "upgrade committed, legacy index removed");
        Ok(UpgradeState::Committed)
    }

    /// Undo an unfinished upgrade: drop any epoch index the migration
    /// created and restore the format blob saved with the lock.
    pub fn force_rollback(&mut self, force: bool) -> Result<()> {
        if !force {
            return Err(StrataError::DangerousOperation(
                "rolling back an upgrade can lose data written in the new format; pass force"
                    .into(),
            ));
        }
        if self.state == UpgradeState::Committed {
            return Err(StrataError::Other(
                "a committed upgrade cannot be rolled back".into(),
            ));
        }
        let backup = self.format.format_backup()?;
        let was_legacy = backup
            .as_ref()
            .is_some_and(|b| b.parameters.index_version == IndexVersion::V0);
        if was_legacy {
            let deleted = EpochManager::new(
                self.io.clone(),
                self.opts.epoch_parameters.clone(),
                self.clock.clone(),
            )?
            .delete_all_blobs()?;
            info!(deleted, "removed epoch index blobs");
        }
        self.format.rollback_upgrade()?;
        self.state = UpgradeState::RolledBack;
        warn!("upgrade rolled back");
        Ok(())
    }
}
