//! Data Info Provider (component B): the global versioned data registry.
//!
//! Owned exclusively by the dispatcher (see design notes on the arena of
//! ids) — every method here is a plain synchronous call, never awaited,
//! matching "the Data Info Provider assigns DIIs in a globally-serialized
//! order matching the order of `processTask` calls" (spec §5).

use crate::errors::{Result, RuntimeError};
use crate::ids::{Did, Dv, IdAllocator, Renaming, VersionNumber, WaitTicket};
use std::collections::HashMap;

#[derive(Debug)]
struct VersionState {
    reader_count: u32,
    invalidated: bool,
}

impl VersionState {
    fn fresh() -> Self {
        Self {
            reader_count: 0,
            invalidated: false,
        }
    }
}

/// A commutative/concurrent write round in progress on a `Did`: all C/M
/// writers in the round share one write renaming; the round drains (and
/// the version becomes the new latest) once `pending` reaches zero.
#[derive(Debug)]
struct PendingRound {
    version: VersionNumber,
    pending: u32,
}

#[derive(Debug)]
struct DidState {
    /// Versions 0..=latest, indexed by version number.
    versions: Vec<VersionState>,
    /// Live = not yet superseded by a drained round or a W/RW write.
    latest: VersionNumber,
    round: Option<PendingRound>,
}

impl DidState {
    fn new() -> Self {
        Self {
            versions: vec![VersionState::fresh()],
            latest: 0,
            round: None,
        }
    }

    fn is_live(&self, version: VersionNumber) -> bool {
        let v = &self.versions[version as usize];
        (v.reader_count > 0 || version == self.latest) && !v.invalidated
    }
}

/// Allocates data instance ids, advances versions on writes, and resolves
/// reads to their concrete producer version.
#[derive(Debug, Default)]
pub struct DataInfoProvider {
    dids: HashMap<Did, DidState>,
    /// Reverse index so `finishAccess`/`deleteData` can take the opaque
    /// `Renaming` the caller was handed rather than a raw `Dv`.
    renaming_index: HashMap<Renaming, Dv>,
    tickets: IdAllocator,
}

/// What `registerAccess` hands back: up to one read DII, up to one write DII.
#[derive(Debug, Clone, Default)]
pub struct AccessDiis {
    pub read: Option<Renaming>,
    pub write: Option<Renaming>,
}

impl DataInfoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dids_seen(&self) -> usize {
        self.dids.len()
    }

    pub fn data_has_been_accessed(&self, did: Did) -> bool {
        self.dids.contains_key(&did)
    }

    /// `RegisterData`: lazily inserts a fresh version chain for `did` if it
    /// doesn't already exist, without advancing any version. Idempotent.
    pub fn ensure_registered(&mut self, did: Did) {
        self.dids.entry(did).or_insert_with(DidState::new);
    }

    fn index_renaming(&mut self, did: Did, version: VersionNumber) -> Renaming {
        let dv = Dv { did, version };
        let renaming = Renaming::for_dv(dv);
        self.renaming_index.insert(renaming.clone(), dv);
        renaming
    }

    /// Allocates/advances versions for one access, per spec §4.1.
    pub fn register_access(
        &mut self,
        did: Did,
        mode: crate::types::AccessMode,
    ) -> Result<AccessDiis> {
        use crate::types::AccessMode::*;

        let state = self.dids.entry(did).or_insert_with(DidState::new);

        match mode {
            R => {
                // A plain read that arrives while a C/M round is still
                // pending must be ordered after every writer in that round,
                // not just the last-committed version: resolve to the
                // round's shared renaming so the Task Analyser's RAW lookup
                // (keyed by renaming) sees every pending writer as a
                // predecessor.
                let read_version = match &state.round {
                    Some(round) => round.version,
                    None => state.latest,
                };
                state.versions[read_version as usize].reader_count += 1;
                let renaming = {
                    let dv = Dv { did, version: read_version };
                    let r = Renaming::for_dv(dv);
                    self.renaming_index.insert(r.clone(), dv);
                    r
                };
                Ok(AccessDiis {
                    read: Some(renaming),
                    write: None,
                })
            }
            W => {
                let predecessor = state.latest;
                let new_version = predecessor + 1;
                state.versions.push(VersionState::fresh());
                state.latest = new_version;
                // Pure W never reads the predecessor: invalidate it now,
                // regardless of outstanding readers of even-older versions.
                state.versions[predecessor as usize].invalidated = true;
                let renaming = self.index_renaming(did, new_version);
                Ok(AccessDiis {
                    read: None,
                    write: Some(renaming),
                })
            }
            Rw => {
                let read_version = state.latest;
                state.versions[read_version as usize].reader_count += 1;
                let read_renaming = self.index_renaming(did, read_version);

                let write_version = read_version + 1;
                state.versions.push(VersionState::fresh());
                state.latest = write_version;
                let write_renaming = self.index_renaming(did, write_version);

                Ok(AccessDiis {
                    read: Some(read_renaming),
                    write: Some(write_renaming),
                })
            }
            C | M => {
                let read_version = state.latest;
                state.versions[read_version as usize].reader_count += 1;
                let read_renaming = self.index_renaming(did, read_version);

                let write_version = match &mut state.round {
                    Some(round) => {
                        round.pending += 1;
                        round.version
                    }
                    None => {
                        let v = read_version + 1;
                        state.versions.push(VersionState::fresh());
                        state.round = Some(PendingRound {
                            version: v,
                            pending: 1,
                        });
                        v
                    }
                };
                let write_renaming = self.index_renaming(did, write_version);

                Ok(AccessDiis {
                    read: Some(read_renaming),
                    write: Some(write_renaming),
                })
            }
        }
    }

    /// Called once a C/M writer finishes; when the last pending writer in
    /// the round drains, the round's version becomes the new latest.
    pub fn drain_concurrent_writer(&mut self, did: Did) -> Result<()> {
        let state = self
            .dids
            .get_mut(&did)
            .ok_or(RuntimeError::UnknownData(did))?;
        let done = if let Some(round) = &mut state.round {
            round.pending -= 1;
            round.pending == 0
        } else {
            false
        };
        if done {
            let round = state.round.take().unwrap();
            state.latest = round.version;
        }
        Ok(())
    }

    /// Decrements the reader count for a renaming; idempotent on double-finish.
    pub fn finish_access(&mut self, renaming: &Renaming) -> Result<()> {
        let Some(&dv) = self.renaming_index.get(renaming) else {
            // Unknown renaming: treat as already-finished, per "double-finish
            // is idempotent (logged, not fatal)".
            tracing::debug!(%renaming, "finish_access on unindexed renaming, ignoring");
            return Ok(());
        };
        let state = self
            .dids
            .get_mut(&dv.did)
            .ok_or(RuntimeError::UnknownData(dv.did))?;
        let v = &mut state.versions[dv.version as usize];
        if v.reader_count == 0 {
            tracing::debug!(%renaming, "double finish_access, ignoring");
            return Ok(());
        }
        v.reader_count -= 1;
        if v.reader_count == 0 && dv.version != state.latest {
            v.invalidated = true;
        }
        Ok(())
    }

    /// Marks all versions of a `Did` obsolete; physical eviction is the
    /// Data Manager's concern once outstanding readers have drained.
    pub fn delete_data(&mut self, did: Did) -> Result<()> {
        let state = self
            .dids
            .get_mut(&did)
            .ok_or(RuntimeError::UnknownData(did))?;
        for v in &mut state.versions {
            v.invalidated = true;
        }
        Ok(())
    }

    /// Pins the latest version for a synchronous user-thread read and
    /// mints a ticket the caller awaits on (the actual await/semaphore is
    /// owned by the Task Analyser, which knows about in-flight tasks).
    pub fn block_data_and_get_result_file(&mut self, did: Did) -> Result<(Renaming, WaitTicket)> {
        let state = self
            .dids
            .get_mut(&did)
            .ok_or(RuntimeError::UnknownData(did))?;
        let latest = state.latest;
        state.versions[latest as usize].reader_count += 1;
        let renaming = {
            let dv = Dv { did, version: latest };
            let r = Renaming::for_dv(dv);
            self.renaming_index.insert(r.clone(), dv);
            r
        };
        Ok((renaming, self.tickets.next_wait_ticket()))
    }

    /// True once every version of `did` is either invalidated or has no
    /// outstanding readers — the precondition `waitForDataReadyToDelete`
    /// polls for before a filesystem-level delete.
    pub fn ready_to_delete(&self, did: Did) -> bool {
        match self.dids.get(&did) {
            None => true,
            Some(state) => state
                .versions
                .iter()
                .all(|v| v.invalidated || v.reader_count == 0),
        }
    }

    /// True once no C/M round is pending on `did` — the precondition for
    /// `findWaitedConcurrent`.
    pub fn concurrent_round_drained(&self, did: Did) -> bool {
        self.dids.get(&did).map(|s| s.round.is_none()).unwrap_or(true)
    }

    /// Peeks the renaming of the currently-latest version without
    /// mutating any state. `None` means the `Did` has never been
    /// accessed, so no RAW/WAR/WAW predecessor can exist yet.
    pub fn latest_renaming(&self, did: Did) -> Option<Renaming> {
        self.dids.get(&did).map(|s| Renaming::for_dv(Dv { did, version: s.latest }))
    }

    /// Forcibly invalidates a specific renaming, used by the Task
    /// Analyser when a task fails: its write-output DIIs must never
    /// become visible to any reader.
    pub fn invalidate_renaming(&mut self, renaming: &Renaming) -> Result<()> {
        let Some(&dv) = self.renaming_index.get(renaming) else {
            return Ok(());
        };
        let state = self
            .dids
            .get_mut(&dv.did)
            .ok_or(RuntimeError::UnknownData(dv.did))?;
        state.versions[dv.version as usize].invalidated = true;
        Ok(())
    }

    pub fn is_live(&self, renaming: &Renaming) -> bool {
        match self.renaming_index.get(renaming) {
            Some(&dv) => self
                .dids
                .get(&dv.did)
                .map(|s| s.is_live(dv.version))
                .unwrap_or(false),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessMode;

    #[test]
    fn read_then_write_advances_version_and_invalidates_predecessor() {
        let mut dip = DataInfoProvider::new();
        let did = Did(1);

        let w0 = dip.register_access(did, AccessMode::W).unwrap();
        assert_eq!(w0.write.unwrap().0, "d1_v1");

        let r = dip.register_access(did, AccessMode::R).unwrap();
        assert_eq!(r.read.unwrap().0, "d1_v1");

        let w1 = dip.register_access(did, AccessMode::W).unwrap();
        assert_eq!(w1.write.unwrap().0, "d1_v2");
        // The pure-W predecessor (v1) is invalidated immediately even
        // though nothing ever finished its reader count.
        assert!(!dip.is_live(&Renaming("d1_v1".into())));
    }

    #[test]
    fn finish_access_drains_obsolete_version() {
        let mut dip = DataInfoProvider::new();
        let did = Did(2);
        let w0 = dip.register_access(did, AccessMode::W).unwrap();
        let v1 = w0.write.unwrap();
        let r = dip.register_access(did, AccessMode::R).unwrap();
        let read_dii = r.read.unwrap();
        assert_eq!(read_dii, v1);

        let w1 = dip.register_access(did, AccessMode::W).unwrap();
        let _v2 = w1.write.unwrap();

        // v1 is not the latest anymore and has one outstanding reader.
        assert!(dip.is_live(&v1));
        dip.finish_access(&read_dii).unwrap();
        assert!(!dip.is_live(&v1));
    }

    #[test]
    fn double_finish_is_idempotent() {
        let mut dip = DataInfoProvider::new();
        let did = Did(3);
        let w0 = dip.register_access(did, AccessMode::W).unwrap();
        let renaming = w0.write.unwrap();
        let r = dip.register_access(did, AccessMode::R).unwrap();
        let read_dii = r.read.unwrap();
        assert_eq!(read_dii, renaming);
        dip.finish_access(&read_dii).unwrap();
        // Second finish on the same renaming must not panic or error.
        dip.finish_access(&read_dii).unwrap();
    }

    #[test]
    fn concurrent_round_shares_write_dii_until_drained() {
        let mut dip = DataInfoProvider::new();
        let did = Did(4);
        let _ = dip.register_access(did, AccessMode::W).unwrap();

        let m1 = dip.register_access(did, AccessMode::M).unwrap();
        let m2 = dip.register_access(did, AccessMode::M).unwrap();
        let m3 = dip.register_access(did, AccessMode::M).unwrap();
        assert_eq!(m1.write, m2.write);
        assert_eq!(m2.write, m3.write);
        assert!(!dip.concurrent_round_drained(did));

        dip.drain_concurrent_writer(did).unwrap();
        dip.drain_concurrent_writer(did).unwrap();
        assert!(!dip.concurrent_round_drained(did));
        dip.drain_concurrent_writer(did).unwrap();
        assert!(dip.concurrent_round_drained(did));
    }

    #[test]
    fn unknown_did_fails() {
        let mut dip = DataInfoProvider::new();
        assert!(matches!(
            dip.delete_data(Did(999)),
            Err(RuntimeError::UnknownData(_))
        ));
    }
}
