//! In-memory remote mailbox for deterministic tests
//!
//! Folders hold numbered messages with a validity token. Failures can be
//! queued per operation, calls are counted, `list_uids` arguments are
//! recorded, and summary fetches can be paused to observe the engine while a
//! remote call is in flight. A move can also fail after its copy landed.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::errors::{AppError, AppResult};
use crate::models::{Envelope, Flag, Message};
use crate::remote::{FolderStatus, RemoteMailbox, TransferOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    ListFolders,
    Status,
    ListUids,
    FetchSummaries,
    FetchRaw,
    Move,
    Copy,
    SetFlag,
}

#[derive(Debug, Default)]
struct FakeFolder {
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<u32, Message>,
    raw: HashMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FakeState {
    folders: BTreeMap<(String, String), FakeFolder>,
    failures: VecDeque<(FakeOp, AppError)>,
    calls: HashMap<FakeOp, usize>,
    list_since: Vec<Option<u32>>,
    report_uid_map: bool,
    fail_after_copy: Option<AppError>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    fetch_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

pub fn fake_message(uid: u32, subject: &str) -> Message {
    Message {
        uid,
        envelope: Envelope {
            subject: Some(subject.to_owned()),
            from: Some(format!("sender{uid}@example.com")),
            to: Some("me@example.com".to_owned()),
            ..Envelope::default()
        },
        flags: BTreeSet::new(),
        size: Some(512),
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a folder holding UIDs `1..=count` with subjects `Message <uid>`
    pub fn add_folder(&self, account_id: &str, folder: &str, uid_validity: u32, count: u32) {
        let mut state = self.state.lock().expect("fake state");
        let messages = (1..=count)
            .map(|uid| (uid, fake_message(uid, &format!("Message {uid}"))))
            .collect();
        state.folders.insert(
            (account_id.to_owned(), folder.to_owned()),
            FakeFolder {
                uid_validity,
                next_uid: count + 1,
                messages,
                raw: HashMap::new(),
            },
        );
    }

    pub fn add_message(&self, account_id: &str, folder: &str, message: Message) {
        self.with_folder(account_id, folder, |f| {
            f.next_uid = f.next_uid.max(message.uid + 1);
            f.messages.insert(message.uid, message);
        });
    }

    pub fn remove_message(&self, account_id: &str, folder: &str, uid: u32) {
        self.with_folder(account_id, folder, |f| {
            f.messages.remove(&uid);
        });
    }

    pub fn set_raw(&self, account_id: &str, folder: &str, uid: u32, raw: &[u8]) {
        self.with_folder(account_id, folder, |f| {
            f.raw.insert(uid, raw.to_vec());
        });
    }

    /// Change the validity token and renumber subjects to `Epoch <v> #<uid>`
    pub fn reset_epoch(&self, account_id: &str, folder: &str, uid_validity: u32) {
        self.with_folder(account_id, folder, |f| {
            f.uid_validity = uid_validity;
            for (uid, message) in f.messages.iter_mut() {
                message.envelope.subject = Some(format!("Epoch {uid_validity} #{uid}"));
            }
        });
    }

    pub fn report_uid_map(&self, enabled: bool) {
        self.state.lock().expect("fake state").report_uid_map = enabled;
    }

    /// Make the next move copy its messages and then fail with `err`,
    /// leaving the source untouched
    pub fn fail_next_move_after_copy(&self, err: AppError) {
        self.state.lock().expect("fake state").fail_after_copy = Some(err);
    }

    /// Queue a failure for the next call of `op`
    pub fn fail_next(&self, op: FakeOp, err: AppError) {
        self.state
            .lock()
            .expect("fake state")
            .failures
            .push_back((op, err));
    }

    pub fn calls(&self, op: FakeOp) -> usize {
        let state = self.state.lock().expect("fake state");
        state.calls.get(&op).copied().unwrap_or(0)
    }

    /// `since` argument of every `list_uids` call, in order
    pub fn list_since(&self) -> Vec<Option<u32>> {
        self.state.lock().expect("fake state").list_since.clone()
    }

    pub fn uids(&self, account_id: &str, folder: &str) -> BTreeSet<u32> {
        let state = self.state.lock().expect("fake state");
        state
            .folders
            .get(&(account_id.to_owned(), folder.to_owned()))
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn flags(&self, account_id: &str, folder: &str, uid: u32) -> BTreeSet<Flag> {
        let state = self.state.lock().expect("fake state");
        state
            .folders
            .get(&(account_id.to_owned(), folder.to_owned()))
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.flags.clone())
            .unwrap_or_default()
    }

    /// Pause the next summary fetch
    ///
    /// Returns `(entered, release)`: `entered` is notified when a fetch
    /// reaches the gate, which then waits for `release`.
    pub fn pause_next_fetch(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.fetch_gate.lock().expect("fetch gate") = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    fn with_folder(&self, account_id: &str, folder: &str, f: impl FnOnce(&mut FakeFolder)) {
        let mut state = self.state.lock().expect("fake state");
        let entry = state
            .folders
            .entry((account_id.to_owned(), folder.to_owned()))
            .or_insert_with(|| FakeFolder {
                uid_validity: 1,
                next_uid: 1,
                ..FakeFolder::default()
            });
        f(entry);
    }

    /// Count the call and pop a queued failure for `op`
    fn begin(&self, op: FakeOp) -> AppResult<()> {
        let mut state = self.state.lock().expect("fake state");
        *state.calls.entry(op).or_default() += 1;
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op)
            && let Some((_, err)) = state.failures.remove(pos)
        {
            return Err(err);
        }
        Ok(())
    }

    fn folder<T>(
        &self,
        account_id: &str,
        folder: &str,
        f: impl FnOnce(&mut FakeFolder) -> T,
    ) -> AppResult<T> {
        let mut state = self.state.lock().expect("fake state");
        let entry = state
            .folders
            .get_mut(&(account_id.to_owned(), folder.to_owned()))
            .ok_or_else(|| AppError::RemoteRejected(format!("no such folder '{folder}'")))?;
        Ok(f(entry))
    }

    fn transfer(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
        remove_source: bool,
    ) -> AppResult<TransferOutcome> {
        self.folder(account_id, to_folder, |_| ())?;
        let moved: Vec<Message> = self.folder(account_id, from_folder, |f| {
            uids.iter()
                .filter_map(|uid| {
                    if remove_source {
                        f.messages.remove(uid)
                    } else {
                        f.messages.get(uid).cloned()
                    }
                })
                .collect()
        })?;
        let report = self.state.lock().expect("fake state").report_uid_map;
        self.folder(account_id, to_folder, |f| {
            let mut uid_map = Vec::new();
            for mut message in moved {
                let new_uid = f.next_uid;
                f.next_uid += 1;
                uid_map.push((message.uid, new_uid));
                message.uid = new_uid;
                f.messages.insert(new_uid, message);
            }
            TransferOutcome {
                destination_uid_validity: Some(f.uid_validity),
                uid_map: if report { uid_map } else { Vec::new() },
            }
        })
    }
}

#[async_trait]
impl RemoteMailbox for FakeRemote {
    async fn list_folders(&self, account_id: &str) -> AppResult<Vec<String>> {
        self.begin(FakeOp::ListFolders)?;
        let state = self.state.lock().expect("fake state");
        Ok(state
            .folders
            .keys()
            .filter(|(account, _)| account == account_id)
            .map(|(_, folder)| folder.clone())
            .collect())
    }

    async fn folder_status(&self, account_id: &str, folder: &str) -> AppResult<FolderStatus> {
        self.begin(FakeOp::Status)?;
        self.folder(account_id, folder, |f| FolderStatus {
            uid_validity: f.uid_validity,
            total: f.messages.len(),
            unread: Some(
                f.messages
                    .values()
                    .filter(|m| !m.flags.contains(&Flag::Seen))
                    .count(),
            ),
            uid_next: Some(f.next_uid),
        })
    }

    async fn list_uids(
        &self,
        account_id: &str,
        folder: &str,
        since: Option<u32>,
    ) -> AppResult<BTreeSet<u32>> {
        self.begin(FakeOp::ListUids)?;
        self.state
            .lock()
            .expect("fake state")
            .list_since
            .push(since);
        self.folder(account_id, folder, |f| {
            f.messages
                .keys()
                .filter(|uid| since.is_none_or(|s| **uid >= s))
                .copied()
                .collect()
        })
    }

    async fn fetch_summaries(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> AppResult<Vec<Message>> {
        self.begin(FakeOp::FetchSummaries)?;
        let gate = self.fetch_gate.lock().expect("fetch gate").take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        self.folder(account_id, folder, |f| {
            uids.iter()
                .filter_map(|uid| f.messages.get(uid).cloned())
                .collect()
        })
    }

    async fn fetch_raw(&self, account_id: &str, folder: &str, uid: u32) -> AppResult<Vec<u8>> {
        self.begin(FakeOp::FetchRaw)?;
        self.folder(account_id, folder, |f| f.raw.get(&uid).cloned())?
            .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
    }

    async fn move_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome> {
        self.begin(FakeOp::Move)?;
        let partial = self.state.lock().expect("fake state").fail_after_copy.take();
        if let Some(err) = partial {
            self.transfer(account_id, from_folder, uids, to_folder, false)?;
            return Err(err);
        }
        self.transfer(account_id, from_folder, uids, to_folder, true)
    }

    async fn copy_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome> {
        self.begin(FakeOp::Copy)?;
        self.transfer(account_id, from_folder, uids, to_folder, false)
    }

    async fn set_flag(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        flag: &Flag,
        value: bool,
    ) -> AppResult<()> {
        self.begin(FakeOp::SetFlag)?;
        self.folder(account_id, folder, |f| {
            for uid in uids {
                if let Some(message) = f.messages.get_mut(uid) {
                    if value {
                        message.flags.insert(flag.clone());
                    } else {
                        message.flags.remove(flag);
                    }
                }
            }
        })
    }
}
