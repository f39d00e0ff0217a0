//! In-memory [`EventStore`] keyed by the same conflict target as Postgres.
//!
//! Used by tests and for running the pipeline without a database. Failures
//! can be injected per table to exercise the retry and dead-letter paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{ChatMessageRecord, EventStore, GiftRecord, StoreError, CHAT_TABLE, GIFT_TABLE};

type Key = (String, String);

/// Remaining failures to inject; `u32::MAX` means "always fail".
#[derive(Debug, Default)]
struct FailureBudget(AtomicU32);

impl FailureBudget {
    fn set(&self, n: u32) {
        self.0.store(n, Ordering::SeqCst);
    }

    /// Consume one failure if any remain.
    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    chats: Mutex<BTreeMap<Key, ChatMessageRecord>>,
    gifts: Mutex<BTreeMap<Key, GiftRecord>>,
    chat_failures: FailureBudget,
    gift_failures: FailureBudget,
    reject_gifts: AtomicBool,
    refused: Mutex<HashSet<String>>,
    calls: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` chat upserts with [`StoreError::Unavailable`].
    pub fn fail_chat_writes(&self, n: u32) {
        self.chat_failures.set(n);
    }

    /// Fail the next `n` gift upserts with [`StoreError::Unavailable`].
    pub fn fail_gift_writes(&self, n: u32) {
        self.gift_failures.set(n);
    }

    /// Fail every write until the budget is reset.
    pub fn fail_always(&self) {
        self.chat_failures.set(u32::MAX);
        self.gift_failures.set(u32::MAX);
    }

    /// Make every gift upsert fail with the permanent [`StoreError::Rejected`].
    pub fn reject_gift_writes(&self, reject: bool) {
        self.reject_gifts.store(reject, Ordering::SeqCst);
    }

    /// Fail any upsert containing `transaction_id` with [`StoreError::Rejected`],
    /// the way one bad row fails a whole Postgres statement.
    pub fn refuse_transaction(&self, transaction_id: &str) {
        lock(&self.refused).insert(transaction_id.to_string());
    }

    fn check_refused<'a>(
        &self,
        table: &str,
        mut transaction_ids: impl Iterator<Item = &'a String>,
    ) -> Result<(), StoreError> {
        let refused = lock(&self.refused);
        match transaction_ids.find(|txn| refused.contains(*txn)) {
            Some(txn) => Err(StoreError::Rejected(format!("{} refused row {}", table, txn))),
            None => Ok(()),
        }
    }

    pub fn chat_messages(&self) -> Vec<ChatMessageRecord> {
        lock(&self.chats).values().cloned().collect()
    }

    pub fn gifts(&self) -> Vec<GiftRecord> {
        lock(&self.gifts).values().cloned().collect()
    }

    /// Number of upsert calls made, successful or not.
    pub fn write_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_chat_messages(&self, rows: &[ChatMessageRecord]) -> Result<u64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.chat_failures.take() {
            return Err(StoreError::Unavailable(format!("{} write failed", CHAT_TABLE)));
        }
        self.check_refused(CHAT_TABLE, rows.iter().map(|r| &r.transaction_id))?;

        let mut chats = lock(&self.chats);
        let mut inserted = 0;
        for row in rows {
            let key = (row.context_id.clone(), row.transaction_id.clone());
            if !chats.contains_key(&key) {
                chats.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_gifts(&self, rows: &[GiftRecord]) -> Result<u64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gift_failures.take() {
            return Err(StoreError::Unavailable(format!("{} write failed", GIFT_TABLE)));
        }
        if self.reject_gifts.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(format!("{} constraint violation", GIFT_TABLE)));
        }
        self.check_refused(GIFT_TABLE, rows.iter().map(|r| &r.transaction_id))?;

        let mut gifts = lock(&self.gifts);
        let mut inserted = 0;
        for row in rows {
            let key = (row.context_id.clone(), row.transaction_id.clone());
            if !gifts.contains_key(&key) {
                gifts.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
