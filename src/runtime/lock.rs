//! Per-workspace mutual exclusion.
//!
//! One holder at a time per slug. Waiters queue in FIFO order and wake on
//! release or when the current holder's TTL runs out. An expired holder is
//! reclaimed lazily by the next waiter, so a crashed actor never wedges a
//! workspace for longer than its TTL.
//!
//! The in-process table is authoritative. The optional `.pdd.lock` file in
//! the workspace root is advisory output for humans and other tools only.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

pub const LOCK_FILE_NAME: &str = ".pdd.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for workspace `{slug}` (held by {})", holder.as_deref().unwrap_or("nobody"))]
    Timeout {
        slug: String,
        holder: Option<String>,
        waited_ms: u64,
    },
    #[error("lock on workspace `{slug}` is no longer held by this token")]
    Lost { slug: String },
}

/// Proof of ownership returned by [`WorkspaceLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub slug: String,
    pub holder_id: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Snapshot of a live holder, as reported by [`WorkspaceLock::holder`] and
/// written to the advisory lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub holder_id: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Holder {
    info: LockHolder,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    holder: Option<Holder>,
    queue: VecDeque<u64>,
    next_ticket: u64,
    notify: Arc<Notify>,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.queue.is_empty()
    }

    /// Drop the holder if its TTL has run out. Returns the reclaimed holder.
    fn reclaim_expired(&mut self, now: Instant) -> Option<LockHolder> {
        let expired = self.holder.as_ref().is_some_and(|h| h.deadline <= now);
        if !expired {
            return None;
        }
        self.notify.notify_waiters();
        self.holder.take().map(|h| h.info)
    }
}

#[derive(Debug, Default)]
pub struct WorkspaceLock {
    slots: Mutex<HashMap<String, Slot>>,
    lock_dir: Option<PathBuf>,
}

impl WorkspaceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also mirror the holder into `<base_dir>/<slug>/.pdd.lock`.
    pub fn with_lock_files(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            lock_dir: Some(base_dir.into()),
        }
    }

    /// Wait up to `wait` for exclusive ownership of `slug`.
    pub async fn acquire(
        &self,
        slug: &str,
        holder_id: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        let started = Instant::now();
        let deadline = started + wait;

        let (ticket, notify) = {
            let mut slots = self.slots.lock().expect("workspace lock mutex poisoned");
            let slot = slots.entry(slug.to_string()).or_default();
            let ticket = slot.next_ticket;
            slot.next_ticket += 1;
            slot.queue.push_back(ticket);
            (ticket, slot.notify.clone())
        };
        let mut waiter = Waiter {
            lock: self,
            slug,
            ticket,
            queued: true,
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (wake_at, current_holder) = {
                let mut slots = self.slots.lock().expect("workspace lock mutex poisoned");
                let slot = slots.entry(slug.to_string()).or_default();
                if !slot.queue.contains(&ticket) {
                    slot.queue.push_front(ticket);
                }

                if let Some(expired) = slot.reclaim_expired(now) {
                    tracing::warn!(
                        slug,
                        holder = %expired.holder_id,
                        "reclaiming workspace lock after ttl expiry"
                    );
                    self.remove_lock_file(slug);
                }

                if slot.holder.is_none() && slot.queue.front() == Some(&ticket) {
                    slot.queue.pop_front();
                    waiter.queued = false;

                    let acquired_at = Utc::now();
                    let info = LockHolder {
                        holder_id: holder_id.to_string(),
                        token: Uuid::new_v4(),
                        acquired_at,
                        expires_at: acquired_at + chrono_ttl(ttl),
                    };
                    slot.holder = Some(Holder {
                        info: info.clone(),
                        deadline: now + ttl,
                    });
                    // Waiters behind us recompute their wake-up from the new holder's TTL.
                    slot.notify.notify_waiters();
                    drop(slots);

                    self.write_lock_file(slug, &info);
                    tracing::debug!(
                        slug,
                        holder = holder_id,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "workspace lock acquired"
                    );
                    return Ok(LockToken {
                        slug: slug.to_string(),
                        holder_id: info.holder_id,
                        token: info.token,
                        acquired_at: info.acquired_at,
                    });
                }

                let wake_at = slot
                    .holder
                    .as_ref()
                    .map(|h| h.deadline.min(deadline))
                    .unwrap_or(deadline);
                let current = slot.holder.as_ref().map(|h| h.info.holder_id.clone());
                (wake_at, current)
            };

            if now >= deadline {
                tracing::debug!(slug, holder = holder_id, "workspace lock wait timed out");
                return Err(LockError::Timeout {
                    slug: slug.to_string(),
                    holder: current_holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but returns a guard that releases on drop.
    pub async fn acquire_guard(
        &self,
        slug: &str,
        holder_id: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockGuard<'_>, LockError> {
        let token = self.acquire(slug, holder_id, ttl, wait).await?;
        Ok(LockGuard {
            lock: self,
            token,
            released: false,
        })
    }

    /// Release the lock held by `token`.
    ///
    /// Fails with [`LockError::Lost`] when the token no longer owns the lock,
    /// i.e. it expired and somebody else reclaimed it.
    pub fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut slots = self.slots.lock().expect("workspace lock mutex poisoned");
        let Some(slot) = slots.get_mut(&token.slug) else {
            return Err(LockError::Lost {
                slug: token.slug.clone(),
            });
        };
        let owns = slot
            .holder
            .as_ref()
            .is_some_and(|h| h.info.token == token.token);
        if !owns {
            return Err(LockError::Lost {
                slug: token.slug.clone(),
            });
        }

        slot.holder = None;
        slot.notify.notify_waiters();
        if slot.is_idle() {
            slots.remove(&token.slug);
        }
        drop(slots);

        self.remove_lock_file(&token.slug);
        tracing::debug!(slug = %token.slug, holder = %token.holder_id, "workspace lock released");
        Ok(())
    }

    /// Extend a live lock so it expires `ttl` from now.
    pub fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("workspace lock mutex poisoned");
        let lost = || LockError::Lost {
            slug: token.slug.clone(),
        };
        let slot = slots.get_mut(&token.slug).ok_or_else(lost)?;
        if slot.reclaim_expired(now).is_some() {
            drop(slots);
            self.remove_lock_file(&token.slug);
            return Err(lost());
        }

        let holder = slot
            .holder
            .as_mut()
            .filter(|h| h.info.token == token.token)
            .ok_or_else(lost)?;
        holder.deadline = now + ttl;
        holder.info.expires_at = Utc::now() + chrono_ttl(ttl);
        let info = holder.info.clone();
        slot.notify.notify_waiters();
        drop(slots);

        self.write_lock_file(&token.slug, &info);
        Ok(())
    }

    /// Current live holder of `slug`, if any.
    pub fn holder(&self, slug: &str) -> Option<LockHolder> {
        let now = Instant::now();
        let slots = self.slots.lock().expect("workspace lock mutex poisoned");
        slots
            .get(slug)
            .and_then(|slot| slot.holder.as_ref())
            .filter(|h| h.deadline > now)
            .map(|h| h.info.clone())
    }

    /// Operator unlock: drop whoever holds `slug` and wake the queue.
    pub fn force_release(&self, slug: &str) -> Option<LockHolder> {
        let mut slots = self.slots.lock().expect("workspace lock mutex poisoned");
        let slot = slots.get_mut(slug)?;
        let previous = slot.holder.take().map(|h| h.info);
        slot.notify.notify_waiters();
        if slot.is_idle() {
            slots.remove(slug);
        }
        drop(slots);

        self.remove_lock_file(slug);
        if let Some(previous) = &previous {
            tracing::warn!(slug, holder = %previous.holder_id, "workspace lock force-released");
        }
        previous
    }

    fn dequeue(&self, slug: &str, ticket: u64) {
        let mut slots = self.slots.lock().expect("workspace lock mutex poisoned");
        if let Some(slot) = slots.get_mut(slug) {
            slot.queue.retain(|t| *t != ticket);
            slot.notify.notify_waiters();
            if slot.is_idle() {
                slots.remove(slug);
            }
        }
    }

    fn lock_file_path(&self, slug: &str) -> Option<PathBuf> {
        let root = self.lock_dir.as_ref()?.join(slug);
        root.is_dir().then(|| root.join(LOCK_FILE_NAME))
    }

    fn write_lock_file(&self, slug: &str, info: &LockHolder) {
        let Some(path) = self.lock_file_path(slug) else {
            return;
        };
        let result = serde_json::to_vec_pretty(info)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(&path, bytes));
        if let Err(error) = result {
            tracing::debug!(slug, path = %path.display(), "failed to write lock file: {error}");
        }
    }

    fn remove_lock_file(&self, slug: &str) {
        if let Some(path) = self.lock_file_path(slug) {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Removes a queued ticket if `acquire` is abandoned (timeout, cancellation).
struct Waiter<'a> {
    lock: &'a WorkspaceLock,
    slug: &'a str,
    ticket: u64,
    queued: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.queued {
            self.lock.dequeue(self.slug, self.ticket);
        }
    }
}

/// Releases the workspace lock when dropped, including during unwinding.
pub struct LockGuard<'a> {
    lock: &'a WorkspaceLock,
    token: LockToken,
    released: bool,
}

impl LockGuard<'_> {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn renew(&self, ttl: Duration) -> Result<(), LockError> {
        self.lock.renew(&self.token, ttl)
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release(&self.token)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(error) = self.lock.release(&self.token) {
            tracing::warn!(slug = %self.token.slug, "lock guard release failed: {error}");
        }
    }
}
