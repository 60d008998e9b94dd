//! Adapter handle shared between connection managers.
//!
//! Exactly one manager owns a handle; any number of others reference it.
//! When the owner leaves while referents remain, ownership passes to the
//! oldest referent. The adapter is destroyed when the last holder leaves.

use crate::core::{AppError, Result};
use crate::interface::AdapterHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Last holder left; the adapter was destroyed.
    Destroyed,
    /// The owner left and `new_owner` took over.
    Transferred { new_owner: String, remaining: usize },
    /// A referent left.
    Detached { remaining: usize },
    /// The name did not hold this handle.
    NotAttached,
}

#[derive(Debug, Default)]
struct Holders {
    owner: Option<String>,
    referents: Vec<String>,
}

/// One adapter used by an owning app and any number of referents.
///
/// When the owner leaves while referents remain, the oldest referent becomes
/// the owner. The adapter is destroyed when the last holder releases it.
/// Calls from different holders are not serialized against each other.
pub struct SharedHandle {
    adapter: AdapterHandle,
    holders: Mutex<Holders>,
    destroyed: AtomicBool,
}

impl SharedHandle {
    pub fn new(adapter: AdapterHandle, owner: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            holders: Mutex::new(Holders {
                owner: Some(owner.into()),
                referents: Vec::new(),
            }),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn adapter(&self) -> AdapterHandle {
        Arc::clone(&self.adapter)
    }

    /// Add a referencing manager; returns the new reference count.
    pub fn attach(&self, name: &str) -> Result<usize> {
        let mut holders = self.holders.lock()?;
        if holders.owner.is_none() || self.is_destroyed() {
            return Err(AppError::Configuration(
                "cannot share a connection that has been destroyed".into(),
            ));
        }
        if holders.owner.as_deref() == Some(name) || holders.referents.iter().any(|r| r == name) {
            return Err(AppError::AlreadyRegistered("connection holder", name.to_string()));
        }
        holders.referents.push(name.to_string());
        Ok(holders.referents.len())
    }

    pub async fn release(&self, name: &str) -> Result<Release> {
        let outcome = {
            let mut holders = self.holders.lock()?;
            if holders.owner.as_deref() == Some(name) {
                if holders.referents.is_empty() {
                    holders.owner = None;
                    self.destroyed.store(true, Ordering::Release);
                    Release::Destroyed
                } else {
                    let new_owner = holders.referents.remove(0);
                    holders.owner = Some(new_owner.clone());
                    Release::Transferred {
                        new_owner,
                        remaining: holders.referents.len(),
                    }
                }
            } else if let Some(pos) = holders.referents.iter().position(|r| r == name) {
                holders.referents.remove(pos);
                Release::Detached {
                    remaining: holders.referents.len(),
                }
            } else {
                Release::NotAttached
            }
        };

        match &outcome {
            Release::Destroyed => {
                self.adapter.destroy().await?;
                event!(Level::INFO, holder = name, driver = self.adapter.driver(), "connection destroyed");
            }
            Release::Transferred { new_owner, remaining } => {
                event!(Level::INFO, from = name, to = %new_owner, remaining, "connection ownership transferred");
            }
            Release::Detached { remaining } => {
                event!(Level::DEBUG, holder = name, remaining, "connection reference released");
            }
            Release::NotAttached => {
                event!(Level::WARN, holder = name, "release from a manager that does not hold the connection");
            }
        }
        Ok(outcome)
    }

    pub fn owner(&self) -> Option<String> {
        self.holders.lock().ok().and_then(|h| h.owner.clone())
    }

    pub fn referents(&self) -> Vec<String> {
        self.holders
            .lock()
            .map(|h| h.referents.clone())
            .unwrap_or_default()
    }

    pub fn ref_count(&self) -> usize {
        self.holders.lock().map(|h| h.referents.len()).unwrap_or(0)
    }

    pub fn is_owned_by(&self, name: &str) -> bool {
        self.owner().as_deref() == Some(name)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}
