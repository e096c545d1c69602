//! Admission gate bounding the number of concurrently running processes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// What a call does when every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for a slot, at most the call's timeout.
    #[default]
    Queue,
    /// Fail with `Busy` immediately.
    Reject,
}

/// A held process slot. Released on drop.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    waited: Duration,
}

impl Permit {
    /// Time spent queued before the slot was granted. Zero when it was free.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
}

impl AdmissionGate {
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Acquire a slot according to the policy. `None` means busy.
    pub async fn admit(&self, max_wait: Duration) -> Option<Permit> {
        match self.policy {
            AdmissionPolicy::Reject => self.try_admit(),
            AdmissionPolicy::Queue => {
                if let Some(permit) = self.try_admit() {
                    return Some(permit);
                }
                let queued = Instant::now();
                match tokio::time::timeout(max_wait, self.semaphore.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => Some(Permit {
                        _permit: permit,
                        waited: queued.elapsed(),
                    }),
                    // Closed semaphore or wait exceeded.
                    _ => None,
                }
            }
        }
    }

    pub fn try_admit(&self) -> Option<Permit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit {
                _permit: permit,
                waited: Duration::ZERO,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_policy_fails_fast() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Reject);
        let held = gate.admit(Duration::from_secs(5)).await;
        assert!(held.is_some());
        assert_eq!(gate.in_flight(), 1);

        let started = std::time::Instant::now();
        assert!(gate.admit(Duration::from_secs(5)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(held);
        assert_eq!(gate.available(), 1);
        assert!(gate.admit(Duration::from_secs(5)).await.is_some());
    }

    #[tokio::test]
    async fn test_queue_policy_waits_for_release() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Queue);
        let held = gate.admit(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit(Duration::from_secs(5)).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_permit_reports_queue_wait() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Queue);
        let held = gate.admit(Duration::from_secs(1)).await.unwrap();
        assert_eq!(held.waited(), Duration::ZERO);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit(Duration::from_secs(5)).await.map(|p| p.waited()) })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(held);
        let waited = waiter.await.unwrap().unwrap();
        assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_queue_policy_gives_up_after_max_wait() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Queue);
        let _held = gate.admit(Duration::from_secs(1)).await.unwrap();
        assert!(gate.admit(Duration::from_millis(50)).await.is_none());
    }

    #[test]
    fn test_policy_serde() {
        let policy: AdmissionPolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(policy, AdmissionPolicy::Reject);
        assert_eq!(AdmissionPolicy::default(), AdmissionPolicy::Queue);
    }
}
