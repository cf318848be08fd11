//! Request store - in-memory registry of ride requests
//!
//! One record per request, keyed by [`RequestId`]. Every mutation runs
//! inside that request's mutex, so each request is single-writer-at-a-time
//! while different requests never contend. The durable backing store is an
//! external collaborator; this registry is the process-local source of
//! truth that the engine reads and mutates through the closures below.
//!
//! The accept/expire tie-break relies on this layer: both transitions
//! enter the same critical section and re-check `status` before applying
//! effects, so exactly one of them commits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core_types::{DriverId, RequestId};
use crate::error::EngineError;
use crate::request::{RequestStatus, RideRequest};

/// Thread-safe ride request registry
pub struct RequestStore {
    requests: DashMap<RequestId, Arc<Mutex<RideRequest>>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
        }
    }

    /// Register a freshly created request
    pub fn insert(&self, request: RideRequest) {
        self.requests
            .insert(request.request_id, Arc::new(Mutex::new(request)));
    }

    /// Clone the current state of a request
    pub fn snapshot(&self, request_id: RequestId) -> Result<RideRequest, EngineError> {
        let entry = self.handle(request_id)?;
        let guard = entry.lock();
        Ok(guard.clone())
    }

    /// Read a request under its lock
    pub fn read<R>(
        &self,
        request_id: RequestId,
        f: impl FnOnce(&RideRequest) -> R,
    ) -> Result<R, EngineError> {
        let entry = self.handle(request_id)?;
        let guard = entry.lock();
        Ok(f(&guard))
    }

    /// Apply a transition inside the request's critical section.
    ///
    /// The closure re-validates status against current state and either
    /// mutates and returns `Ok`, or returns `Err` leaving the record
    /// untouched. `updated_at` is bumped only on success. No await points
    /// may occur inside.
    pub fn update<R>(
        &self,
        request_id: RequestId,
        f: impl FnOnce(&mut RideRequest) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let entry = self.handle(request_id)?;
        let mut guard = entry.lock();
        let result = f(&mut guard)?;
        guard.touch();
        Ok(result)
    }

    /// Compare-and-set on the status field alone. Returns `true` when the
    /// status was one of `expected` and has been replaced by `new`.
    pub fn update_status_if(
        &self,
        request_id: RequestId,
        expected: &[RequestStatus],
        new: RequestStatus,
    ) -> Result<bool, EngineError> {
        self.update(request_id, |req| {
            if expected.contains(&req.status) {
                req.status = new;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    /// Requests whose armed selection timer deadline has passed.
    /// Scanned by the expiry sweeper.
    pub fn find_due_timers(&self, now: DateTime<Utc>) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|entry| {
                let guard = entry.value().lock();
                guard.selection_timer.is_due(now)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Snapshots of requests still open to drivers (non-terminal, not past
    /// the abandonment TTL), newest first.
    pub fn list_open(&self, now: DateTime<Utc>) -> Vec<RideRequest> {
        let mut open: Vec<RideRequest> = self
            .requests
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock();
                (!guard.status.is_terminal() && guard.expires_at > now).then(|| guard.clone())
            })
            .collect();
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        open
    }

    /// A driver's current rides (`matched` or `in_progress`), newest first
    pub fn driver_rides(&self, driver_id: DriverId) -> Vec<RideRequest> {
        let mut rides: Vec<RideRequest> = self
            .requests
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock();
                (guard.assigned_driver == Some(driver_id)
                    && matches!(
                        guard.status,
                        RequestStatus::Matched | RequestStatus::InProgress
                    ))
                .then(|| guard.clone())
            })
            .collect();
        rides.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rides
    }

    /// Drop unpaid pending requests that sailed past their abandonment
    /// TTL without ever arming a timer. Returns the removed IDs.
    pub fn purge_abandoned(&self, now: DateTime<Utc>) -> Vec<RequestId> {
        let doomed: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|entry| {
                let guard = entry.value().lock();
                guard.status == RequestStatus::Pending
                    && !guard.selection_timer.is_active
                    && guard.expires_at <= now
            })
            .map(|entry| *entry.key())
            .collect();
        for id in &doomed {
            self.requests.remove(id);
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn handle(&self, request_id: RequestId) -> Result<Arc<Mutex<RideRequest>>, EngineError> {
        self.requests
            .get(&request_id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::RequestNotFound(request_id))
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}
