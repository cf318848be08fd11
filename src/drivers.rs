//! Driver directory
//!
//! Profiles, availability, and aggregate ride stats. Authentication is an
//! external concern; the engine trusts the [`DriverId`] it is handed and
//! this directory answers what that driver currently charges and whether
//! they can take a ride.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::DriverId;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleKind {
    Sedan,
    Suv,
    Truck,
    Motorcycle,
    Other,
}

impl fmt::Display for VehicleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VehicleKind::Sedan => "sedan",
            VehicleKind::Suv => "suv",
            VehicleKind::Truck => "truck",
            VehicleKind::Motorcycle => "motorcycle",
            VehicleKind::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub kind: VehicleKind,
    pub model: String,
    pub plate: String,
}

/// Registered driver profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub driver_id: DriverId,
    pub name: String,
    pub phone: String,
    pub vehicle: VehicleInfo,
    pub hourly_rate: Decimal,
    pub is_available: bool,
    pub rating: Decimal,
    pub total_rides: u64,
    pub total_earnings: Decimal,
    pub last_active_at: DateTime<Utc>,
}

/// Profile data supplied at registration
#[derive(Debug, Clone)]
pub struct DriverProfile {
    pub name: String,
    pub phone: String,
    pub vehicle: VehicleInfo,
    pub hourly_rate: Decimal,
}

/// Thread-safe driver registry
pub struct DriverDirectory {
    drivers: DashMap<DriverId, Driver>,
    next_id: AtomicU64,
}

impl DriverDirectory {
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a driver; new drivers start available with a 5.0 rating.
    pub fn register(&self, profile: DriverProfile) -> DriverId {
        let driver_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let driver = Driver {
            driver_id,
            name: profile.name,
            phone: profile.phone,
            vehicle: profile.vehicle,
            hourly_rate: profile.hourly_rate,
            is_available: true,
            rating: Decimal::from(5),
            total_rides: 0,
            total_earnings: Decimal::ZERO,
            last_active_at: Utc::now(),
        };
        self.drivers.insert(driver_id, driver);
        tracing::info!(driver_id, "Driver registered");
        driver_id
    }

    pub fn get(&self, driver_id: DriverId) -> Result<Driver, EngineError> {
        self.drivers
            .get(&driver_id)
            .map(|d| d.clone())
            .ok_or(EngineError::DriverNotFound(driver_id))
    }

    pub fn hourly_rate(&self, driver_id: DriverId) -> Result<Decimal, EngineError> {
        self.drivers
            .get(&driver_id)
            .map(|d| d.hourly_rate)
            .ok_or(EngineError::DriverNotFound(driver_id))
    }

    pub fn is_available(&self, driver_id: DriverId) -> Result<bool, EngineError> {
        self.drivers
            .get(&driver_id)
            .map(|d| d.is_available)
            .ok_or(EngineError::DriverNotFound(driver_id))
    }

    /// Taken by acceptance: the driver holds the matched ride
    pub fn mark_unavailable(&self, driver_id: DriverId) -> Result<(), EngineError> {
        self.with_driver(driver_id, |d| {
            d.is_available = false;
            d.last_active_at = Utc::now();
        })
    }

    /// Released by cancellation or after the ride ends
    pub fn mark_available(&self, driver_id: DriverId) -> Result<(), EngineError> {
        self.with_driver(driver_id, |d| {
            d.is_available = true;
            d.last_active_at = Utc::now();
        })
    }

    /// Drivers adjust their advertised rate; offers already submitted keep
    /// the rate they were made at.
    pub fn set_hourly_rate(&self, driver_id: DriverId, rate: Decimal) -> Result<(), EngineError> {
        self.with_driver(driver_id, |d| {
            d.hourly_rate = rate;
            d.last_active_at = Utc::now();
        })
    }

    /// Completion bookkeeping: bump ride count and earnings, release the
    /// driver back into the pool.
    pub fn record_completed_ride(
        &self,
        driver_id: DriverId,
        earnings: Decimal,
    ) -> Result<(), EngineError> {
        self.with_driver(driver_id, |d| {
            d.total_rides += 1;
            d.total_earnings += earnings;
            d.is_available = true;
            d.last_active_at = Utc::now();
        })
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    fn with_driver(
        &self,
        driver_id: DriverId,
        f: impl FnOnce(&mut Driver),
    ) -> Result<(), EngineError> {
        let mut entry = self
            .drivers
            .get_mut(&driver_id)
            .ok_or(EngineError::DriverNotFound(driver_id))?;
        f(&mut entry);
        Ok(())
    }
}

impl Default for DriverDirectory {
    fn default() -> Self {
        Self::new()
    }
}
