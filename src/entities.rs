//! Typed records for each entity kind.
//!
//! Rows arrive from the data source and the push channel as loose JSON.
//! They are validated into these structs at the boundary, so everything
//! downstream works with typed fields.

use crate::error::{Result, SyncError};
use crate::types::EntityKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record kind that a controller can synchronize.
pub trait Record: Clone + Send + Sync + DeserializeOwned + 'static {
    /// Entity kind (and remote table) this record belongs to.
    const KIND: EntityKind;

    /// Stable identifier.
    fn id(&self) -> &str;

    /// Compare only the fields a consumer must react to.
    fn watched_eq(&self, other: &Self) -> bool;

    /// Validate one raw row.
    fn decode(row: Value) -> Result<Self> {
        serde_json::from_value(row).map_err(|e| SyncError::InvalidRecord {
            kind: Self::KIND,
            message: e.to_string(),
        })
    }
}

/// Validate a batch of raw rows, failing on the first bad one.
pub fn decode_rows<T: Record>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter().map(T::decode).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Confirmed,
    Preparing,
    Ready,
    PickedUp,
    Delivered,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// Driver relation embedded in an order row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub assigned_driver_id: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub driver: Option<DriverRef>,
}

impl Record for Order {
    const KIND: EntityKind = EntityKind::Orders;

    fn id(&self) -> &str {
        &self.id
    }

    fn watched_eq(&self, other: &Self) -> bool {
        self.status == other.status && self.assigned_driver_id == other.assigned_driver_id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Available,
    Busy,
    Offline,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: String,
    pub status: DriverStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Record for Driver {
    const KIND: EntityKind = EntityKind::Drivers;

    fn id(&self) -> &str {
        &self.id
    }

    fn watched_eq(&self, other: &Self) -> bool {
        self.status == other.status
    }
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
    pub id: String,
    pub role: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Record for StaffMember {
    const KIND: EntityKind = EntityKind::Staff;

    fn id(&self) -> &str {
        &self.id
    }

    fn watched_eq(&self, other: &Self) -> bool {
        self.role == other.role && self.active == other.active
    }
}

/// Any record, tagged by kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Entity {
    Order(Order),
    Driver(Driver),
    Staff(StaffMember),
}

impl Entity {
    /// Validate a raw row of the given kind.
    pub fn decode(kind: EntityKind, row: Value) -> Result<Self> {
        Ok(match kind {
            EntityKind::Orders => Entity::Order(Order::decode(row)?),
            EntityKind::Drivers => Entity::Driver(Driver::decode(row)?),
            EntityKind::Staff => Entity::Staff(StaffMember::decode(row)?),
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Order(_) => EntityKind::Orders,
            Entity::Driver(_) => EntityKind::Drivers,
            Entity::Staff(_) => EntityKind::Staff,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Order(o) => &o.id,
            Entity::Driver(d) => &d.id,
            Entity::Staff(s) => &s.id,
        }
    }
}
