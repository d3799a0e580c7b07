//! `karabo-core`
//!
//! Data model of the karabo device runtime: the self-describing [`Hash`]
//! carried on every wire, its binary and XML codecs, schemas with their
//! validator, time stamps, device states and alarm conditions.
//!
//! Nothing in this crate performs I/O or spawns tasks; the runtime crate
//! builds messaging, pipelines and devices on top of it.
//!
//! ## Key Types
//!
//! - [`Hash`]: ordered path → typed value tree with per-node attributes
//! - [`Value`] / [`ValueType`]: the closed set of value types
//! - [`Schema`] / [`Element`]: descriptors for configuration paths
//! - [`Validator`]: coercion and constraint checks against a schema
//! - [`Timestamp`] / [`TimeMixin`]: wall clock plus extrapolated train id
//! - [`State`] / [`StateSignifier`]: state hierarchy and its reduction
//!
//! ## Example
//!
//! ```rust
//! use karabo_core::{binary, hash};
//!
//! let h = hash! { "motor.position" => 1.5f64, "motor.name" => "m1" };
//! let bytes = binary::to_binary(&h).unwrap();
//! assert_eq!(binary::from_binary(&bytes).unwrap(), h);
//! ```

pub mod alarm;
pub mod binary;
pub mod compare;
pub mod error;
pub mod hash;
pub mod json;
pub mod ndarray;
pub mod schema;
pub mod state;
pub mod timestamp;
pub mod types;
pub mod validator;
pub mod value;
pub mod xml;

pub use alarm::{AlarmBounds, AlarmCondition};
pub use compare::{has_changes, hash_has_changes};
pub use error::{CoreError, CoreResult};
pub use hash::{Attributes, Hash, MergePolicy, Node};
pub use ndarray::NDArray;
pub use schema::{AccessMode, Assignment, Element, MetricPrefix, NodeRole, Schema, Unit};
pub use state::{State, StateSignifier};
pub use timestamp::{Epochstamp, TimeMixin, Timestamp, Trainstamp};
pub use types::ValueType;
pub use validator::{ValidationOutcome, ValidationRules, Validator};
pub use value::{FromValue, Value};
