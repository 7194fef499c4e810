//! sensd-types: Shared data types for sensd provider modules.
//!
//! This crate contains the plain data that both the daemon and provider
//! modules agree on: variable type tags, argument kinds, evaluated values
//! and the C ABI used by natively loaded modules. It has no dependencies so
//! plugin authors can pull it in without dragging the daemon along.

pub mod abi;
pub mod value;
pub mod var_type;

pub use value::Value;
pub use var_type::{ArgKind, VarKind, VarType};
