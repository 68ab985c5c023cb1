//! Minimal runtime surface.
//!
//! The full value domain and standard library live in the host runtime; this
//! module carries just enough of it to give the compiled code's scope
//! protocol concrete semantics: boxed values, property-bearing objects with
//! the inline-cache contract, and runtime scope instances.

pub mod object;
pub mod scope;
pub mod value;

pub use object::{InlineCache, PropertyObject};
pub use scope::RuntimeScope;
pub use value::Value;
