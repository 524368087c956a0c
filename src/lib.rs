//! # What is This?
//!
//! _addressable_ is a reference-counted, dependency-aware asynchronous resource loading engine.
//! Users ask for data by `Location`, pluggable providers do the actual loading, and a single
//! `ResourceManager` makes sure every location is loaded at most once per result type, that its
//! dependencies are loaded before it, and that everything is released once nobody needs it.
//!
//! Please read the documents of `res` for more details.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

#[macro_use]
pub mod utils;
pub mod errors;
pub mod res;

pub mod prelude {
    pub use crate::errors::Error;
    pub use crate::res::prelude::*;
}
