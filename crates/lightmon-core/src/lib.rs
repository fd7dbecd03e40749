//! Core of the lightmon connection monitor: the events flowing through it,
//! the container attribution engine and the typed configuration accessors.

pub mod attribution;
pub mod config;
pub mod event;
