//! Route modules for the chunk upload server

pub mod health;
pub mod upload;
