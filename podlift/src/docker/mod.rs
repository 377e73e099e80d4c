//! Container engine adapter

pub mod container;
pub mod health;
pub mod image;
