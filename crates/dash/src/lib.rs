//! Terminal front end for the Lucas-Lehmer progress dashboard.

pub mod config;
pub mod render;
