//! Shared vocabulary types for LohkoOS.
//!
//! This crate holds the identifier newtypes and error types used across the
//! kernel and its hardware abstraction layer.

#![no_std]

pub mod error;
pub mod ids;
