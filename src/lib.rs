//! Aberred event bus library.
//!
//! This crate exposes the engine's publish/subscribe core: the [`event::Bus`]
//! that lets subsystems (input, physics, collision, rendering, audio) talk
//! through typed events, the [`event::CallerMap`] entity registry, the bus
//! [`config`], and a headless [`demo`] scene exercising all of it.

pub mod config;
pub mod demo;
pub mod event;
