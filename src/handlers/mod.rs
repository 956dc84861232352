//! HTTP handlers: carrier webhooks, the media-stream upgrade, and the
//! health probe.

pub mod media_ws;
pub mod webhooks;
