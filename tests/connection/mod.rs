//! Connection-level tests against a scripted in-memory peer

mod flow_control;
mod lifecycle;
mod requests;
