//! Job and device descriptions shared by the daemon and its front-ends.

pub mod job;
