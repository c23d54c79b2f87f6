//! Container image assets — content hashing of local build contexts.

pub mod hasher;
